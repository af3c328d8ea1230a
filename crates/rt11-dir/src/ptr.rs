//! Bidirectional cursor over directory entries.

use rt11_block::BlockHandle;
use rt11_types::{
    Sector, E_EOS, EXTRA_BYTES, ENTRY_LENGTH, FIRST_ENTRY_OFFSET, NEXT_SEGMENT, SEGMENT_BYTES,
    SEGMENT_DATA_BLOCK, STATUS_WORD, TOTAL_LENGTH_WORD,
};
use serde::{Deserialize, Serialize};

/// A `(segment, index)` position of a live directory entry.
///
/// Segments are one-based; entry indexes are zero-based within their
/// segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirPos {
    pub segment: u16,
    pub index: u16,
}

impl std::fmt::Display for DirPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.segment, self.index)
    }
}

const BEFORE_START: i32 = -1;
const AFTER_END: i32 = 0; // matches the chain's zero terminator

/// A cursor over directory entries.
///
/// Carries the entry's `(segment, index)` plus the derived first data
/// sector of the referenced file, which is maintained incrementally on
/// forward steps and recomputed exactly on backward ones. Two sentinel
/// positions exist: "before start" (a fresh scan) and "after end" (walked
/// off the chain).
///
/// This is deliberately not an `Iterator`: callers observe the sentinel
/// states and jump around arbitrarily, and the cursor doubles as the write
/// path to its entry's fields.
#[derive(Debug, Clone)]
pub struct DirPtr {
    dirblk: BlockHandle,
    entry_size: usize,
    segment: i32,
    index: usize,
    segbase: usize,
    datasec: u32,
}

impl DirPtr {
    /// A cursor positioned just before the first entry of segment 1.
    pub(crate) fn new(dirblk: &BlockHandle) -> Self {
        Self {
            dirblk: dirblk.clone(),
            entry_size: ENTRY_LENGTH + dirblk.word(EXTRA_BYTES) as usize,
            segment: BEFORE_START,
            index: 0,
            segbase: 0,
            datasec: u32::from(dirblk.word(SEGMENT_DATA_BLOCK)),
        }
    }

    #[must_use]
    pub fn before_start(&self) -> bool {
        self.segment == BEFORE_START
    }

    #[must_use]
    pub fn after_end(&self) -> bool {
        self.segment == AFTER_END
    }

    /// True when the cursor references an actual entry.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.before_start() && !self.after_end()
    }

    /// The referenced position, or `None` at either sentinel.
    #[must_use]
    pub fn position(&self) -> Option<DirPos> {
        self.is_valid().then(|| DirPos {
            segment: self.segment as u16,
            index: self.index as u16,
        })
    }

    pub(crate) fn segment_number(&self) -> u16 {
        debug_assert!(self.is_valid());
        self.segment as u16
    }

    pub(crate) fn index(&self) -> usize {
        debug_assert!(self.is_valid());
        self.index
    }

    /// Byte offset of `delta` within the referenced entry, relative to the
    /// start of the directory block.
    pub(crate) fn offset(&self, delta: usize) -> usize {
        self.segbase + FIRST_ENTRY_OFFSET + self.index * self.entry_size + delta
    }

    /// Read a word from the referenced entry.
    #[must_use]
    pub fn word(&self, field: usize) -> u16 {
        self.dirblk.word(self.offset(field))
    }

    /// Store a word into the referenced entry.
    pub fn set_word(&self, field: usize, value: u16) {
        self.dirblk.set_word(self.offset(field), value);
    }

    #[must_use]
    pub fn byte(&self, field: usize) -> u8 {
        self.dirblk.byte(self.offset(field))
    }

    pub fn set_byte(&self, field: usize, value: u8) {
        self.dirblk.set_byte(self.offset(field), value);
    }

    /// Read a word from the header of the segment containing this entry.
    #[must_use]
    pub fn segment_word(&self, field: usize) -> u16 {
        debug_assert!(self.is_valid());
        self.dirblk.word(self.segbase + field)
    }

    /// Store a word into the header of the segment containing this entry.
    pub fn set_segment_word(&self, field: usize, value: u16) {
        debug_assert!(self.is_valid());
        self.dirblk.set_word(self.segbase + field, value);
    }

    /// Test the status word for bits; all bits in `mask` must be set.
    #[must_use]
    pub fn has_status(&self, mask: u16) -> bool {
        self.is_valid() && self.word(STATUS_WORD) & mask == mask
    }

    /// The entry's length in sectors.
    #[must_use]
    pub fn length_sectors(&self) -> u16 {
        self.word(TOTAL_LENGTH_WORD)
    }

    /// First data sector of the referenced file.
    #[must_use]
    pub fn data_sector(&self) -> Sector {
        Sector(self.datasec)
    }

    /// Step to the next entry, crossing segment boundaries at end-of-segment
    /// markers. Returns whether the cursor still references an entry.
    pub fn advance(&mut self) -> bool {
        self.increment();
        self.is_valid()
    }

    /// Step to the previous entry. Returns whether the cursor still
    /// references an entry.
    pub fn retreat(&mut self) -> bool {
        self.decrement();
        self.is_valid()
    }

    /// The following entry; the cursor itself is not moved.
    #[must_use]
    pub fn next(&self) -> DirPtr {
        let mut next = self.clone();
        next.increment();
        next
    }

    /// The preceding entry; the cursor itself is not moved.
    #[must_use]
    pub fn prev(&self) -> DirPtr {
        let mut prev = self.clone();
        prev.decrement();
        prev
    }

    /// The end-of-segment marker of the segment containing this entry.
    pub(crate) fn end_of_segment(&self) -> DirPtr {
        debug_assert!(self.is_valid());
        let mut eos = self.clone();
        while !eos.has_status(E_EOS) {
            eos.increment();
        }
        eos
    }

    /// A cursor for slot arithmetic within the same segment. The derived
    /// data sector is not meaningful on the result.
    pub(crate) fn with_index(&self, index: usize) -> DirPtr {
        debug_assert!(self.is_valid());
        let mut slot = self.clone();
        slot.index = index;
        slot
    }

    fn set_segment(&mut self, segment: u16) {
        self.segment = i32::from(segment);
        self.segbase = (segment as usize - 1) * SEGMENT_BYTES;
    }

    fn enter_segment(&mut self, segment: u16) {
        self.set_segment(segment);
        self.index = 0;
        self.datasec = u32::from(self.dirblk.word(self.segbase + SEGMENT_DATA_BLOCK));
    }

    fn increment(&mut self) {
        if self.after_end() {
            return;
        }

        if self.before_start() {
            self.enter_segment(1);
            return;
        }

        if self.word(STATUS_WORD) & E_EOS == 0 {
            self.datasec += u32::from(self.length_sectors());
            self.index += 1;
            return;
        }

        // at the end-of-segment marker: follow the chain
        let next = self.segment_word(NEXT_SEGMENT);
        if next == 0 {
            self.segment = AFTER_END;
            return;
        }
        self.enter_segment(next);
    }

    fn decrement(&mut self) {
        if self.before_start() {
            return;
        }

        if self.after_end() {
            // walk the chain to the last segment, then scan to its marker
            let mut segment = 1;
            loop {
                let base = (segment as usize - 1) * SEGMENT_BYTES;
                let next = self.dirblk.word(base + NEXT_SEGMENT);
                if next == 0 {
                    break;
                }
                segment = next;
            }
            self.enter_segment(segment);
            while self.word(STATUS_WORD) & E_EOS == 0 {
                self.increment();
            }
            return;
        }

        if self.index > 0 {
            self.index -= 1;
            self.datasec -= u32::from(self.length_sectors());
            return;
        }

        if self.segment == 1 {
            self.segment = BEFORE_START;
            return;
        }

        // at the start of a segment: find the predecessor in the chain and
        // scan to its end-of-segment marker
        let target = self.segment as u16;
        let mut segment = 1;
        loop {
            let base = (segment as usize - 1) * SEGMENT_BYTES;
            let next = self.dirblk.word(base + NEXT_SEGMENT);
            debug_assert_ne!(next, 0, "segment {target} is not on the chain");
            if next == target {
                break;
            }
            segment = next;
        }
        self.enter_segment(segment);
        while self.word(STATUS_WORD) & E_EOS == 0 {
            self.increment();
        }
    }
}
