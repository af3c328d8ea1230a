//! The directory proper: mount validation, lookup, statistics, and the
//! structural mutators.

use crate::ptr::{DirPos, DirPtr};
use crate::tracker::{ChangeTracker, DirMove};
use chrono::{DateTime, Utc};
use rt11_block::{BlockCache, BlockHandle};
use rt11_error::{Result, Rt11Error};
use rt11_types::{
    date, rad50, Rad50Name, Sector, CHANNEL_BYTE, CREATION_DATE_WORD, ENTRY_LENGTH, EXTRA_BYTES,
    E_EOS, E_MPTY, E_PERM, E_TENT, FILENAME_WORDS, FIRST_ENTRY_OFFSET, FIRST_SEGMENT_SECTOR,
    HIGHEST_SEGMENT, JOB_BYTE, NEXT_SEGMENT, SECTORS_PER_SEGMENT, SECTOR_SIZE, SEGMENT_BYTES,
    SEGMENT_DATA_BLOCK, STATUS_WORD, TOTAL_LENGTH_WORD, TOTAL_SEGMENTS,
};
use std::rc::Rc;
use tracing::{debug, trace};

/// A directory entry in the form handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirEnt {
    /// Raw status word.
    pub status: u16,
    /// The filename as stored on disk.
    pub rad50_name: Rad50Name,
    /// Printable, whitespace-trimmed filename.
    pub name: String,
    /// File length in bytes (always a whole number of sectors).
    pub length: u64,
    /// First data sector.
    pub sector0: Sector,
    /// Decoded creation date, if the entry carries one.
    pub created: Option<DateTime<Utc>>,
}

/// Volume statistics in `statfs` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FsStats {
    pub block_size: u32,
    pub name_max: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub avail_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
}

/// The on-disk directory of a mounted volume.
///
/// Holds the single directory block (all segments, contiguous from sector
/// 6) for the lifetime of the mount.
pub struct Directory {
    cache: Rc<BlockCache>,
    dirblk: BlockHandle,
    entry_size: usize,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("segments", &self.total_segments())
            .field("entry_size", &self.entry_size)
            .finish()
    }
}

impl Directory {
    /// Read and validate the directory of a freshly attached volume.
    ///
    /// Any inconsistency is a fatal mount error: an out-of-range segment
    /// count, disagreeing `extra-bytes` words, a chain pointer past the
    /// allocated count, a chain that never terminates, or a segment with no
    /// end-of-segment marker.
    pub fn open(cache: Rc<BlockCache>) -> Result<Self> {
        let sectors = cache.volume_sectors();
        if sectors <= FIRST_SEGMENT_SECTOR {
            return Err(Rt11Error::Corrupt(format!(
                "volume of {sectors} sectors has no room for a directory"
            )));
        }

        let max_segments = (sectors - FIRST_SEGMENT_SECTOR) / SECTORS_PER_SEGMENT;
        let dirblk = cache.get_block(Sector(FIRST_SEGMENT_SECTOR), 1)?;
        let total = dirblk.word(TOTAL_SEGMENTS);
        if total == 0 || u32::from(total) >= max_segments {
            return Err(Rt11Error::Corrupt(format!(
                "directory segment count {total} invalid for a {sectors}-sector volume"
            )));
        }

        cache.resize_block(&dirblk, total as usize * SECTORS_PER_SEGMENT as usize)?;

        let extra = dirblk.word(EXTRA_BYTES);
        let entry_size = ENTRY_LENGTH + extra as usize;
        if (SEGMENT_BYTES - FIRST_ENTRY_OFFSET) / entry_size < 2 {
            return Err(Rt11Error::Corrupt(format!(
                "{extra} extra bytes per entry leaves no room for entries"
            )));
        }
        let max_entries = (SEGMENT_BYTES - FIRST_ENTRY_OFFSET) / entry_size;

        // Walk the chain: extra-bytes must agree everywhere, pointers must
        // stay in range, the chain must terminate, and every segment on it
        // must contain an end-of-segment marker.
        let mut segment = 1_u16;
        let mut steps = 0_u16;
        loop {
            let base = (usize::from(segment) - 1) * SEGMENT_BYTES;
            if dirblk.word(base + EXTRA_BYTES) != extra {
                return Err(Rt11Error::Corrupt(
                    "directory segments disagree on extra bytes".to_owned(),
                ));
            }

            let mut terminated = false;
            for index in 0..max_entries {
                let status = dirblk.word(base + FIRST_ENTRY_OFFSET + index * entry_size);
                if status & E_EOS != 0 {
                    terminated = true;
                    break;
                }
            }
            if !terminated {
                return Err(Rt11Error::Corrupt(format!(
                    "directory segment {segment} is unterminated"
                )));
            }

            let next = dirblk.word(base + NEXT_SEGMENT);
            if next == 0 {
                break;
            }
            if next > total {
                return Err(Rt11Error::Corrupt(format!(
                    "segment chain pointer {next} exceeds segment count {total}"
                )));
            }
            steps += 1;
            if steps >= total {
                return Err(Rt11Error::Corrupt(
                    "directory segment chain does not terminate".to_owned(),
                ));
            }
            segment = next;
        }

        debug!(
            target: "rt11::dir",
            event = "mount",
            segments = total,
            extra_bytes = extra,
        );

        Ok(Self {
            cache,
            dirblk,
            entry_size,
        })
    }

    /// Size of one entry on this volume, including extra bytes.
    #[must_use]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Total directory segments allocated at format time.
    #[must_use]
    pub fn total_segments(&self) -> u16 {
        self.dirblk.word(TOTAL_SEGMENTS)
    }

    /// Entry slots per segment, including the end-of-segment slot.
    #[must_use]
    pub fn max_entries_per_segment(&self) -> usize {
        (SEGMENT_BYTES - FIRST_ENTRY_OFFSET) / self.entry_size
    }

    /// A cursor positioned just before the first entry; step it forward
    /// before dereferencing.
    #[must_use]
    pub fn start_scan(&self) -> DirPtr {
        DirPtr::new(&self.dirblk)
    }

    /// A cursor for a known live position, with its data sector recomputed
    /// exactly.
    pub fn pointer_at(&self, pos: DirPos) -> Result<DirPtr> {
        let mut ptr = self.start_scan();
        while ptr.advance() {
            if ptr.position() == Some(pos) {
                return Ok(ptr);
            }
        }
        Err(Rt11Error::InvalidArgument(format!(
            "no directory entry at {pos}"
        )))
    }

    /// Advance `ptr` until an entry has any of the bits in `mask` set.
    pub fn move_next_filtered(&self, ptr: &mut DirPtr, mask: u16) -> bool {
        while ptr.advance() {
            if ptr.word(STATUS_WORD) & mask != 0 {
                return true;
            }
        }
        false
    }

    /// Find the entry for a printable filename.
    pub fn get_ent(&self, name: &str) -> Result<DirEnt> {
        let rad50 = rad50::parse_filename(name)
            .ok_or_else(|| Rt11Error::InvalidName(name.to_owned()))?;
        let ptr = self.locate(&rad50);
        self.entry_at(&ptr)
            .ok_or_else(|| Rt11Error::NotFound(name.to_owned()))
    }

    /// Scan for the first entry whose name words match, skipping only
    /// end-of-segment markers. Internal callers use this to find any
    /// matching slot; the cursor is "after end" when nothing matched.
    #[must_use]
    pub fn locate(&self, name: &Rad50Name) -> DirPtr {
        let mut ptr = self.start_scan();
        while ptr.advance() {
            if ptr.has_status(E_EOS) {
                continue;
            }
            if ptr.word(FILENAME_WORDS) == name[0]
                && ptr.word(FILENAME_WORDS + 2) == name[1]
                && ptr.word(FILENAME_WORDS + 4) == name[2]
            {
                break;
            }
        }
        ptr
    }

    /// Find a live file entry by printable name, skipping free slots and
    /// end-of-segment markers.
    pub fn lookup(&self, name: &str) -> Result<DirPtr> {
        let rad50 = rad50::parse_filename(name)
            .ok_or_else(|| Rt11Error::InvalidName(name.to_owned()))?;
        let mut ptr = self.start_scan();
        while ptr.advance() {
            if ptr.has_status(E_EOS) || ptr.has_status(E_MPTY) {
                continue;
            }
            if ptr.word(FILENAME_WORDS) == rad50[0]
                && ptr.word(FILENAME_WORDS + 2) == rad50[1]
                && ptr.word(FILENAME_WORDS + 4) == rad50[2]
            {
                return Ok(ptr);
            }
        }
        Err(Rt11Error::NotFound(name.to_owned()))
    }

    /// Synthesize the caller-facing view of the referenced entry.
    #[must_use]
    pub fn entry_at(&self, ptr: &DirPtr) -> Option<DirEnt> {
        if !ptr.is_valid() {
            return None;
        }

        let rad50_name = [
            ptr.word(FILENAME_WORDS),
            ptr.word(FILENAME_WORDS + 2),
            ptr.word(FILENAME_WORDS + 4),
        ];

        Some(DirEnt {
            status: ptr.word(STATUS_WORD),
            rad50_name,
            name: rad50::format_filename(&rad50_name),
            length: u64::from(ptr.length_sectors()) * SECTOR_SIZE as u64,
            sector0: ptr.data_sector(),
            created: date::decode_to_time(ptr.word(CREATION_DATE_WORD)),
        })
    }

    /// Volume statistics. One entry slot per segment is reserved for the
    /// end-of-segment marker and not counted as a file slot.
    #[must_use]
    pub fn statfs(&self) -> FsStats {
        let segments = u64::from(self.total_segments());
        let per_segment = (self.max_entries_per_segment() - 1) as u64;
        let total_files = per_segment * segments;

        let mut used_files = 0_u64;
        let mut free_blocks = 0_u64;
        let mut ptr = self.start_scan();
        while ptr.advance() {
            let status = ptr.word(STATUS_WORD);
            if status & E_MPTY != 0 {
                free_blocks += u64::from(ptr.length_sectors());
            } else if status & E_EOS == 0 {
                used_files += 1;
            }
        }

        FsStats {
            block_size: SECTOR_SIZE as u32,
            name_max: 10,
            total_blocks: u64::from(self.cache.volume_sectors())
                - (u64::from(FIRST_SEGMENT_SECTOR) + segments * u64::from(SECTORS_PER_SEGMENT)),
            free_blocks,
            avail_blocks: free_blocks,
            total_files,
            free_files: total_files - used_files,
        }
    }

    /// Change the referenced file's length to `new_size` bytes, rounded up
    /// to whole sectors.
    ///
    /// Shrinking hands the freed sectors to the following free entry,
    /// inserting one if needed. Growing steals from a following free entry
    /// when it suffices, and otherwise relocates the file into the largest
    /// free block, carving it to size. The returned moves describe every
    /// entry whose `(segment, index)` changed, the target included, and
    /// `ptr` is repositioned to wherever the entry now lives. On error no
    /// net mutation is observable.
    pub fn truncate(&mut self, ptr: &mut DirPtr, new_size: u64) -> Result<Vec<DirMove>> {
        let origin = self.require_file(ptr)?;

        let new_sectors = new_size.div_ceil(SECTOR_SIZE as u64);
        if new_sectors > u64::from(u16::MAX) {
            return Err(Rt11Error::NoSpace);
        }
        let new = new_sectors as u16;
        let old = ptr.length_sectors();
        if new == old {
            return Ok(Vec::new());
        }

        let mut tracker = ChangeTracker::new();
        if new < old {
            self.shrink_entry(ptr, new, &mut tracker)?;
        } else {
            self.grow_entry(ptr, new, &mut tracker)?;
        }

        debug!(
            target: "rt11::dir",
            event = "truncate",
            from_sectors = old,
            to_sectors = new,
        );

        let moves = tracker.into_moves();
        let landed = moves
            .iter()
            .find(|m| m.from == origin)
            .map_or(origin, |m| m.to);
        if landed != origin {
            *ptr = self.pointer_at(landed)?;
        }
        Ok(moves)
    }

    /// Create a tentative entry for `name` and return a cursor to it.
    ///
    /// The entry is placed at the start of the largest free block, except
    /// that a free block directly behind an open tentative file is first
    /// split in half so the open file keeps room to grow.
    pub fn create_entry(&mut self, name: &str) -> Result<(DirPtr, Vec<DirMove>)> {
        let rad50 = rad50::parse_filename(name)
            .ok_or_else(|| Rt11Error::InvalidName(name.to_owned()))?;

        let mut tracker = ChangeTracker::new();
        let free = self.find_largest_free_block();
        if !free.is_valid() {
            return Err(Rt11Error::NoSpace);
        }

        let prev = free.prev();
        let carve = prev.has_status(E_TENT) && free.length_sectors() > 0;

        // both the carve and the new entry consume a directory slot; make
        // sure the room exists before mutating anything
        let needed = if carve { 2 } else { 1 };
        if self.spare_slots_from(free.segment_number())? < needed {
            return Err(Rt11Error::NoSpace);
        }

        let at = if carve {
            let half = free.length_sectors() / 2;
            let lead = self.carve_free_block(&free, half, &mut tracker)?;
            lead.next()
        } else {
            free
        };

        let slot = self.insert_empty_at(&at, &mut tracker)?;
        slot.set_word(STATUS_WORD, E_TENT);
        slot.set_word(FILENAME_WORDS, rad50[0]);
        slot.set_word(FILENAME_WORDS + 2, rad50[1]);
        slot.set_word(FILENAME_WORDS + 4, rad50[2]);
        slot.set_word(CREATION_DATE_WORD, date::today_word());

        debug!(target: "rt11::dir", event = "create", name, sector = slot.data_sector().0);

        Ok((slot, tracker.into_moves()))
    }

    /// Commit a tentative entry; a no-op for anything else.
    pub fn make_entry_permanent(&mut self, ptr: &DirPtr) {
        if ptr.has_status(E_TENT) {
            let status = ptr.word(STATUS_WORD);
            ptr.set_word(STATUS_WORD, (status & !E_TENT) | E_PERM);
            trace!(target: "rt11::dir", event = "commit_entry");
        }
    }

    /// Remove a file by name, turning its entry into free space of the same
    /// sector count and merging it with free neighbours.
    pub fn remove_entry(&mut self, name: &str) -> Result<Vec<DirMove>> {
        let mut tracker = ChangeTracker::new();
        let ptr = self.lookup(name)?;
        self.release_entry(&ptr, &mut tracker)?;
        debug!(target: "rt11::dir", event = "remove", name);
        Ok(tracker.into_moves())
    }

    /// Rename a file. An existing file under the new name is removed first.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<Vec<DirMove>> {
        let old_rad50 = rad50::parse_filename(old)
            .ok_or_else(|| Rt11Error::InvalidName(old.to_owned()))?;
        let new_rad50 = rad50::parse_filename(new)
            .ok_or_else(|| Rt11Error::InvalidName(new.to_owned()))?;

        self.lookup(old)?;
        if old_rad50 == new_rad50 {
            return Ok(Vec::new());
        }

        let mut tracker = ChangeTracker::new();
        if let Ok(existing) = self.lookup(new) {
            self.release_entry(&existing, &mut tracker)?;
        }

        // the removal may have shifted the source entry
        let ptr = self.lookup(old)?;
        ptr.set_word(FILENAME_WORDS, new_rad50[0]);
        ptr.set_word(FILENAME_WORDS + 2, new_rad50[1]);
        ptr.set_word(FILENAME_WORDS + 4, new_rad50[2]);

        debug!(target: "rt11::dir", event = "rename", old, new);
        Ok(tracker.into_moves())
    }

    // ── shrink / grow ───────────────────────────────────────────────────

    fn shrink_entry(&mut self, ptr: &DirPtr, new: u16, tracker: &mut ChangeTracker) -> Result<()> {
        let origin = self.require_file(ptr)?;

        let next = ptr.next();
        let free = if next.has_status(E_MPTY) {
            next
        } else {
            self.insert_empty_at(&next, tracker)?
        };

        // the insert may have spilled the target itself into another segment
        let landed = tracker.final_position_of(origin);
        let target = if landed == origin {
            ptr.clone()
        } else {
            self.pointer_at(landed)?
        };

        let delta = target.length_sectors() - new;
        target.set_word(TOTAL_LENGTH_WORD, new);
        free.set_word(TOTAL_LENGTH_WORD, free.length_sectors() + delta);
        Ok(())
    }

    fn grow_entry(&mut self, ptr: &DirPtr, new: u16, tracker: &mut ChangeTracker) -> Result<()> {
        let origin = self.require_file(ptr)?;
        let old = ptr.length_sectors();

        let next = ptr.next();
        if next.has_status(E_MPTY) {
            let available = u32::from(old) + u32::from(next.length_sectors());
            if u32::from(new) <= available {
                let delta = new - old;
                ptr.set_word(TOTAL_LENGTH_WORD, new);
                next.set_word(TOTAL_LENGTH_WORD, next.length_sectors() - delta);
                if next.length_sectors() == 0 {
                    self.delete_empty_at(&next, tracker)?;
                }
                return Ok(());
            }
        }

        // the file cannot grow in place: relocate it into the largest free
        // block, carved to exactly the requested size
        let found = self.find_largest_free_block();
        if !found.is_valid() || found.length_sectors() < new {
            return Err(Rt11Error::NoSpace);
        }
        let dest = self.carve_free_block(&found, new, tracker)?;

        // the carve may have shifted the source entry
        let source = match tracker.final_position_of(origin) {
            landed if landed == origin => ptr.clone(),
            landed => self.pointer_at(landed)?,
        };

        // move the data through the cache, sector by sector; the
        // destination sectors belong to a free block, so this is safe
        // before the directory is updated
        let src0 = source.data_sector();
        let dst0 = dest.data_sector();
        for i in 0..u32::from(old) {
            let src = self.cache.get_block(src0 + i, 1)?;
            let dst = self.cache.get_block(dst0 + i, 1)?;
            dst.copy_from(&src, 0, 0, SECTOR_SIZE)?;
            self.cache.put_block(src);
            self.cache.put_block(dst);
        }

        // move the entry itself, fix the length the copy brought along,
        // and turn the old slot into free space of the old size
        self.move_entry(&source, &dest, tracker)?;
        dest.set_word(TOTAL_LENGTH_WORD, new);

        source.set_word(STATUS_WORD, E_MPTY);
        source.set_word(FILENAME_WORDS, 0);
        source.set_word(FILENAME_WORDS + 2, 0);
        source.set_word(FILENAME_WORDS + 4, 0);
        source.set_byte(JOB_BYTE, 0);
        source.set_byte(CHANNEL_BYTE, 0);
        source.set_word(CREATION_DATE_WORD, 0);

        self.coalesce_free_neighbors(&source, tracker)
    }

    // ── slot insertion and deletion ─────────────────────────────────────

    /// Open a zero-length free slot at `at`, shifting everything from `at`
    /// through the end-of-segment marker one slot later. A full segment
    /// first spills its last entry, which may cascade down the chain and
    /// allocate a new segment. Returns a cursor to the new slot, which can
    /// land in a later segment when the spill moved the insertion point's
    /// entry there.
    fn insert_empty_at(&mut self, at: &DirPtr, tracker: &mut ChangeTracker) -> Result<DirPtr> {
        debug_assert!(at.is_valid());
        let eos = at.end_of_segment();
        let max = self.max_entries_per_segment();

        if eos.index() == max - 1 {
            let at_eos = at.index() == eos.index();
            self.spill_last_entry(at, tracker)?;
            if at_eos {
                // the slot we were asked to open sits behind the entry that
                // just spilled into the next segment
                let next_segment = at.segment_word(NEXT_SEGMENT);
                let slot = self.pointer_at(DirPos {
                    segment: next_segment,
                    index: 1,
                })?;
                return self.insert_empty_at(&slot, tracker);
            }
        }

        let eos = at.end_of_segment();
        debug_assert!(eos.index() < max - 1);

        let count = eos.index() - at.index() + 1;
        let dst = at.with_index(at.index() + 1);
        self.move_entries_within_segment(at, &dst, count, tracker)?;

        at.set_word(STATUS_WORD, E_MPTY);
        at.set_word(FILENAME_WORDS, 0);
        at.set_word(FILENAME_WORDS + 2, 0);
        at.set_word(FILENAME_WORDS + 4, 0);
        at.set_word(TOTAL_LENGTH_WORD, 0);
        at.set_byte(JOB_BYTE, 0);
        at.set_byte(CHANNEL_BYTE, 0);
        at.set_word(CREATION_DATE_WORD, 0);

        Ok(at.clone())
    }

    /// Remove a zero-length free slot, shifting the rest of its segment
    /// (end-of-segment marker included) one slot earlier. A non-empty slot
    /// cannot be removed this way without corrupting the data sectors of
    /// everything behind it.
    fn delete_empty_at(&mut self, ptr: &DirPtr, tracker: &mut ChangeTracker) -> Result<()> {
        debug_assert!(ptr.has_status(E_MPTY) && ptr.length_sectors() == 0);

        let eos = ptr.end_of_segment();
        let src = ptr.with_index(ptr.index() + 1);
        let count = eos.index() - ptr.index();
        self.move_entries_within_segment(&src, ptr, count, tracker)
    }

    // ── segment spill and allocation ────────────────────────────────────

    /// Move the last entry of `ptr`'s segment into the next segment,
    /// allocating one if the chain ends here. A segment holding only its
    /// end-of-segment marker spills nothing.
    fn spill_last_entry(&mut self, ptr: &DirPtr, tracker: &mut ChangeTracker) -> Result<()> {
        let eos = ptr.end_of_segment();
        if eos.index() == 0 {
            return Ok(());
        }

        let mut next = eos.next();
        if !next.is_valid() {
            self.allocate_new_segment()?;
            next = eos.next();
            debug_assert!(next.is_valid());
        }

        let last = eos.prev();
        debug_assert_eq!(
            last.data_sector().0 + u32::from(last.length_sectors()),
            next.data_sector().0,
        );

        // this recursively spills again if the next segment is full
        let slot = self.insert_empty_at(&next, tracker)?;
        debug_assert_eq!(slot.index(), 0);

        self.move_entry(&last, &slot, tracker)?;
        slot.set_segment_word(SEGMENT_DATA_BLOCK, last.data_sector().0 as u16);

        last.set_word(STATUS_WORD, E_EOS);
        last.set_word(FILENAME_WORDS, 0);
        last.set_word(FILENAME_WORDS + 2, 0);
        last.set_word(FILENAME_WORDS + 4, 0);
        last.set_word(TOTAL_LENGTH_WORD, 0);

        trace!(
            target: "rt11::dir",
            event = "spill",
            from_segment = last.segment_number(),
        );
        Ok(())
    }

    /// Bring segment `highest + 1` live at the end of the chain.
    ///
    /// Segments are only ever taken in ascending order and never freed, so
    /// no gap can exist below `highest-segment`.
    fn allocate_new_segment(&mut self) -> Result<()> {
        let total = self.total_segments();
        let new = self.dirblk.word(HIGHEST_SEGMENT) + 1;
        if new > total {
            return Err(Rt11Error::NoSpace);
        }

        // the chain's final end-of-segment marker gives us both the last
        // segment and the first unallocated data sector
        let mut eos = self.start_scan();
        loop {
            let next = eos.next();
            if !next.is_valid() {
                break;
            }
            eos = next;
        }

        let base = (usize::from(new) - 1) * SEGMENT_BYTES;
        self.dirblk.set_word(base + TOTAL_SEGMENTS, total);
        self.dirblk.set_word(base + NEXT_SEGMENT, 0);
        // only segment 1 maintains the highest-segment word
        self.dirblk.set_word(base + HIGHEST_SEGMENT, 0);
        self.dirblk
            .set_word(base + EXTRA_BYTES, self.dirblk.word(EXTRA_BYTES));
        self.dirblk
            .set_word(base + SEGMENT_DATA_BLOCK, eos.data_sector().0 as u16);

        let entry0 = base + FIRST_ENTRY_OFFSET;
        self.dirblk.set_word(entry0 + STATUS_WORD, E_EOS);
        self.dirblk.set_word(entry0 + FILENAME_WORDS, 0);
        self.dirblk.set_word(entry0 + FILENAME_WORDS + 2, 0);
        self.dirblk.set_word(entry0 + FILENAME_WORDS + 4, 0);
        self.dirblk.set_word(entry0 + TOTAL_LENGTH_WORD, 0);
        self.dirblk.set_byte(entry0 + JOB_BYTE, 0);
        self.dirblk.set_byte(entry0 + CHANNEL_BYTE, 0);
        self.dirblk.set_word(entry0 + CREATION_DATE_WORD, 0);

        eos.set_segment_word(NEXT_SEGMENT, new);
        self.dirblk.set_word(HIGHEST_SEGMENT, new);

        debug!(target: "rt11::dir", event = "allocate_segment", segment = new);
        Ok(())
    }

    // ── free-space management ───────────────────────────────────────────

    /// The first largest free entry, or an "after end" cursor when the
    /// directory has no free entry at all.
    fn find_largest_free_block(&self) -> DirPtr {
        let mut best: Option<DirPtr> = None;
        let mut ptr = self.start_scan();
        while ptr.advance() {
            if !ptr.has_status(E_MPTY) {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|b| ptr.length_sectors() > b.length_sectors())
            {
                best = Some(ptr.clone());
            }
        }
        best.unwrap_or(ptr)
    }

    /// Split a free block into a leading piece of exactly `size` sectors
    /// and a trailing free remainder. Returns a cursor to the leading
    /// piece, wherever it ended up.
    fn carve_free_block(
        &mut self,
        ptr: &DirPtr,
        size: u16,
        tracker: &mut ChangeTracker,
    ) -> Result<DirPtr> {
        debug_assert!(ptr.has_status(E_MPTY));
        let length = ptr.length_sectors();
        if size > length {
            return Err(Rt11Error::InvalidArgument(format!(
                "carving {size} sectors out of a {length}-sector free block"
            )));
        }
        if size == length {
            return Ok(ptr.clone());
        }

        let slot = self.insert_empty_at(&ptr.next(), tracker)?;
        let lead = slot.prev();
        debug_assert!(lead.has_status(E_MPTY) && lead.length_sectors() == length);

        lead.set_word(TOTAL_LENGTH_WORD, size);
        slot.set_word(TOTAL_LENGTH_WORD, length - size);
        Ok(lead)
    }

    /// Turn a file entry into free space and merge it with its free
    /// neighbours.
    fn release_entry(&mut self, ptr: &DirPtr, tracker: &mut ChangeTracker) -> Result<()> {
        ptr.set_word(STATUS_WORD, E_MPTY);
        ptr.set_word(FILENAME_WORDS, 0);
        ptr.set_word(FILENAME_WORDS + 2, 0);
        ptr.set_word(FILENAME_WORDS + 4, 0);
        self.coalesce_free_neighbors(ptr, tracker)
    }

    /// Starting from a free entry, walk back to the earliest free
    /// neighbour, then absorb every free successor into it. End-of-segment
    /// markers bound the walk, so merging never crosses a segment.
    fn coalesce_free_neighbors(&mut self, ptr: &DirPtr, tracker: &mut ChangeTracker) -> Result<()> {
        debug_assert!(ptr.has_status(E_MPTY));

        let mut anchor = ptr.clone();
        loop {
            let prev = anchor.prev();
            if !prev.has_status(E_MPTY) {
                break;
            }
            anchor = prev;
        }

        loop {
            let next = anchor.next();
            if !next.has_status(E_MPTY) {
                return Ok(());
            }
            anchor.set_word(
                TOTAL_LENGTH_WORD,
                anchor.length_sectors() + next.length_sectors(),
            );
            next.set_word(TOTAL_LENGTH_WORD, 0);
            self.delete_empty_at(&next, tracker)?;
        }
    }

    // ── entry movement primitives ───────────────────────────────────────

    /// Shift a run of `count` entries within one segment. One tracker
    /// transaction; statuses are recorded before the bytes move.
    fn move_entries_within_segment(
        &mut self,
        src: &DirPtr,
        dst: &DirPtr,
        count: usize,
        tracker: &mut ChangeTracker,
    ) -> Result<()> {
        debug_assert_eq!(src.segment_number(), dst.segment_number());
        let segment = src.segment_number();

        tracker.begin();
        for k in 0..count {
            let slot = src.with_index(src.index() + k);
            tracker.record(
                slot.word(STATUS_WORD),
                DirPos {
                    segment,
                    index: (src.index() + k) as u16,
                },
                DirPos {
                    segment,
                    index: (dst.index() + k) as u16,
                },
            );
        }
        let moved = self.dirblk.copy_within(
            src.offset(0),
            dst.offset(0),
            count * self.entry_size,
        );
        tracker.end();
        moved
    }

    /// Move a single entry to an arbitrary slot, possibly in another
    /// segment. One tracker transaction.
    fn move_entry(&mut self, src: &DirPtr, dst: &DirPtr, tracker: &mut ChangeTracker) -> Result<()> {
        let (from, to) = match (src.position(), dst.position()) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                return Err(Rt11Error::InvalidArgument(
                    "entry move outside the directory".to_owned(),
                ))
            }
        };

        tracker.begin();
        tracker.record(src.word(STATUS_WORD), from, to);
        let moved = self
            .dirblk
            .copy_within(src.offset(0), dst.offset(0), self.entry_size);
        tracker.end();
        moved
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn require_file(&self, ptr: &DirPtr) -> Result<DirPos> {
        match ptr.position() {
            Some(pos) if !ptr.has_status(E_EOS) => Ok(pos),
            _ => Err(Rt11Error::InvalidArgument(
                "operation needs a live file entry".to_owned(),
            )),
        }
    }

    /// Entry slots still available from `segment` to the end of the chain,
    /// counting segments that could still be allocated. Spills only push
    /// entries forward, so slots in earlier segments don't help an
    /// insertion here.
    fn spare_slots_from(&self, segment: u16) -> Result<usize> {
        let max = self.max_entries_per_segment();
        let total = self.total_segments();
        let highest = self.dirblk.word(HIGHEST_SEGMENT);
        let mut spares = usize::from(total.saturating_sub(highest)) * (max - 1);

        let mut current = segment;
        loop {
            let base = (usize::from(current) - 1) * SEGMENT_BYTES;
            let mut index = 0;
            loop {
                if index >= max {
                    return Err(Rt11Error::Corrupt(format!(
                        "directory segment {current} is unterminated"
                    )));
                }
                let status =
                    self.dirblk
                        .word(base + FIRST_ENTRY_OFFSET + index * self.entry_size + STATUS_WORD);
                if status & E_EOS != 0 {
                    break;
                }
                index += 1;
            }
            spares += max - 1 - index;

            let next = self.dirblk.word(base + NEXT_SEGMENT);
            if next == 0 {
                return Ok(spares);
            }
            current = next;
        }
    }
}
