//! Shared helpers: volume construction and the directory consistency
//! checker used across the scenario tests.
#![allow(dead_code)] // not every test binary uses every helper

use rt11_block::{BlockCache, MemoryDataSource};
use rt11_dir::format::{self, FormatEntry};
use rt11_dir::{DirPos, Directory};
use rt11_types::{
    E_EOS, E_MPTY, EXTRA_BYTES, FILENAME_WORDS, FIRST_SEGMENT_SECTOR, NEXT_SEGMENT, SECTOR_SIZE,
    SECTORS_PER_SEGMENT, SEGMENT_DATA_BLOCK, STATUS_WORD,
};
use std::rc::Rc;

/// The standard scenario volume: 256 sectors, 8 directory segments, so the
/// first data sector is 22.
pub const VOLUME_SECTORS: u32 = 256;
pub const DIR_SEGMENTS: u16 = 8;

pub fn build_volume(
    sectors: u32,
    segments: u16,
    layout: &[Vec<FormatEntry>],
) -> (Rc<BlockCache>, Directory, MemoryDataSource) {
    let source = MemoryDataSource::new(sectors as usize * SECTOR_SIZE);
    format::format_with_entries(&source, segments, layout, 0).expect("format");
    let cache = Rc::new(BlockCache::new(Box::new(source.clone())));
    let dir = Directory::open(Rc::clone(&cache)).expect("mount");
    (cache, dir, source)
}

pub fn scenario_volume(layout: &[Vec<FormatEntry>]) -> (Rc<BlockCache>, Directory, MemoryDataSource)
{
    build_volume(VOLUME_SECTORS, DIR_SEGMENTS, layout)
}

/// A flattened view of one live entry, for structural assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    pub pos: DirPos,
    pub status: u16,
    pub name: [u16; 3],
    pub length: u16,
    pub sector0: u32,
}

pub fn snapshot(dir: &Directory) -> Vec<EntryView> {
    let mut out = Vec::new();
    let mut ptr = dir.start_scan();
    while ptr.advance() {
        out.push(EntryView {
            pos: ptr.position().expect("valid scan position"),
            status: ptr.word(STATUS_WORD),
            name: [
                ptr.word(FILENAME_WORDS),
                ptr.word(FILENAME_WORDS + 2),
                ptr.word(FILENAME_WORDS + 4),
            ],
            length: ptr.length_sectors(),
            sector0: ptr.data_sector().0,
        });
    }
    out
}

/// Raw bytes of the entry at `pos`, for byte-for-byte move checks.
pub fn raw_entry(dir: &Directory, pos: DirPos) -> Vec<u8> {
    let ptr = dir.pointer_at(pos).expect("entry position");
    (0..dir.entry_size()).map(|i| ptr.byte(i)).collect()
}

/// Total length of all free entries, in sectors.
pub fn total_free(dir: &Directory) -> u64 {
    snapshot(dir)
        .iter()
        .filter(|e| e.status & E_MPTY != 0)
        .map(|e| u64::from(e.length))
        .sum()
}

/// Assert the directory-wide invariants:
/// entry order matches data order with no gaps (spanning the whole data
/// area), segment headers agree with their first entries, the chain visits
/// each segment once, no two adjacent entries are both free, and
/// extra-bytes is constant.
pub fn check_invariants(dir: &Directory, volume_sectors: u32) {
    let mut ptr = dir.start_scan();

    let mut running: Option<u32> = None;
    let mut previous_free = false;
    let mut segments_visited = Vec::new();

    while ptr.advance() {
        let pos = ptr.position().expect("valid scan position");
        let status = ptr.word(STATUS_WORD);

        if pos.index == 0 {
            assert!(
                !segments_visited.contains(&pos.segment),
                "segment {} visited twice",
                pos.segment
            );
            segments_visited.push(pos.segment);

            // I3: first entry starts at the header's data block
            let header = u32::from(ptr.segment_word(SEGMENT_DATA_BLOCK));
            assert_eq!(
                ptr.data_sector().0,
                header,
                "segment {} first entry disagrees with its header",
                pos.segment
            );
            if let Some(expected) = running {
                assert_eq!(header, expected, "data gap entering segment {}", pos.segment);
            }
            running = Some(header);
            previous_free = false;
        }

        // I2: each entry's data starts where the previous one ended
        let expected = running.expect("running data sector");
        assert_eq!(
            ptr.data_sector().0,
            expected,
            "entry {pos} data sector out of order"
        );

        if status & E_EOS != 0 {
            assert_eq!(ptr.length_sectors(), 0, "end-of-segment marker with a length");
            previous_free = false;
            continue;
        }

        running = Some(expected + u32::from(ptr.length_sectors()));

        // I6: free neighbours must have been coalesced
        let free = status & E_MPTY != 0;
        assert!(
            !(free && previous_free),
            "adjacent free entries at {pos}"
        );
        previous_free = free;
    }

    // I5: the data area is partitioned without gaps down to the last sector
    let dir_end = FIRST_SEGMENT_SECTOR + u32::from(dir.total_segments()) * SECTORS_PER_SEGMENT;
    let covered = running.unwrap_or(dir_end);
    assert_eq!(covered, volume_sectors, "data area not fully covered");

    // I7: constant extra-bytes, re-read through segment headers
    let mut check = dir.start_scan();
    let mut extra = None;
    while check.advance() {
        let this = check.segment_word(EXTRA_BYTES);
        match extra {
            None => extra = Some(this),
            Some(prior) => assert_eq!(this, prior, "extra-bytes differ between segments"),
        }
        // skip to the end of this segment
        while !check.has_status(E_EOS) {
            assert!(check.advance(), "segment without an end marker");
        }
    }

    // I4: the chain pointer of each visited segment leads to the next one
    for window in segments_visited.windows(2) {
        let ptr = dir
            .pointer_at(DirPos {
                segment: window[0],
                index: 0,
            })
            .expect("segment start");
        assert_eq!(ptr.segment_word(NEXT_SEGMENT), window[1]);
    }
}
