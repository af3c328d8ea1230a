#![forbid(unsafe_code)]
//! End-to-end behavior of the block cache over in-memory and file-backed
//! data sources.

use rt11_block::{BlockCache, DataSource, FileDataSource, MemoryDataSource};
use rt11_types::{Sector, SECTOR_SIZE};
use std::io::Write;

const VOLUME_SECTORS: usize = 64;

fn memory_cache() -> (BlockCache, MemoryDataSource) {
    let source = MemoryDataSource::new(VOLUME_SECTORS * SECTOR_SIZE);
    let cache = BlockCache::new(Box::new(source.clone()));
    (cache, source)
}

#[test]
fn volume_sectors_derive_from_source_size() {
    let (cache, _source) = memory_cache();
    assert_eq!(cache.volume_sectors(), VOLUME_SECTORS as u32);
}

#[test]
fn get_block_reads_through_and_caches() {
    let (cache, source) = memory_cache();
    {
        let bytes = source.shared_bytes();
        let mut bytes = bytes.borrow_mut();
        bytes[10 * SECTOR_SIZE] = 0xAB;
        bytes[10 * SECTOR_SIZE + 1] = 0xCD;
    }

    let blk = cache.get_block(Sector(10), 2).unwrap();
    assert_eq!(blk.word(0), 0xCDAB);

    // a second request returns the same cached block, mutations included
    blk.set_byte(5, 9);
    let again = cache.get_block(Sector(10), 2).unwrap();
    assert_eq!(again.byte(5), 9);
    cache.put_block(again);
    cache.put_block(blk);
}

#[test]
fn hit_with_wrong_count_is_invalid() {
    let (cache, _source) = memory_cache();
    let blk = cache.get_block(Sector(4), 2).unwrap();
    assert!(cache.get_block(Sector(4), 3).is_err());
    cache.put_block(blk);
}

#[test]
fn overlapping_requests_are_invalid() {
    let (cache, _source) = memory_cache();
    let _a = cache.get_block(Sector(10), 4).unwrap();

    // overlap from below, above, and inside
    assert!(cache.get_block(Sector(8), 4).is_err());
    assert!(cache.get_block(Sector(12), 4).is_err());
    assert!(cache.get_block(Sector(11), 1).is_err());

    // disjoint neighbours are fine
    assert!(cache.get_block(Sector(6), 4).is_ok());
    assert!(cache.get_block(Sector(14), 2).is_ok());
}

#[test]
fn requests_past_the_volume_end_fail() {
    let (cache, _source) = memory_cache();
    assert!(cache.get_block(Sector(VOLUME_SECTORS as u32), 1).is_err());
    assert!(cache
        .get_block(Sector(VOLUME_SECTORS as u32 - 1), 2)
        .is_err());
    assert!(cache
        .get_block(Sector(VOLUME_SECTORS as u32 - 1), 1)
        .is_ok());
}

#[test]
fn zero_sized_requests_are_invalid() {
    let (cache, _source) = memory_cache();
    assert!(cache.get_block(Sector(0), 0).is_err());
    let blk = cache.get_block(Sector(0), 1).unwrap();
    assert!(cache.resize_block(&blk, 0).is_err());
}

#[test]
fn resize_grows_by_reading_through() {
    let (cache, source) = memory_cache();
    {
        let bytes = source.shared_bytes();
        bytes.borrow_mut()[3 * SECTOR_SIZE] = 0x55;
    }

    let blk = cache.get_block(Sector(2), 1).unwrap();
    cache.resize_block(&blk, 2).unwrap();
    assert_eq!(blk.count(), 2);
    assert_eq!(blk.byte(SECTOR_SIZE), 0x55);

    cache.resize_block(&blk, 1).unwrap();
    assert_eq!(blk.count(), 1);
}

#[test]
fn resize_cannot_overlap_the_next_block() {
    let (cache, _source) = memory_cache();
    let low = cache.get_block(Sector(2), 2).unwrap();
    let _high = cache.get_block(Sector(6), 2).unwrap();

    assert!(cache.resize_block(&low, 5).is_err());
    assert!(cache.resize_block(&low, 4).is_ok());
}

#[test]
fn sync_writes_back_only_dirty_blocks() {
    let (cache, source) = memory_cache();
    let dirty = cache.get_block(Sector(1), 1).unwrap();
    let clean = cache.get_block(Sector(2), 1).unwrap();

    dirty.set_word(0, 0xBEEF);
    assert!(dirty.is_dirty());
    assert!(!clean.is_dirty());

    cache.sync().unwrap();
    assert!(!dirty.is_dirty());

    let bytes = source.shared_bytes();
    let bytes = bytes.borrow();
    assert_eq!(bytes[SECTOR_SIZE], 0xEF);
    assert_eq!(bytes[SECTOR_SIZE + 1], 0xBE);
}

#[test]
fn dirty_state_survives_put_and_reacquire() {
    let (cache, source) = memory_cache();
    let blk = cache.get_block(Sector(7), 1).unwrap();
    blk.set_byte(0, 42);
    cache.put_block(blk);

    let blk = cache.get_block(Sector(7), 1).unwrap();
    assert!(blk.is_dirty());
    cache.sync().unwrap();

    let bytes = source.shared_bytes();
    assert_eq!(bytes.borrow()[7 * SECTOR_SIZE], 42);
}

#[test]
fn file_backed_source_roundtrip() {
    let mut image = tempfile::NamedTempFile::new().unwrap();
    image.write_all(&vec![0_u8; 8 * SECTOR_SIZE]).unwrap();
    image.flush().unwrap();

    let source = FileDataSource::open(image.path()).unwrap();
    assert!(source.is_writable());
    assert_eq!(source.len_bytes(), 8 * SECTOR_SIZE as u64);

    let cache = BlockCache::new(Box::new(source));
    let blk = cache.get_block(Sector(3), 1).unwrap();
    blk.copy_in(0, b"RT-11").unwrap();
    cache.sync().unwrap();

    let reopened = FileDataSource::open(image.path()).unwrap();
    let mut buf = [0_u8; 5];
    reopened
        .read_exact_at(3 * SECTOR_SIZE as u64, &mut buf)
        .unwrap();
    assert_eq!(&buf, b"RT-11");
}

#[test]
fn short_transfers_are_errors() {
    let source = MemoryDataSource::new(SECTOR_SIZE);
    let mut buf = vec![0_u8; 2 * SECTOR_SIZE];
    assert!(source.read_exact_at(0, &mut buf).is_err());
    assert!(source.write_all_at(SECTOR_SIZE as u64, &buf[..1]).is_err());
    assert!(source.read_exact_at(u64::MAX, &mut buf[..1]).is_err());
}
