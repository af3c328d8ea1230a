#![forbid(unsafe_code)]
//! Open-file table and mount-object scenarios: handle lifecycle, data
//! readback, growth across relocations, and handle fix-up when directory
//! entries move underneath open files.

use rt11_block::MemoryDataSource;
use rt11_core::Rt11Fs;
use rt11_dir::format::{self, FormatEntry, REST_OF_DATA};
use rt11_error::Rt11Error;
use rt11_types::{E_PERM, E_TENT, SECTOR_SIZE};

const VOLUME_SECTORS: u32 = 256;
const DIR_SEGMENTS: u16 = 8;

fn fresh_fs() -> (Rt11Fs, MemoryDataSource) {
    let source = MemoryDataSource::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    format::format_empty(&source, DIR_SEGMENTS, 0).unwrap();
    let fs = Rt11Fs::mount(Box::new(source.clone())).unwrap();
    (fs, source)
}

fn layout_fs(layout: &[Vec<FormatEntry>]) -> (Rt11Fs, MemoryDataSource) {
    let source = MemoryDataSource::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    format::format_with_entries(&source, DIR_SEGMENTS, layout, 0).unwrap();
    let fs = Rt11Fs::mount(Box::new(source.clone())).unwrap();
    (fs, source)
}

#[test]
fn open_shares_handles_by_directory_position() {
    let layout = vec![vec![
        FormatEntry::file("A.DAT", 2).unwrap(),
        FormatEntry::file("B.DAT", 2).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    let a1 = fs.open("A.DAT").unwrap();
    let a2 = fs.open("A.DAT").unwrap();
    let b = fs.open("B.DAT").unwrap();
    assert_eq!(a1, a2);
    assert_ne!(a1, b);
    assert_eq!(fs.files().open_count(), 2);

    // slot reuse after the last reference goes away
    fs.close(a1).unwrap();
    fs.close(a2).unwrap();
    let c = fs.open("A.DAT").unwrap();
    assert_eq!(c, a1);
}

#[test]
fn bad_handles_are_rejected() {
    let (mut fs, _source) = fresh_fs();
    assert!(matches!(fs.close(0), Err(Rt11Error::BadHandle(0))));
    assert!(matches!(
        fs.read(7, &mut [0_u8; 4], 0),
        Err(Rt11Error::BadHandle(7))
    ));

    let fd = fs.create("A.DAT").unwrap();
    fs.close(fd).unwrap();
    assert!(matches!(fs.write(fd, b"x", 0), Err(Rt11Error::BadHandle(_))));
}

#[test]
fn written_data_reads_back() {
    // P6 at the file surface, spanning sector boundaries
    let (mut fs, _source) = fresh_fs();
    let fd = fs.create("DATA.BIN").unwrap();

    let pattern: Vec<u8> = (0..3 * SECTOR_SIZE + 77).map(|i| (i % 251) as u8).collect();
    let wrote = fs.write(fd, &pattern, 0).unwrap();
    assert_eq!(wrote, pattern.len());

    let mut back = vec![0_u8; pattern.len()];
    let got = fs.read(fd, &mut back, 0).unwrap();
    assert_eq!(got, pattern.len());
    assert_eq!(back, pattern);

    // unaligned interior read
    let mut mid = vec![0_u8; 700];
    let got = fs.read(fd, &mut mid, 300).unwrap();
    assert_eq!(got, 700);
    assert_eq!(mid, pattern[300..1000]);
}

#[test]
fn reads_clamp_at_end_of_file() {
    let layout = vec![vec![
        FormatEntry::file("SHORT.DAT", 2).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);
    let fd = fs.open("SHORT.DAT").unwrap();

    let mut buf = vec![0xFF_u8; 3 * SECTOR_SIZE];
    let got = fs.read(fd, &mut buf, 0).unwrap();
    assert_eq!(got, 2 * SECTOR_SIZE);

    let got = fs.read(fd, &mut buf, 2 * SECTOR_SIZE as u64).unwrap();
    assert_eq!(got, 0);

    let got = fs.read(fd, &mut buf, SECTOR_SIZE as u64 + 100).unwrap();
    assert_eq!(got, SECTOR_SIZE - 100);
}

#[test]
fn extending_write_zero_fills_the_sector_tail() {
    let (mut fs, source) = fresh_fs();

    // paint the data area so stale bytes would show through
    {
        let bytes = source.shared_bytes();
        let mut bytes = bytes.borrow_mut();
        for b in bytes[22 * SECTOR_SIZE..].iter_mut() {
            *b = 0xEE;
        }
    }

    let fd = fs.create("PART.DAT").unwrap();
    let wrote = fs.write(fd, b"hello", 0).unwrap();
    assert_eq!(wrote, 5);

    let mut buf = vec![0_u8; SECTOR_SIZE];
    let got = fs.read(fd, &mut buf, 0).unwrap();
    assert_eq!(got, SECTOR_SIZE);
    assert_eq!(&buf[..5], b"hello");
    assert!(buf[5..].iter().all(|&b| b == 0), "tail not zero-filled");
}

#[test]
fn create_truncates_an_existing_file() {
    let layout = vec![vec![
        FormatEntry::file("A.DAT", 4).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    let fd = fs.create("A.DAT").unwrap();
    let ent = fs.stat("A.DAT").unwrap();
    assert_eq!(ent.length, 0);
    fs.close(fd).unwrap();
}

#[test]
fn close_commits_tentative_entries_and_syncs() {
    let (mut fs, source) = fresh_fs();
    let fd = fs.create("NEW.DAT").unwrap();
    fs.write(fd, b"payload", 0).unwrap();

    let ent = fs.stat("NEW.DAT").unwrap();
    assert_eq!(ent.status & E_TENT, E_TENT);

    fs.close(fd).unwrap();
    let ent = fs.stat("NEW.DAT").unwrap();
    assert_eq!(ent.status & E_PERM, E_PERM);
    assert_eq!(ent.status & E_TENT, 0);

    // the close synced: a fresh mount over the same bytes sees the file
    let again = Rt11Fs::mount(Box::new(source.clone())).unwrap();
    let ent = again.stat("NEW.DAT").unwrap();
    assert_eq!(ent.status & E_PERM, E_PERM);
    assert_eq!(ent.length, SECTOR_SIZE as u64);
}

#[test]
fn growth_relocation_rebinds_other_open_handles() {
    // SWAP.SYS cannot grow in place; both it and 123 change slots, and
    // both files stay readable through their open handles
    let layout = vec![vec![
        FormatEntry::free(2),
        FormatEntry::file("SWAP.SYS", 3).unwrap(),
        FormatEntry::file("123", 5).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    let swap = fs.open("SWAP.SYS").unwrap();
    let other = fs.open("123").unwrap();

    let swap_data: Vec<u8> = (0..3 * SECTOR_SIZE).map(|i| (i % 7) as u8).collect();
    fs.write(swap, &swap_data, 0).unwrap();
    let other_data: Vec<u8> = (0..5 * SECTOR_SIZE).map(|i| (i % 11) as u8).collect();
    fs.write(other, &other_data, 0).unwrap();

    // extend past the file and the following entry: forces relocation
    let tail = vec![0x5A_u8; SECTOR_SIZE];
    fs.write(swap, &tail, 5 * SECTOR_SIZE as u64).unwrap();

    let ent = fs.stat("SWAP.SYS").unwrap();
    assert_eq!(ent.length, 6 * SECTOR_SIZE as u64);
    assert_eq!(ent.sector0.0, 32);

    let mut back = vec![0_u8; 3 * SECTOR_SIZE];
    fs.read(swap, &mut back, 0).unwrap();
    assert_eq!(back, swap_data, "relocated data must survive");

    let mut back = vec![0_u8; SECTOR_SIZE];
    fs.read(swap, &mut back, 5 * SECTOR_SIZE as u64).unwrap();
    assert_eq!(back, tail);

    // the bystander handle was rebound and still reads its own data
    let mut back = vec![0_u8; 5 * SECTOR_SIZE];
    fs.read(other, &mut back, 0).unwrap();
    assert_eq!(back, other_data);

    fs.close(swap).unwrap();
    fs.close(other).unwrap();
}

#[test]
fn truncate_through_a_handle_applies_moves() {
    let layout = vec![vec![
        FormatEntry::free(2),
        FormatEntry::file("SWAP.SYS", 3).unwrap(),
        FormatEntry::file("123", 5).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    let other = fs.open("123").unwrap();
    let other_data: Vec<u8> = (0..5 * SECTOR_SIZE).map(|i| (i % 13) as u8).collect();
    fs.write(other, &other_data, 0).unwrap();

    // shrink inserts a slot and shifts 123 down one index
    let swap = fs.open("SWAP.SYS").unwrap();
    fs.truncate(swap, 0).unwrap();

    let ent = fs.stat("SWAP.SYS").unwrap();
    assert_eq!(ent.length, 0);

    let mut back = vec![0_u8; 5 * SECTOR_SIZE];
    fs.read(other, &mut back, 0).unwrap();
    assert_eq!(back, other_data);

    fs.close(swap).unwrap();
    fs.close(other).unwrap();
}

#[test]
fn unlink_removes_and_coalesces() {
    let layout = vec![vec![
        FormatEntry::file("A.DAT", 4).unwrap(),
        FormatEntry::file("B.DAT", 4).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    fs.unlink("B.DAT").unwrap();
    assert!(matches!(fs.stat("B.DAT"), Err(Rt11Error::NotFound(_))));
    assert!(fs.stat("A.DAT").is_ok());

    let stats = fs.statfs();
    assert_eq!(stats.free_blocks, u64::from(VOLUME_SECTORS) - 22 - 4);
}

#[test]
fn rename_keeps_handles_working() {
    let layout = vec![vec![
        FormatEntry::file("A.DAT", 2).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    let fd = fs.open("A.DAT").unwrap();
    let data = vec![7_u8; 100];
    fs.write(fd, &data, 0).unwrap();

    fs.rename("A.DAT", "Z.DAT").unwrap();
    assert!(fs.stat("A.DAT").is_err());
    assert!(fs.stat("Z.DAT").is_ok());

    let mut back = vec![0_u8; 100];
    fs.read(fd, &mut back, 0).unwrap();
    assert_eq!(back, data);
    fs.close(fd).unwrap();
}

#[test]
fn list_reports_committed_files_in_scan_order() {
    let layout = vec![vec![
        FormatEntry::file("A.DAT", 2).unwrap(),
        FormatEntry::free(3),
        FormatEntry::file("B.DAT", 4).unwrap(),
        FormatEntry::free(REST_OF_DATA),
        FormatEntry::eos(),
    ]];
    let (mut fs, _source) = layout_fs(&layout);

    let names: Vec<String> = fs.list().iter().map(|(_, e)| e.name.clone()).collect();
    assert_eq!(names, vec!["A.DAT", "B.DAT"]);

    // tentative files are not listed until committed
    let fd = fs.create("T.TMP").unwrap();
    let names: Vec<String> = fs.list().iter().map(|(_, e)| e.name.clone()).collect();
    assert_eq!(names, vec!["A.DAT", "B.DAT"]);
    fs.close(fd).unwrap();
    let names: Vec<String> = fs.list().iter().map(|(_, e)| e.name.clone()).collect();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&"T.TMP".to_string()));
}

#[test]
fn drop_syncs_dirty_blocks_back_to_the_source() {
    let source = MemoryDataSource::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    format::format_empty(&source, DIR_SEGMENTS, 0).unwrap();
    {
        let mut fs = Rt11Fs::mount(Box::new(source.clone())).unwrap();
        let fd = fs.create("KEEP.DAT").unwrap();
        fs.write(fd, b"durable", 0).unwrap();
        // no explicit close or sync: unmount must write back
    }

    let fs = Rt11Fs::mount(Box::new(source.clone())).unwrap();
    let ent = fs.stat("KEEP.DAT").unwrap();
    assert_eq!(ent.length, SECTOR_SIZE as u64);
}

#[test]
fn mount_surfaces_corruption() {
    let source = MemoryDataSource::new(VOLUME_SECTORS as usize * SECTOR_SIZE);
    // never formatted: segment count zero
    assert!(matches!(
        Rt11Fs::mount(Box::new(source)),
        Err(Rt11Error::Corrupt(_))
    ));
}

#[test]
fn file_backed_mount_roundtrip() {
    use std::io::Write as _;

    let mut image = tempfile::NamedTempFile::new().unwrap();
    image
        .write_all(&vec![0_u8; VOLUME_SECTORS as usize * SECTOR_SIZE])
        .unwrap();
    image.flush().unwrap();

    {
        let file_source = rt11_block::FileDataSource::open(image.path()).unwrap();
        format::format_empty(&file_source, DIR_SEGMENTS, 0).unwrap();
    }

    {
        let mut fs = Rt11Fs::mount_path(image.path()).unwrap();
        let fd = fs.create("DISK.DAT").unwrap();
        fs.write(fd, b"on real storage", 0).unwrap();
        fs.close(fd).unwrap();
    }

    let fs = Rt11Fs::mount_path(image.path()).unwrap();
    let ent = fs.stat("DISK.DAT").unwrap();
    assert_eq!(ent.status & E_PERM, E_PERM);
    assert_eq!(ent.length, SECTOR_SIZE as u64);
}
