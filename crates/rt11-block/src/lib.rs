#![forbid(unsafe_code)]
//! Data sources and the sector block cache.
//!
//! A [`DataSource`] is random-access byte I/O on a volume image with
//! all-or-nothing transfer semantics. The [`BlockCache`] buffers runs of
//! sectors as [`Block`]s under a non-overlap invariant, tracks dirtiness,
//! reads through on miss, and writes dirty blocks back on [`BlockCache::sync`].
//!
//! The cache is strictly single-threaded; reference counting (via `Rc`
//! handles) governs block lifetime only, never mutual exclusion.

use rt11_error::{Result, Rt11Error};
use rt11_types::{Sector, SECTOR_SIZE};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, trace};

// ── Data sources ────────────────────────────────────────────────────────────

/// Byte-addressed access to a volume image (pread/pwrite semantics).
///
/// Transfers are all-or-nothing: a short read or write is an I/O error.
pub trait DataSource {
    /// Total length of the image in bytes, captured when the source is
    /// created.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// File-backed data source for on-disk volume images.
///
/// Opens read-write and falls back to read-only; writes to a read-only
/// image fail with a permission error.
#[derive(Debug)]
pub struct FileDataSource {
    file: File,
    len: u64,
    writable: bool,
}

impl FileDataSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl DataSource for FileDataSource {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Rt11Error::Range("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(Rt11Error::Range(format!(
                "read out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Rt11Error::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Rt11Error::Range("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(Rt11Error::Range(format!(
                "write out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory data source for tests and tooling.
///
/// The backing buffer is shared so a test can inspect or prepare image
/// bytes directly while the source is mounted.
#[derive(Debug, Clone)]
pub struct MemoryDataSource {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl MemoryDataSource {
    /// Create a zero-filled image of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(bytes)),
        }
    }

    /// The shared backing buffer.
    #[must_use]
    pub fn shared_bytes(&self) -> Rc<RefCell<Vec<u8>>> {
        Rc::clone(&self.bytes)
    }
}

impl DataSource for MemoryDataSource {
    fn len_bytes(&self) -> u64 {
        self.bytes.borrow().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.borrow();
        let start = usize::try_from(offset)
            .map_err(|_| Rt11Error::Range("read offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                Rt11Error::Range(format!(
                    "read out of bounds: offset={offset} len={} image_len={}",
                    buf.len(),
                    bytes.len()
                ))
            })?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.borrow_mut();
        let start = usize::try_from(offset)
            .map_err(|_| Rt11Error::Range("write offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                Rt11Error::Range(format!(
                    "write out of bounds: offset={offset} len={} image_len={}",
                    buf.len(),
                    bytes.len()
                ))
            })?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

// ── Blocks ──────────────────────────────────────────────────────────────────

/// A contiguous run of sectors buffered in memory.
#[derive(Debug)]
struct Block {
    sector: Sector,
    count: usize,
    dirty: bool,
    data: Vec<u8>,
}

impl Block {
    fn new(sector: Sector, count: usize) -> Self {
        Self {
            sector,
            count,
            dirty: false,
            data: vec![0_u8; count * SECTOR_SIZE],
        }
    }

    fn len_bytes(&self) -> usize {
        self.count * SECTOR_SIZE
    }

    /// Word accessors use PDP-11 (little-endian) byte order. An offset past
    /// the end of the block is a caller bug and panics.
    fn word(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn set_word(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    fn byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    fn set_byte(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
        self.dirty = true;
    }

    fn check_span(&self, offset: usize, len: usize, what: &str) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.data.len()) {
            return Err(Rt11Error::Range(format!(
                "{what} outside block: offset={offset} len={len} block_len={}",
                self.data.len()
            )));
        }
        Ok(())
    }

    fn copy_out(&self, offset: usize, dest: &mut [u8]) -> Result<()> {
        self.check_span(offset, dest.len(), "copy out of block")?;
        dest.copy_from_slice(&self.data[offset..offset + dest.len()]);
        Ok(())
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_span(offset, src.len(), "copy into block")?;
        self.data[offset..offset + src.len()].copy_from_slice(src);
        self.dirty = true;
        Ok(())
    }

    /// Overlapping source and destination ranges are handled correctly.
    fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.check_span(src, len, "copy within block")?;
        self.check_span(dst, len, "copy within block")?;
        self.data.copy_within(src..src + len, dst);
        self.dirty = true;
        Ok(())
    }

    fn zero_fill(&mut self, offset: usize, len: usize) -> Result<()> {
        self.check_span(offset, len, "zero fill")?;
        self.data[offset..offset + len].fill(0);
        self.dirty = true;
        Ok(())
    }

    fn read_from(&mut self, source: &dyn DataSource) -> Result<()> {
        source.read_exact_at(self.sector.byte_offset(), &mut self.data)?;
        self.dirty = false;
        Ok(())
    }

    fn write_back(&mut self, source: &dyn DataSource) -> Result<()> {
        source.write_all_at(self.sector.byte_offset(), &self.data)?;
        self.dirty = false;
        Ok(())
    }

    /// Grow or shrink the block in place. New sectors are filled by reading
    /// through the data source; the block is unchanged if that read fails.
    fn resize(&mut self, new_count: usize, source: &dyn DataSource) -> Result<()> {
        if new_count > self.count {
            let grow_bytes = (new_count - self.count) * SECTOR_SIZE;
            let mut tail = vec![0_u8; grow_bytes];
            let tail_offset = (self.sector + self.count as u32).byte_offset();
            source.read_exact_at(tail_offset, &mut tail)?;
            self.data.extend_from_slice(&tail);
        } else {
            self.data.truncate(new_count * SECTOR_SIZE);
        }
        self.count = new_count;
        Ok(())
    }
}

/// Reference-counted handle to a cached block.
///
/// Handles grant in-place read and write access; mutations mark the block
/// dirty. Dropping a handle (or passing it to [`BlockCache::put_block`])
/// releases the reference; the block stays cached either way.
#[derive(Debug, Clone)]
pub struct BlockHandle(Rc<RefCell<Block>>);

impl BlockHandle {
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.0.borrow().sector
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.0.borrow().count
    }

    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.0.borrow().len_bytes()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.0.borrow().dirty
    }

    #[must_use]
    pub fn word(&self, offset: usize) -> u16 {
        self.0.borrow().word(offset)
    }

    pub fn set_word(&self, offset: usize, value: u16) {
        self.0.borrow_mut().set_word(offset, value);
    }

    #[must_use]
    pub fn byte(&self, offset: usize) -> u8 {
        self.0.borrow().byte(offset)
    }

    pub fn set_byte(&self, offset: usize, value: u8) {
        self.0.borrow_mut().set_byte(offset, value);
    }

    pub fn copy_out(&self, offset: usize, dest: &mut [u8]) -> Result<()> {
        self.0.borrow().copy_out(offset, dest)
    }

    pub fn copy_in(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.0.borrow_mut().copy_in(offset, src)
    }

    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.0.borrow_mut().copy_within(src, dst, len)
    }

    /// Copy bytes from another cached block into this one.
    ///
    /// Live blocks never share sectors, so `other` must be a different
    /// block.
    pub fn copy_from(&self, other: &BlockHandle, src: usize, dst: usize, len: usize) -> Result<()> {
        assert!(
            !Rc::ptr_eq(&self.0, &other.0),
            "copy_from requires two distinct blocks"
        );
        let src_block = other.0.borrow();
        src_block.check_span(src, len, "copy between blocks")?;
        let mut dst_block = self.0.borrow_mut();
        dst_block.check_span(dst, len, "copy between blocks")?;
        let (src, dst_range) = (&src_block.data[src..src + len], dst..dst + len);
        dst_block.data[dst_range].copy_from_slice(src);
        dst_block.dirty = true;
        Ok(())
    }

    pub fn zero_fill(&self, offset: usize, len: usize) -> Result<()> {
        self.0.borrow_mut().zero_fill(offset, len)
    }
}

// ── The cache ───────────────────────────────────────────────────────────────

/// The mount's block cache.
///
/// Owns every buffered block, kept sorted by starting sector; no two live
/// blocks ever overlap, and no block crosses the end of the volume.
pub struct BlockCache {
    source: Box<dyn DataSource>,
    sectors: u32,
    blocks: RefCell<Vec<Rc<RefCell<Block>>>>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("sectors", &self.sectors)
            .field("blocks", &self.blocks.borrow().len())
            .finish()
    }
}

impl BlockCache {
    /// Wrap a data source; the volume's sector count is derived from its
    /// reported size.
    #[must_use]
    pub fn new(source: Box<dyn DataSource>) -> Self {
        let sectors = (source.len_bytes() / SECTOR_SIZE as u64) as u32;
        debug!(target: "rt11::block", event = "cache_create", sectors);
        Self {
            source,
            sectors,
            blocks: RefCell::new(Vec::new()),
        }
    }

    /// Total sectors on the volume.
    #[must_use]
    pub fn volume_sectors(&self) -> u32 {
        self.sectors
    }

    /// Retrieve a block covering `count` sectors starting at `sector`.
    ///
    /// On a hit the existing block must span exactly the same sectors; a
    /// request that overlaps a cached block without matching it exactly is
    /// invalid. On a miss the data is read through the data source and the
    /// block is cached in sector order.
    pub fn get_block(&self, sector: Sector, count: usize) -> Result<BlockHandle> {
        if count == 0 {
            return Err(Rt11Error::InvalidArgument(
                "block request for zero sectors".to_owned(),
            ));
        }
        if sector.0 as u64 + count as u64 > u64::from(self.sectors) {
            return Err(Rt11Error::Range(format!(
                "block request past end of volume: sector={sector} count={count} volume={}",
                self.sectors
            )));
        }

        let mut insert_at = None;
        {
            let blocks = self.blocks.borrow();
            for (i, cached) in blocks.iter().enumerate() {
                let (base, span) = {
                    let block = cached.borrow();
                    (block.sector, block.count)
                };

                if base == sector {
                    if span != count {
                        return Err(Rt11Error::InvalidArgument(format!(
                            "cached block at sector {sector} spans {span} sectors, not {count}"
                        )));
                    }
                    trace!(target: "rt11::block", event = "cache_hit", sector = sector.0, count);
                    return Ok(BlockHandle(Rc::clone(cached)));
                }

                if sector.0 >= base.0 + span as u32 {
                    continue;
                }
                if sector.0 + count as u32 <= base.0 {
                    insert_at = Some(i);
                    break;
                }
                return Err(Rt11Error::InvalidArgument(format!(
                    "block request [{sector}, +{count}) overlaps cached block [{base}, +{span})"
                )));
            }
        }

        let mut block = Block::new(sector, count);
        block.read_from(self.source.as_ref())?;
        trace!(target: "rt11::block", event = "cache_fill", sector = sector.0, count);

        let entry = Rc::new(RefCell::new(block));
        let handle = BlockHandle(Rc::clone(&entry));
        let mut blocks = self.blocks.borrow_mut();
        match insert_at {
            Some(i) => blocks.insert(i, entry),
            None => blocks.push(entry),
        }
        Ok(handle)
    }

    /// Release a reference to a block.
    ///
    /// The block remains cached (and retains its dirty state) even with no
    /// outstanding references.
    pub fn put_block(&self, handle: BlockHandle) {
        trace!(target: "rt11::block", event = "cache_put", sector = handle.sector().0);
        drop(handle);
    }

    /// Change a block's sector span in place.
    ///
    /// Growing reads the new sectors through the data source and is
    /// rejected if it would overlap the next cached block; shrinking simply
    /// truncates.
    pub fn resize_block(&self, handle: &BlockHandle, new_count: usize) -> Result<()> {
        if new_count == 0 {
            return Err(Rt11Error::InvalidArgument(
                "block resize to zero sectors".to_owned(),
            ));
        }

        let sector = handle.sector();
        if sector.0 as u64 + new_count as u64 > u64::from(self.sectors) {
            return Err(Rt11Error::Range(format!(
                "block resize past end of volume: sector={sector} count={new_count} volume={}",
                self.sectors
            )));
        }

        {
            let blocks = self.blocks.borrow();
            let position = blocks
                .iter()
                .position(|cached| Rc::ptr_eq(cached, &handle.0))
                .ok_or_else(|| {
                    Rt11Error::InvalidArgument("resize of a block not in the cache".to_owned())
                })?;

            if let Some(next) = blocks.get(position + 1) {
                let next_base = next.borrow().sector;
                if sector.0 + new_count as u32 > next_base.0 {
                    return Err(Rt11Error::InvalidArgument(format!(
                        "block resize would overlap cached block at sector {next_base}"
                    )));
                }
            }
        }

        trace!(
            target: "rt11::block",
            event = "cache_resize",
            sector = sector.0,
            from = handle.count(),
            to = new_count
        );
        handle.0.borrow_mut().resize(new_count, self.source.as_ref())
    }

    /// Write every dirty block back to the data source and mark it clean.
    pub fn sync(&self) -> Result<()> {
        let blocks = self.blocks.borrow();
        let mut written = 0_usize;
        for cached in blocks.iter() {
            let mut block = cached.borrow_mut();
            if block.dirty {
                block.write_back(self.source.as_ref())?;
                written += 1;
            }
        }
        if written > 0 {
            debug!(target: "rt11::block", event = "cache_sync", blocks_written = written);
        }
        Ok(())
    }
}
