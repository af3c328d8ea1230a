#![forbid(unsafe_code)]
//! The RT-11 mount object.
//!
//! [`Rt11Fs`] wires a data source to the block cache, validates and loads
//! the directory, and owns the open-file table. It is the single entry
//! point adapters (FUSE, CLI) talk to; every operation is synchronous and
//! the whole object is strictly single-threaded.

mod files;

pub use files::{Fd, OpenFileTable};
pub use rt11_dir::{DirEnt, DirMove, DirPos, DirPtr, Directory, FsStats};

use rt11_block::{BlockCache, DataSource, FileDataSource};
use rt11_error::{Result, Rt11Error};
use rt11_types::E_PERM;
use std::path::Path;
use std::rc::Rc;
use tracing::{info, warn};

/// A mounted RT-11 volume.
pub struct Rt11Fs {
    cache: Rc<BlockCache>,
    files: OpenFileTable,
}

impl std::fmt::Debug for Rt11Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rt11Fs")
            .field("sectors", &self.cache.volume_sectors())
            .field("open_files", &self.files.open_count())
            .finish()
    }
}

impl Rt11Fs {
    /// Mount a volume from any data source. Directory inconsistencies are
    /// fatal here and nowhere else.
    pub fn mount(source: Box<dyn DataSource>) -> Result<Self> {
        let cache = Rc::new(BlockCache::new(source));
        let dir = Directory::open(Rc::clone(&cache))?;
        let files = OpenFileTable::new(dir, Rc::clone(&cache));
        info!(
            target: "rt11::fs",
            event = "mount",
            sectors = cache.volume_sectors(),
        );
        Ok(Self { cache, files })
    }

    /// Mount a volume image file.
    pub fn mount_path(path: impl AsRef<Path>) -> Result<Self> {
        let source = FileDataSource::open(path)?;
        Self::mount(Box::new(source))
    }

    #[must_use]
    pub fn volume_sectors(&self) -> u32 {
        self.cache.volume_sectors()
    }

    #[must_use]
    pub fn files(&self) -> &OpenFileTable {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut OpenFileTable {
        &mut self.files
    }

    #[must_use]
    pub fn dir(&self) -> &Directory {
        self.files.dir()
    }

    // ── directory surface ───────────────────────────────────────────────

    /// Attributes of a named file.
    pub fn stat(&self, name: &str) -> Result<DirEnt> {
        self.files.dir().get_ent(name)
    }

    /// Attributes plus the directory position of a named file.
    pub fn stat_at(&self, name: &str) -> Result<(DirPos, DirEnt)> {
        let dir = self.files.dir();
        let ptr = dir.lookup(name)?;
        let ent = dir
            .entry_at(&ptr)
            .ok_or_else(|| Rt11Error::NotFound(name.to_owned()))?;
        let pos = ptr
            .position()
            .ok_or_else(|| Rt11Error::NotFound(name.to_owned()))?;
        Ok((pos, ent))
    }

    /// Attributes of the entry at a directory position.
    pub fn entry_at(&self, pos: DirPos) -> Result<DirEnt> {
        let dir = self.files.dir();
        let ptr = dir.pointer_at(pos)?;
        dir.entry_at(&ptr)
            .ok_or_else(|| Rt11Error::NotFound(format!("no entry at {pos}")))
    }

    /// Every committed file, with its directory position, in scan order.
    #[must_use]
    pub fn list(&self) -> Vec<(DirPos, DirEnt)> {
        let dir = self.files.dir();
        let mut out = Vec::new();
        let mut scan = dir.start_scan();
        while dir.move_next_filtered(&mut scan, E_PERM) {
            if let (Some(pos), Some(ent)) = (scan.position(), dir.entry_at(&scan)) {
                out.push((pos, ent));
            }
        }
        out
    }

    /// Volume statistics.
    #[must_use]
    pub fn statfs(&self) -> FsStats {
        self.files.dir().statfs()
    }

    // ── file surface ────────────────────────────────────────────────────

    pub fn open(&mut self, name: &str) -> Result<Fd> {
        self.files.open_file(name)
    }

    pub fn open_at(&mut self, pos: DirPos) -> Result<Fd> {
        self.files.open_at(pos)
    }

    pub fn create(&mut self, name: &str) -> Result<Fd> {
        self.files.create_file(name)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.files.close_file(fd)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.files.read_file(fd, buf, offset)
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize> {
        self.files.write_file(fd, buf, offset)
    }

    pub fn truncate(&mut self, fd: Fd, new_size: u64) -> Result<()> {
        self.files.truncate_file(fd, new_size)
    }

    pub fn truncate_at(&mut self, pos: DirPos, new_size: u64) -> Result<()> {
        self.files.truncate_at(pos, new_size)
    }

    pub fn unlink(&mut self, name: &str) -> Result<()> {
        self.files.unlink(name)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.files.rename(old, new)
    }

    /// Write every dirty block back to the data source.
    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }
}

impl Drop for Rt11Fs {
    /// Unmount: a final implicit write-back of whatever is still dirty.
    fn drop(&mut self) {
        if let Err(err) = self.cache.sync() {
            warn!(target: "rt11::fs", event = "unmount_sync_failed", error = %err);
        }
    }
}
