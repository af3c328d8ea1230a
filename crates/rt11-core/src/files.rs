//! The open-file table.
//!
//! File handles are small integers referring to live directory positions.
//! Structural directory operations return move lists; the table applies
//! them to every live handle so the held cursors keep pointing at the
//! right entries. File content I/O goes through the block cache one sector
//! at a time.

use rt11_block::BlockCache;
use rt11_dir::{DirMove, DirPos, DirPtr, Directory};
use rt11_error::{Result, Rt11Error};
use rt11_types::{E_PERM, E_TENT, SECTOR_SIZE};
use std::rc::Rc;
use tracing::{debug, trace};

/// An open-file handle.
pub type Fd = usize;

#[derive(Debug)]
struct OpenFileEntry {
    refcount: u32,
    ptr: DirPtr,
}

/// Tracks every open file of the mount.
///
/// Entries are refcounted: opening an already-open file returns the same
/// handle, and a slot becomes reusable when its count drops to zero. The
/// table owns the directory; the directory reports entry movements and the
/// table rebinds affected handles in a single pass.
#[derive(Debug)]
pub struct OpenFileTable {
    dir: Directory,
    cache: Rc<BlockCache>,
    entries: Vec<OpenFileEntry>,
}

impl OpenFileTable {
    pub fn new(dir: Directory, cache: Rc<BlockCache>) -> Self {
        Self {
            dir,
            cache,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Directory {
        &self.dir
    }

    pub fn dir_mut(&mut self) -> &mut Directory {
        &mut self.dir
    }

    /// Open a file by name.
    pub fn open_file(&mut self, name: &str) -> Result<Fd> {
        let ptr = self.dir.lookup(name)?;
        Ok(self.open_pointer(ptr))
    }

    /// Open the file at a known directory position.
    pub fn open_at(&mut self, pos: DirPos) -> Result<Fd> {
        let ptr = self.dir.pointer_at(pos)?;
        if !ptr.has_status(E_TENT) && !ptr.has_status(E_PERM) {
            return Err(Rt11Error::NotFound(format!("no file at {pos}")));
        }
        Ok(self.open_pointer(ptr))
    }

    /// Create a file. An existing file of the same name is opened and
    /// truncated to zero instead.
    pub fn create_file(&mut self, name: &str) -> Result<Fd> {
        match self.dir.lookup(name) {
            Ok(mut ptr) => {
                let moves = self.dir.truncate(&mut ptr, 0)?;
                self.apply_moves(&moves)?;
                Ok(self.open_pointer(ptr))
            }
            Err(Rt11Error::NotFound(_)) => {
                let (ptr, moves) = self.dir.create_entry(name)?;
                self.apply_moves(&moves)?;
                Ok(self.open_pointer(ptr))
            }
            Err(err) => Err(err),
        }
    }

    /// Release a reference. Dropping the last reference commits a
    /// tentative entry and syncs the cache.
    pub fn close_file(&mut self, fd: Fd) -> Result<()> {
        {
            let entry = self.live_mut(fd)?;
            entry.refcount -= 1;
            if entry.refcount > 0 {
                return Ok(());
            }
        }

        let ptr = self.entries[fd].ptr.clone();
        self.dir.make_entry_permanent(&ptr);
        debug!(target: "rt11::files", event = "close", fd);
        self.cache.sync()
    }

    /// Read file bytes; reads past the end of the file are clamped, so the
    /// returned count may be short.
    pub fn read_file(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        let entry = self.live(fd)?;
        let file_sectors = u64::from(entry.ptr.length_sectors());
        let sector0 = entry.ptr.data_sector();

        let end = offset + buf.len() as u64;
        let mut at = offset;
        let mut done = 0_usize;
        while at < end {
            let sector = at / SECTOR_SIZE as u64;
            if sector >= file_sectors {
                break;
            }
            let within = (at % SECTOR_SIZE as u64) as usize;
            let take = (SECTOR_SIZE - within).min((end - at) as usize);

            let blk = self.cache.get_block(sector0 + sector as u32, 1)?;
            blk.copy_out(within, &mut buf[done..done + take])?;
            self.cache.put_block(blk);

            done += take;
            at += take as u64;
        }

        trace!(target: "rt11::files", event = "read", fd, offset, bytes = done);
        Ok(done)
    }

    /// Write file bytes, growing the file first when the write extends past
    /// its current length.
    pub fn write_file(&mut self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize> {
        let entry = self.live(fd)?;
        let end = offset + buf.len() as u64;
        let length = u64::from(entry.ptr.length_sectors()) * SECTOR_SIZE as u64;

        let extend = end > length;
        if extend {
            let mut ptr = self.entries[fd].ptr.clone();
            let moves = self.dir.truncate(&mut ptr, end)?;
            self.apply_moves(&moves)?;
        }

        // re-read the handle: the grow may have moved the file
        let ptr = self.live(fd)?.ptr.clone();
        let sector0 = ptr.data_sector();

        let mut at = offset;
        let mut done = 0_usize;
        while at < end {
            let sector = at / SECTOR_SIZE as u64;
            let within = (at % SECTOR_SIZE as u64) as usize;
            let take = (SECTOR_SIZE - within).min((end - at) as usize);

            let blk = self.cache.get_block(sector0 + sector as u32, 1)?;
            blk.copy_in(within, &buf[done..done + take])?;
            if extend && within + take < SECTOR_SIZE {
                // a freshly grown last sector may hold garbage from a
                // relocated neighbour past the written range
                blk.zero_fill(within + take, SECTOR_SIZE - (within + take))?;
            }
            self.cache.put_block(blk);

            done += take;
            at += take as u64;
        }

        trace!(target: "rt11::files", event = "write", fd, offset, bytes = done);
        Ok(done)
    }

    /// Resize an open file.
    pub fn truncate_file(&mut self, fd: Fd, new_size: u64) -> Result<()> {
        self.live(fd)?;
        let mut ptr = self.entries[fd].ptr.clone();
        let moves = self.dir.truncate(&mut ptr, new_size)?;
        self.apply_moves(&moves)
    }

    /// Resize the file at a directory position, fixing up any open handles.
    pub fn truncate_at(&mut self, pos: DirPos, new_size: u64) -> Result<()> {
        let mut ptr = self.dir.pointer_at(pos)?;
        let moves = self.dir.truncate(&mut ptr, new_size)?;
        self.apply_moves(&moves)
    }

    /// Remove a file by name.
    pub fn unlink(&mut self, name: &str) -> Result<()> {
        let moves = self.dir.remove_entry(name)?;
        self.apply_moves(&moves)
    }

    /// Rename a file, replacing any existing file under the new name.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let moves = self.dir.rename(old, new)?;
        self.apply_moves(&moves)
    }

    /// Number of live handles, for diagnostics.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|e| e.refcount > 0).count()
    }

    fn open_pointer(&mut self, ptr: DirPtr) -> Fd {
        let pos = ptr.position();
        if let Some(fd) = self
            .entries
            .iter()
            .position(|e| e.refcount > 0 && e.ptr.position() == pos)
        {
            self.entries[fd].refcount += 1;
            return fd;
        }

        let entry = OpenFileEntry { refcount: 1, ptr };
        let fd = match self.entries.iter().position(|e| e.refcount == 0) {
            Some(slot) => {
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        debug!(target: "rt11::files", event = "open", fd);
        fd
    }

    fn live(&self, fd: Fd) -> Result<&OpenFileEntry> {
        self.entries
            .get(fd)
            .filter(|e| e.refcount > 0)
            .ok_or(Rt11Error::BadHandle(fd))
    }

    fn live_mut(&mut self, fd: Fd) -> Result<&mut OpenFileEntry> {
        self.entries
            .get_mut(fd)
            .filter(|e| e.refcount > 0)
            .ok_or(Rt11Error::BadHandle(fd))
    }

    /// Rebind every live handle whose position an operation moved. Handles
    /// not named in the list are left untouched; entry movement never
    /// changes the underlying file's data sectors, so their cursors stay
    /// accurate.
    fn apply_moves(&mut self, moves: &[DirMove]) -> Result<()> {
        if moves.is_empty() {
            return Ok(());
        }

        let mut rebind = Vec::new();
        for (fd, entry) in self.entries.iter().enumerate() {
            if entry.refcount == 0 {
                continue;
            }
            let Some(pos) = entry.ptr.position() else {
                continue;
            };
            if let Some(moved) = moves.iter().find(|m| m.from == pos) {
                rebind.push((fd, moved.to));
            }
        }

        for (fd, to) in rebind {
            trace!(target: "rt11::files", event = "rebind", fd, segment = to.segment, index = to.index);
            self.entries[fd].ptr = self.dir.pointer_at(to)?;
        }
        Ok(())
    }
}
