#![forbid(unsafe_code)]
//! FUSE adapter for mounted RT-11 volumes.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via
//! the `fuser` crate, get forwarded to an [`Rt11Fs`], and errors are mapped
//! to POSIX errno codes through `to_errno()`. The volume is a single flat
//! namespace under the mount root.
//!
//! Inode numbers are derived from `(segment, index)` positions, which move
//! as files are resized; every TTL is therefore zero so the kernel
//! revalidates on each access. Unimplemented operations fall through to
//! fuser's `ENOSYS` defaults.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use rt11_core::{DirEnt, DirPos, Rt11Fs};
use rt11_types::{E_READ, SECTOR_SIZE};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;

/// Entries move as files resize, so nothing may be cached.
const TTL: Duration = Duration::ZERO;

const ROOT_INO: u64 = 1;

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

/// FUSE adapter wrapping a mounted volume.
///
/// The FUSE session runs on the mounting thread, so requests reach the
/// single-threaded core strictly serialized.
pub struct Rt11Fuse {
    fs: Rt11Fs,
}

impl Rt11Fuse {
    #[must_use]
    pub fn new(fs: Rt11Fs) -> Self {
        Self { fs }
    }

    fn entries_per_segment(&self) -> u64 {
        self.fs.dir().max_entries_per_segment() as u64
    }

    fn ino_for(&self, pos: DirPos) -> u64 {
        2 + (u64::from(pos.segment) - 1) * self.entries_per_segment() + u64::from(pos.index)
    }

    fn pos_for(&self, ino: u64) -> Option<DirPos> {
        if ino < 2 {
            return None;
        }
        let linear = ino - 2;
        let per = self.entries_per_segment();
        Some(DirPos {
            segment: (linear / per + 1) as u16,
            index: (linear % per) as u16,
        })
    }

    fn root_attr(&self, req: &Request<'_>) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o777,
            nlink: 3,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: SECTOR_SIZE as u32,
            flags: 0,
        }
    }

    fn file_attr(&self, req: &Request<'_>, pos: DirPos, ent: &DirEnt) -> FileAttr {
        let mut perm = 0o444;
        if ent.status & E_READ == 0 {
            perm |= 0o222;
        }
        let created = ent
            .created
            .map_or(SystemTime::UNIX_EPOCH, SystemTime::from);
        FileAttr {
            ino: self.ino_for(pos),
            size: ent.length,
            blocks: ent.length / SECTOR_SIZE as u64,
            atime: created,
            mtime: created,
            ctime: created,
            crtime: created,
            kind: FileType::RegularFile,
            perm,
            nlink: 1,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: SECTOR_SIZE as u32,
            flags: 0,
        }
    }

    /// Flat namespace: the name must be a direct child of the root.
    fn child_name<'n>(parent: u64, name: &'n OsStr) -> Result<&'n str, c_int> {
        if parent != ROOT_INO {
            return Err(libc::ENOENT);
        }
        match name.to_str() {
            Some(name) if !name.is_empty() && !name.contains('/') => Ok(name),
            _ => Err(libc::EINVAL),
        }
    }
}

impl Filesystem for Rt11Fuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(err) = self.fs.sync() {
            warn!(error = %err, "sync at unmount failed");
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match Self::child_name(parent, name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.stat_at(name) {
            Ok((pos, ent)) => reply.entry(&TTL, &self.file_attr(req, pos, &ent), 0),
            Err(e) => {
                if e.to_errno() != libc::ENOENT {
                    warn!(name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            return reply.attr(&TTL, &self.root_attr(req));
        }
        let Some(pos) = self.pos_for(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.entry_at(pos) {
            Ok(ent) => reply.attr(&TTL, &self.file_attr(req, pos, &ent)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == ROOT_INO {
            return reply.attr(&TTL, &self.root_attr(req));
        }
        let Some(pos) = self.pos_for(ino) else {
            return reply.error(libc::ENOENT);
        };

        // resolve the name first: a truncation can move the entry
        let name = match self.fs.entry_at(pos) {
            Ok(ent) => ent.name,
            Err(e) => return reply.error(e.to_errno()),
        };

        if let Some(size) = size {
            let result = match fh {
                Some(fh) => self.fs.truncate(fh as usize, size),
                None => self.fs.truncate_at(pos, size),
            };
            if let Err(e) = result {
                warn!(ino, size, error = %e, "truncate failed");
                return reply.error(e.to_errno());
            }
        }

        match self.fs.stat_at(&name) {
            Ok((pos, ent)) => reply.attr(&TTL, &self.file_attr(req, pos, &ent)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(pos) = self.pos_for(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.fs.open_at(pos) {
            Ok(fd) => reply.opened(fd as u64, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match Self::child_name(parent, name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let fd = match self.fs.create(name) {
            Ok(fd) => fd,
            Err(e) => {
                warn!(name, error = %e, "create failed");
                return reply.error(e.to_errno());
            }
        };
        match self.fs.stat_at(name) {
            Ok((pos, ent)) => {
                reply.created(&TTL, &self.file_attr(req, pos, &ent), 0, fd as u64, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        let mut buf = vec![0_u8; size as usize];
        match self.fs.read(fh as usize, &mut buf, offset) {
            Ok(got) => reply.data(&buf[..got]),
            Err(e) => {
                warn!(fh, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.fs.write(fh as usize, data, offset) {
            Ok(wrote) => reply.written(wrote as u32),
            Err(e) => {
                warn!(fh, offset, error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.close(fh as usize) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            return reply.error(libc::ENOTDIR);
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ROOT_INO, FileType::Directory, ".".to_owned()),
            (ROOT_INO, FileType::Directory, "..".to_owned()),
        ];
        for (pos, ent) in self.fs.list() {
            entries.push((self.ino_for(pos), FileType::RegularFile, ent.name));
        }

        for (i, (ino, kind, name)) in entries
            .into_iter()
            .enumerate()
            .skip(usize::try_from(offset).unwrap_or(0))
        {
            if reply.add(ino, (i + 1) as i64, kind, OsStr::new(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.avail_blocks,
            stats.total_files,
            stats.free_files,
            stats.block_size,
            stats.name_max,
            stats.block_size,
        );
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::child_name(parent, name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.unlink(name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old, new) = match (
            Self::child_name(parent, name),
            Self::child_name(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        match self.fs.rename(old, new) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("rt11fs".to_owned()),
        MountOption::Subtype("rt11".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Serve a mounted volume at `mountpoint`, blocking until unmount.
pub fn mount(
    fs: Rt11Fs,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    fuser::mount2(Rt11Fuse::new(fs), mountpoint, &fuse_opts)?;
    Ok(())
}
