#![forbid(unsafe_code)]
//! Error types for the RT-11 filesystem driver.
//!
//! Defines `Rt11Error` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all driver operations.
#[derive(Debug, Error)]
pub enum Rt11Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O range error: {0}")]
    Range(String),

    #[error("invalid filename: {0:?}")]
    InvalidName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no space left on volume")]
    NoSpace,

    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("bad file handle {0}")]
    BadHandle(usize),
}

impl Rt11Error {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Range(_) => libc::EIO,
            Self::InvalidName(_) | Self::InvalidArgument(_) | Self::Corrupt(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::BadHandle(_) => libc::EBADF,
        }
    }
}

/// Result alias using `Rt11Error`.
pub type Result<T> = std::result::Result<T, Rt11Error>;
