use std::io;
use thiserror::Error;

/// Failures of the chunk storage engine. The RPC layer never sees these
/// directly; handlers fold them into errno-compatible response codes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Chunk file missing on read.
    #[error("chunk file not found")]
    NotFound,

    /// Local disk failure, carrying the raw errno.
    #[error("storage I/O failure (errno {0})")]
    Io(i32),
}

impl StorageError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Io(errno) => *errno,
        }
    }

    pub fn from_io(e: &io::Error) -> Self {
        Self::Io(e.raw_os_error().unwrap_or(libc::EIO))
    }
}
