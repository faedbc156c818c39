//! Node-local chunk storage engine.
//!
//! Every logical file is represented by one flat directory under the data
//! root (no directory hierarchy is mirrored); every chunk is one regular
//! file in it, named by its decimal index. A file `/foo/bar` with chunks 0
//! and 3 on this daemon occupies `<root>/foo:bar/0` and `<root>/foo:bar/3`.
//!
//! The engine holds no shared mutable state beyond the immutable root and
//! chunk size; concurrent writes to disjoint chunks are safe, concurrent
//! writes to one chunk are last-writer-wins at positioned-write
//! granularity.

use crate::error::StorageError;
use data_types::{ChunkStat, layout};
use std::ffi::CString;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct ChunkStorage {
    root_path: PathBuf,
    chunk_size: u64,
}

fn interrupted(e: &io::Error) -> bool {
    // EINTR or EAGAIN/EWOULDBLOCK: retry the positioned I/O call
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

impl ChunkStorage {
    /// Open the engine over an existing data root. Refuses a relative
    /// root, a zero chunk size, or a root without read+write access; the
    /// daemon must not come up in any of those states.
    pub fn open(root_path: &Path, chunk_size: u64) -> Result<Self, StorageError> {
        if !root_path.is_absolute() || chunk_size == 0 {
            return Err(StorageError::Io(libc::EINVAL));
        }
        let c_root = CString::new(root_path.as_os_str().as_bytes())
            .map_err(|_| StorageError::Io(libc::EINVAL))?;
        if unsafe { libc::access(c_root.as_ptr(), libc::W_OK | libc::R_OK) } != 0 {
            warn!(root = %root_path.display(),
                "insufficient permissions to create chunk directories");
            return Err(StorageError::Io(libc::EPERM));
        }
        debug!(root = %root_path.display(), chunk_size, "chunk storage initialized");
        Ok(Self {
            root_path: root_path.to_path_buf(),
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn chunks_dir(&self, file_path: &str) -> PathBuf {
        self.root_path.join(layout::chunk_dir_name(file_path))
    }

    fn chunk_path(&self, file_path: &str, chunk_id: u64) -> PathBuf {
        self.chunks_dir(file_path)
            .join(layout::chunk_file_name(chunk_id))
    }

    /// Create the per-file chunk directory if absent.
    pub fn init_chunk_space(&self, file_path: &str) -> Result<(), StorageError> {
        let chunk_dir = self.chunks_dir(file_path);
        match DirBuilder::new().mode(0o750).create(&chunk_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => {
                warn!(dir = %chunk_dir.display(), error = %e,
                    "failed to create chunk directory");
                Err(StorageError::from_io(&e))
            }
        }
    }

    /// Write `buf` at `offset` within a chunk file, creating the file and
    /// its directory as needed. Returns the bytes written, which equals
    /// `buf.len()` on success.
    pub fn write_chunk(
        &self,
        file_path: &str,
        chunk_id: u64,
        buf: &[u8],
        offset: u64,
    ) -> Result<u64, StorageError> {
        debug_assert!(offset + buf.len() as u64 <= self.chunk_size);
        self.init_chunk_space(file_path)?;

        let chunk_path = self.chunk_path(file_path, chunk_id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o640)
            .open(&chunk_path)
            .map_err(|e| {
                warn!(chunk = %chunk_path.display(), error = %e,
                    "failed to open chunk file for write");
                StorageError::from_io(&e)
            })?;

        let mut wrote_total = 0usize;
        while wrote_total != buf.len() {
            match file.write_at(&buf[wrote_total..], offset + wrote_total as u64) {
                // pwrite never returns 0 for a non-empty buffer; treat it
                // as a failed disk rather than spinning
                Ok(0) => return Err(StorageError::Io(libc::EIO)),
                Ok(wrote) => wrote_total += wrote,
                Err(e) if interrupted(&e) => continue,
                Err(e) => {
                    warn!(chunk = %chunk_path.display(), size = buf.len(), offset,
                        error = %e, "failed to write chunk file");
                    return Err(StorageError::from_io(&e));
                }
            }
        }
        Ok(wrote_total as u64)
    }

    /// Read up to `buf.len()` bytes at `offset` within a chunk file. A
    /// short read means end-of-file and is not an error; a missing chunk
    /// file is `StorageError::NotFound`.
    pub fn read_chunk(
        &self,
        file_path: &str,
        chunk_id: u64,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<u64, StorageError> {
        debug_assert!(offset + buf.len() as u64 <= self.chunk_size);
        let chunk_path = self.chunk_path(file_path, chunk_id);
        let file = match OpenOptions::new().read(true).open(&chunk_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => {
                warn!(chunk = %chunk_path.display(), error = %e,
                    "failed to open chunk file for read");
                return Err(StorageError::from_io(&e));
            }
        };

        let mut read_total = 0usize;
        while read_total != buf.len() {
            match file.read_at(&mut buf[read_total..], offset + read_total as u64) {
                // end-of-file; repeated reads would keep returning 0
                Ok(0) => break,
                Ok(read) => read_total += read,
                Err(e) if interrupted(&e) => continue,
                Err(e) => {
                    warn!(chunk = %chunk_path.display(), size = buf.len(), offset,
                        error = %e, "failed to read chunk file");
                    return Err(StorageError::from_io(&e));
                }
            }
        }
        if read_total < buf.len() {
            debug!(read_total, requested = buf.len(),
                "read less bytes than requested, this is not an error");
        }
        Ok(read_total as u64)
    }

    /// Truncate one chunk file to `length` bytes, `0 < length ≤ chunk
    /// size`. Removing a chunk entirely is `trim_chunk_space`'s job.
    pub fn truncate_chunk_file(
        &self,
        file_path: &str,
        chunk_id: u64,
        length: u64,
    ) -> Result<(), StorageError> {
        debug_assert!(length > 0 && length <= self.chunk_size);
        let chunk_path = self.chunk_path(file_path, chunk_id);
        let file = OpenOptions::new()
            .write(true)
            .open(&chunk_path)
            .map_err(|e| {
                warn!(chunk = %chunk_path.display(), error = %e,
                    "failed to open chunk file for truncate");
                StorageError::from_io(&e)
            })?;
        file.set_len(length).map_err(|e| {
            warn!(chunk = %chunk_path.display(), length, error = %e,
                "failed to truncate chunk file");
            StorageError::from_io(&e)
        })
    }

    /// Remove every chunk file with index `>= chunk_start`.
    ///
    /// There is no lock preventing concurrent modification of the
    /// directory; it is the application's responsibility to stop writing
    /// while truncating. Removal continues past individual failures and a
    /// single aggregated `EIO` is reported at the end.
    pub fn trim_chunk_space(&self, file_path: &str, chunk_start: u64) -> Result<(), StorageError> {
        let chunk_dir = self.chunks_dir(file_path);
        let entries = match fs::read_dir(&chunk_dir) {
            Ok(entries) => entries,
            // no chunks of this file live here
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(dir = %chunk_dir.display(), error = %e,
                    "failed to enumerate chunk directory");
                return Err(StorageError::from_io(&e));
            }
        };

        let mut err_flag = false;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %chunk_dir.display(), error = %e,
                        "failed to read chunk directory entry");
                    err_flag = true;
                    continue;
                }
            };
            let file_name = entry.file_name();
            let chunk_id = match file_name.to_str().and_then(|name| name.parse::<u64>().ok()) {
                Some(chunk_id) => chunk_id,
                None => {
                    warn!(dir = %chunk_dir.display(), entry = ?file_name,
                        "unexpected entry in chunk directory");
                    err_flag = true;
                    continue;
                }
            };
            if chunk_id >= chunk_start
                && let Err(e) = fs::remove_file(entry.path())
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(chunk = %entry.path().display(), error = %e,
                    "failed to remove chunk file");
                err_flag = true;
            }
        }
        if err_flag {
            return Err(StorageError::Io(libc::EIO));
        }
        Ok(())
    }

    /// Remove the per-file chunk directory and everything in it. A missing
    /// directory is success.
    pub fn destroy_chunk_space(&self, file_path: &str) -> Result<(), StorageError> {
        let chunk_dir = self.chunks_dir(file_path);
        match fs::remove_dir_all(&chunk_dir) {
            Ok(()) => {
                debug!(dir = %chunk_dir.display(), "removed chunk directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(dir = %chunk_dir.display(), error = %e,
                    "failed to remove chunk directory");
                Err(StorageError::from_io(&e))
            }
        }
    }

    /// Capacity of the backing local filesystem in chunk units.
    pub fn chunk_stat(&self) -> Result<ChunkStat, StorageError> {
        let c_root = CString::new(self.root_path.as_os_str().as_bytes())
            .map_err(|_| StorageError::Io(libc::EINVAL))?;
        let mut sfs: libc::statfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statfs(c_root.as_ptr(), &mut sfs) } != 0 {
            let e = io::Error::last_os_error();
            warn!(root = %self.root_path.display(), error = %e,
                "failed to get filesystem statistics for chunk directory");
            return Err(StorageError::from_io(&e));
        }

        debug!(block_size = sfs.f_bsize, blocks_total = sfs.f_blocks,
            blocks_avail = sfs.f_bavail, "local filesystem statistics");
        let bytes_total = sfs.f_bsize as u64 * sfs.f_blocks;
        let bytes_free = sfs.f_bsize as u64 * sfs.f_bavail;
        Ok(ChunkStat {
            chunk_size: self.chunk_size,
            chunk_total: bytes_total / self.chunk_size,
            chunk_free: bytes_free / self.chunk_size,
        })
    }
}
