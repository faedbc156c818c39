//! Chunk operations executed on the I/O pool.

use crate::storage::ChunkStorage;
use crate::task::TaskResult;
use bytes::Bytes;
use tracing::warn;

/// One unit of chunk work. Each variant carries only the state its
/// operation needs; `execute` is the single dispatch point into the
/// storage engine.
pub enum ChunkOp {
    Write {
        path: String,
        chunk_id: u64,
        data: Bytes,
        offset: u64,
    },
    Read {
        path: String,
        chunk_id: u64,
        size: u64,
        offset: u64,
    },
    /// Daemon-side part of a file truncate: drop every chunk at or above
    /// `trim_start` and, when this daemon owns the boundary chunk, cut it
    /// to the remainder. `trim_start == 0` with no boundary means truncate
    /// to zero, which removes the whole chunk space.
    Truncate {
        path: String,
        trim_start: u64,
        boundary: Option<(u64, u64)>,
    },
}

impl ChunkOp {
    /// Runs on a blocking I/O worker. Read returns the bytes it filled,
    /// truncated to the actual read length; other variants return no data.
    pub fn execute(self, storage: &ChunkStorage) -> (TaskResult, Option<Vec<u8>>) {
        match self {
            ChunkOp::Write {
                path,
                chunk_id,
                data,
                offset,
            } => match storage.write_chunk(&path, chunk_id, &data, offset) {
                Ok(wrote) => (TaskResult::ok(wrote), None),
                Err(e) => {
                    warn!(%path, chunk_id, error = %e, "chunk write failed");
                    (TaskResult::err(e.errno()), None)
                }
            },
            ChunkOp::Read {
                path,
                chunk_id,
                size,
                offset,
            } => {
                let mut buf = vec![0u8; size as usize];
                match storage.read_chunk(&path, chunk_id, &mut buf, offset) {
                    Ok(read) => {
                        buf.truncate(read as usize);
                        (TaskResult::ok(read), Some(buf))
                    }
                    Err(e) => (TaskResult::err(e.errno()), None),
                }
            }
            ChunkOp::Truncate {
                path,
                trim_start,
                boundary,
            } => {
                let result = if trim_start == 0 && boundary.is_none() {
                    storage.destroy_chunk_space(&path)
                } else {
                    storage.trim_chunk_space(&path, trim_start).and_then(|()| {
                        match boundary {
                            Some((chunk_id, length)) => {
                                storage.truncate_chunk_file(&path, chunk_id, length)
                            }
                            None => Ok(()),
                        }
                    })
                };
                match result {
                    Ok(()) => (TaskResult::ok(0), None),
                    Err(e) => {
                        warn!(%path, trim_start, error = %e, "chunk truncate failed");
                        (TaskResult::err(e.errno()), None)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn storage(dir: &tempfile::TempDir) -> ChunkStorage {
        ChunkStorage::open(dir.path(), 1024).unwrap()
    }

    #[test]
    fn test_write_then_read_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let write = ChunkOp::Write {
            path: "/x".into(),
            chunk_id: 1,
            data: Bytes::from_static(b"payload"),
            offset: 4,
        };
        let (result, data) = write.execute(&storage);
        assert_eq!(result.errno, 0);
        assert_eq!(result.bytes, 7);
        assert!(data.is_none());

        let read = ChunkOp::Read {
            path: "/x".into(),
            chunk_id: 1,
            size: 64,
            offset: 0,
        };
        let (result, data) = read.execute(&storage);
        assert_eq!(result.errno, 0);
        assert_eq!(result.bytes, 11);
        assert_eq!(&data.unwrap()[4..], b"payload");
    }

    #[test]
    fn test_read_missing_chunk_is_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let read = ChunkOp::Read {
            path: "/missing".into(),
            chunk_id: 0,
            size: 8,
            offset: 0,
        };
        let (result, data) = read.execute(&storage);
        assert_eq!(result.errno, libc::ENOENT);
        assert!(data.is_none());
    }

    #[test]
    fn test_truncate_op_trims_and_cuts_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        for chunk_id in 0..5 {
            storage
                .write_chunk("/d", chunk_id, &[0xaau8; 1000], 0)
                .unwrap();
        }

        let truncate = ChunkOp::Truncate {
            path: "/d".into(),
            trim_start: 2,
            boundary: Some((1, 476)),
        };
        let (result, _) = truncate.execute(&storage);
        assert_eq!(result.errno, 0);

        let chunk_dir = dir.path().join("d");
        assert!(chunk_dir.join("0").exists());
        assert_eq!(std::fs::metadata(chunk_dir.join("1")).unwrap().len(), 476);
        assert!(!chunk_dir.join("2").exists());
    }

    #[test]
    fn test_truncate_to_zero_destroys_chunk_space() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.write_chunk("/gone", 0, b"x", 0).unwrap();

        let truncate = ChunkOp::Truncate {
            path: "/gone".into(),
            trim_start: 0,
            boundary: None,
        };
        let (result, _) = truncate.execute(&storage);
        assert_eq!(result.errno, 0);
        assert!(!Path::new(&dir.path().join("gone")).exists());
    }
}
