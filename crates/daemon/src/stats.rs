//! Optional chunk-activity statistics. Counters are lock-free so tasklets
//! on different workers never serialize on accounting.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataOp {
    WriteChunk,
    ReadChunk,
    Truncate,
}

impl DataOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOp::WriteChunk => "write_chunk",
            DataOp::ReadChunk => "read_chunk",
            DataOp::Truncate => "truncate",
        }
    }

    pub fn all() -> [DataOp; 3] {
        [DataOp::WriteChunk, DataOp::ReadChunk, DataOp::Truncate]
    }
}

#[derive(Default)]
pub struct ChunkStats {
    operations: DashMap<DataOp, AtomicU64>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl ChunkStats {
    pub fn new() -> Self {
        let operations = DashMap::new();
        for op in DataOp::all() {
            operations.insert(op, AtomicU64::new(0));
        }
        Self {
            operations,
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    fn increment(&self, op: DataOp) {
        if let Some(counter) = self.operations.get(&op) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_write(&self, bytes: u64) {
        self.increment(DataOp::WriteChunk);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_read(&self, bytes: u64) {
        self.increment(DataOp::ReadChunk);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_truncate(&self) {
        self.increment(DataOp::Truncate);
    }

    pub fn op_count(&self, op: DataOp) -> u64 {
        self.operations
            .get(&op)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}
