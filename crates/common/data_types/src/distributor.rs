//! Chunk placement: maps `(path, chunk_id)` to the daemon owning that
//! chunk. The mapping must be identical on every client and daemon of a
//! mount, so it is a pure function of its inputs and the fixed host count.

use xxhash_rust::xxh3::Xxh3;

/// Stable hash-based placement over a fixed set of daemons.
///
/// Hashes the path bytes concatenated with the little-endian chunk id and
/// reduces modulo the host count. Including the chunk id in the hash keeps
/// sequential chunks of one file from piling onto a single daemon.
#[derive(Debug, Clone, Copy)]
pub struct SimpleHashDistributor {
    host_count: u32,
}

impl SimpleHashDistributor {
    /// `host_count` is the cluster size and must be non-zero; membership is
    /// fixed for the lifetime of a mount.
    pub fn new(host_count: u32) -> Self {
        assert!(host_count > 0, "cluster must have at least one daemon");
        Self { host_count }
    }

    pub fn host_count(&self) -> u32 {
        self.host_count
    }

    /// Daemon id in `[0, host_count)` owning chunk `chunk_id` of `path`.
    pub fn locate_data(&self, path: &str, chunk_id: u64) -> u32 {
        let mut hasher = Xxh3::new();
        hasher.update(path.as_bytes());
        hasher.update(&chunk_id.to_le_bytes());
        (hasher.digest() % u64::from(self.host_count)) as u32
    }
}
