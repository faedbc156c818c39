pub mod distributor;
pub mod layout;

pub use distributor::SimpleHashDistributor;

/// Capacity report of a daemon's local chunk backend, all values in units
/// of the configured chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStat {
    pub chunk_size: u64,
    pub chunk_total: u64,
    pub chunk_free: u64,
}
