//! Request planning: translate one byte-range operation into per-daemon
//! sub-requests.
//!
//! The range `[offset, offset + size)` covers the chunk interval
//! `[chunk_start, chunk_end]`; every chunk is owned by exactly one daemon,
//! so the interval is grouped by owner. Each target receives the full
//! interval bounds, its ownership bitset over the interval, and the byte
//! total it moves; per-chunk geometry is recomputed daemon-side from the
//! same arithmetic.

use data_types::{SimpleHashDistributor, layout};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPlan {
    pub host: u32,
    /// Chunks of the interval owned by this daemon, ascending.
    pub chunk_ids: Vec<u64>,
    /// Bytes this daemon moves: full chunks, shortened at the interval
    /// edges it owns.
    pub total_chunk_size: u64,
    /// Ownership bits over `[chunk_start, chunk_end]`.
    pub bitset: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub chunk_start: u64,
    pub chunk_end: u64,
    /// In-chunk offset of the first chunk of the interval; sent to every
    /// target since origin-offset arithmetic depends on it.
    pub offset: u64,
    /// Per-daemon sub-requests, ascending by host id.
    pub targets: Vec<TargetPlan>,
}

pub fn plan_range(
    path: &str,
    offset: u64,
    size: u64,
    chunk_size: u64,
    distributor: &SimpleHashDistributor,
) -> RequestPlan {
    debug_assert!(size > 0);
    let chunk_start = layout::chunk_id_for_offset(offset, chunk_size);
    let chunk_end = layout::chunk_id_for_range_end(offset, size, chunk_size);
    let interval_len = (chunk_end - chunk_start + 1) as usize;
    let end = offset + size;

    let mut targets: BTreeMap<u32, TargetPlan> = BTreeMap::new();
    for chunk_id in chunk_start..=chunk_end {
        let host = distributor.locate_data(path, chunk_id);
        let target = targets.entry(host).or_insert_with(|| TargetPlan {
            host,
            chunk_ids: Vec::new(),
            total_chunk_size: 0,
            bitset: vec![false; interval_len],
        });

        let mut chunk_bytes = chunk_size;
        if chunk_id == chunk_start {
            chunk_bytes -= layout::left_pad(offset, chunk_size);
        }
        if chunk_id == chunk_end {
            chunk_bytes -= layout::right_pad(end, chunk_size);
        }
        target.chunk_ids.push(chunk_id);
        target.total_chunk_size += chunk_bytes;
        target.bitset[(chunk_id - chunk_start) as usize] = true;
    }

    RequestPlan {
        chunk_start,
        chunk_end,
        offset: layout::left_pad(offset, chunk_size),
        targets: targets.into_values().collect(),
    }
}
