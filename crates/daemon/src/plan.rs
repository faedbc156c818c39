//! Server-side transfer planning.
//!
//! A data RPC names the chunk interval of the whole user request plus the
//! ownership bitset for this daemon; the client does not ship a chunk id
//! list, so the per-chunk transfer geometry is recomputed here. Origin
//! offsets address the client's bulk window, which covers the full user
//! buffer: the first chunk of the interval starts at window offset 0,
//! shortened by the in-chunk offset.

/// Geometry of one selected chunk within a data RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTransfer {
    pub chunk_id: u64,
    /// Offset of this chunk's data in the client's bulk window.
    pub origin_offset: u64,
    /// Running cursor into the daemon-side buffer space.
    pub local_offset: u64,
    pub transfer_size: u64,
    /// Offset within the chunk file; non-zero only for the first chunk of
    /// the request interval.
    pub in_chunk_offset: u64,
}

/// Walk the ownership bitset and lay out every selected chunk.
///
/// Rejects inputs whose geometry is inconsistent: the declared
/// `total_chunk_size` must be consumed exactly, every transfer must be
/// non-empty, and nothing may extend past a chunk boundary. Callers map a
/// `None` to `EINVAL`.
pub fn plan_transfers(
    bits: &[bool],
    chunk_start: u64,
    offset: u64,
    total_chunk_size: u64,
    chunk_n: u32,
    chunk_size: u64,
) -> Option<Vec<ChunkTransfer>> {
    if chunk_n == 0 {
        return None;
    }
    let mut transfers: Vec<ChunkTransfer> = Vec::with_capacity(chunk_n as usize);
    let mut size_left = total_chunk_size;

    for (i, owned) in bits.iter().enumerate() {
        if transfers.len() == chunk_n as usize {
            break;
        }
        if !*owned {
            continue;
        }
        let chunk_id = chunk_start + i as u64;
        let is_last_selected = transfers.len() as u32 == chunk_n - 1;

        let (origin_offset, transfer_size, in_chunk_offset) = if i == 0 && offset > 0 {
            // first chunk of the interval with an unaligned start; a small
            // request may begin and end inside this one chunk
            let transfer_size = total_chunk_size.min(chunk_size - offset);
            (0, transfer_size, offset)
        } else {
            let origin_offset = if offset > 0 {
                (chunk_size - offset) + (i as u64 - 1) * chunk_size
            } else {
                i as u64 * chunk_size
            };
            let transfer_size = if is_last_selected {
                size_left
            } else {
                chunk_size
            };
            (origin_offset, transfer_size, 0)
        };

        if transfer_size == 0
            || transfer_size > size_left
            || transfer_size > chunk_size - in_chunk_offset
        {
            return None;
        }

        let local_offset = total_chunk_size - size_left;
        size_left -= transfer_size;
        transfers.push(ChunkTransfer {
            chunk_id,
            origin_offset,
            local_offset,
            transfer_size,
            in_chunk_offset,
        });
    }

    // every selected chunk accounted for, all declared bytes assigned
    if transfers.len() != chunk_n as usize || size_left != 0 {
        return None;
    }
    Some(transfers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: u64 = 1024;

    #[test]
    fn test_single_chunk_small_write() {
        // 5 bytes at offset 10 of chunk 0
        let transfers = plan_transfers(&[true], 0, 10, 5, 1, K).unwrap();
        assert_eq!(
            transfers,
            vec![ChunkTransfer {
                chunk_id: 0,
                origin_offset: 0,
                local_offset: 0,
                transfer_size: 5,
                in_chunk_offset: 10,
            }]
        );
    }

    #[test]
    fn test_cross_chunk_interval_split_across_daemons() {
        // 2048 bytes at offset 1000 span chunks 0..=2; each daemon owns one
        let first = plan_transfers(&[true, false, false], 0, 1000, 24, 1, K).unwrap();
        assert_eq!(first[0].transfer_size, 24);
        assert_eq!(first[0].in_chunk_offset, 1000);
        assert_eq!(first[0].origin_offset, 0);

        let middle = plan_transfers(&[false, true, false], 0, 1000, 1024, 1, K).unwrap();
        assert_eq!(middle[0].chunk_id, 1);
        assert_eq!(middle[0].transfer_size, 1024);
        assert_eq!(middle[0].in_chunk_offset, 0);
        assert_eq!(middle[0].origin_offset, 24);

        let last = plan_transfers(&[false, false, true], 0, 1000, 1000, 1, K).unwrap();
        assert_eq!(last[0].chunk_id, 2);
        assert_eq!(last[0].transfer_size, 1000);
        assert_eq!(last[0].origin_offset, 24 + 1024);
    }

    #[test]
    fn test_one_daemon_owns_whole_interval() {
        let transfers = plan_transfers(&[true, true, true], 0, 1000, 2048, 3, K).unwrap();
        assert_eq!(transfers.len(), 3);
        assert_eq!(
            transfers
                .iter()
                .map(|t| t.transfer_size)
                .collect::<Vec<_>>(),
            vec![24, 1024, 1000]
        );
        assert_eq!(
            transfers
                .iter()
                .map(|t| t.origin_offset)
                .collect::<Vec<_>>(),
            vec![0, 24, 1048]
        );
        assert_eq!(
            transfers.iter().map(|t| t.local_offset).collect::<Vec<_>>(),
            vec![0, 24, 1048]
        );
        assert_eq!(transfers[0].in_chunk_offset, 1000);
        assert_eq!(transfers[1].in_chunk_offset, 0);
    }

    #[test]
    fn test_aligned_interval() {
        let transfers = plan_transfers(&[true, false, true], 4, 0, 2 * K, 2, K).unwrap();
        assert_eq!(transfers[0].chunk_id, 4);
        assert_eq!(transfers[0].origin_offset, 0);
        assert_eq!(transfers[1].chunk_id, 6);
        assert_eq!(transfers[1].origin_offset, 2 * K);
        assert_eq!(transfers[1].local_offset, K);
    }

    #[test]
    fn test_inconsistent_totals_rejected() {
        // declared size cannot be consumed by one chunk
        assert!(plan_transfers(&[true], 0, 0, 2 * K, 1, K).is_none());
        // declared size leaves bytes unassigned
        assert!(plan_transfers(&[true, true], 0, 0, K / 2, 2, K).is_none());
        // chunk count disagrees with the bitset population
        assert!(plan_transfers(&[true, false], 0, 0, K, 2, K).is_none());
        // zero-byte transfer
        assert!(plan_transfers(&[true], 0, 0, 0, 1, K).is_none());
    }
}
