//! Byte-range to chunk arithmetic and the on-disk naming scheme, shared by
//! the client planner and the daemon storage engine.
//!
//! A logical file is partitioned into fixed-size chunks of `chunk_size`
//! bytes; chunk `k` covers bytes `[k * chunk_size, (k + 1) * chunk_size)`.

/// Index of the chunk containing byte `offset`.
#[inline]
pub const fn chunk_id_for_offset(offset: u64, chunk_size: u64) -> u64 {
    offset / chunk_size
}

/// Index of the last chunk touched by the range `[offset, offset + size)`.
/// `size` must be non-zero.
#[inline]
pub const fn chunk_id_for_range_end(offset: u64, size: u64, chunk_size: u64) -> u64 {
    (offset + size - 1) / chunk_size
}

/// Number of chunks touched by the range `[offset, offset + size)`.
#[inline]
pub const fn chunk_count_for_range(offset: u64, size: u64, chunk_size: u64) -> u64 {
    if size == 0 {
        return 0;
    }
    chunk_id_for_range_end(offset, size, chunk_size) - chunk_id_for_offset(offset, chunk_size) + 1
}

/// Bytes between the start of the chunk containing `offset` and `offset`
/// itself (the unused prefix of the first chunk).
#[inline]
pub const fn left_pad(offset: u64, chunk_size: u64) -> u64 {
    offset % chunk_size
}

/// Bytes between `end` (exclusive) and the end of the chunk containing
/// `end - 1` (the unused suffix of the last chunk). Zero when `end` is
/// chunk-aligned.
#[inline]
pub const fn right_pad(end: u64, chunk_size: u64) -> u64 {
    (chunk_size - end % chunk_size) % chunk_size
}

/// Directory name holding all chunk files of a logical file: the absolute
/// path with the leading separator stripped and every remaining `/`
/// replaced by `:`. No directory hierarchy is mirrored on the local FS.
pub fn chunk_dir_name(file_path: &str) -> String {
    debug_assert!(file_path.starts_with('/'), "logical paths are absolute");
    file_path.trim_start_matches('/').replace('/', ":")
}

/// Chunk file name: the decimal chunk index, no leading zeros.
pub fn chunk_file_name(chunk_id: u64) -> String {
    chunk_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: u64 = 1024;

    #[test]
    fn test_chunk_interval() {
        assert_eq!(chunk_id_for_offset(0, K), 0);
        assert_eq!(chunk_id_for_offset(1023, K), 0);
        assert_eq!(chunk_id_for_offset(1024, K), 1);
        // [1000, 3048): touches chunks 0..=2
        assert_eq!(chunk_id_for_range_end(1000, 2048, K), 2);
        assert_eq!(chunk_count_for_range(1000, 2048, K), 3);
        // exactly one chunk
        assert_eq!(chunk_count_for_range(1024, 1024, K), 1);
        assert_eq!(chunk_count_for_range(10, 5, K), 1);
        assert_eq!(chunk_count_for_range(0, 0, K), 0);
    }

    #[test]
    fn test_pads() {
        assert_eq!(left_pad(1000, K), 1000);
        assert_eq!(left_pad(1024, K), 0);
        assert_eq!(right_pad(3048, K), 24);
        assert_eq!(right_pad(2048, K), 0);
        // a range covering [1000, 3048) over 3 chunks loses the pads
        assert_eq!(3 * K - left_pad(1000, K) - right_pad(3048, K), 2048);
    }

    #[test]
    fn test_chunk_dir_name() {
        assert_eq!(chunk_dir_name("/a"), "a");
        assert_eq!(chunk_dir_name("/foo/bar"), "foo:bar");
        assert_eq!(chunk_dir_name("/foo/bar baz.dat"), "foo:bar baz.dat");
    }

    #[test]
    fn test_chunk_file_name() {
        assert_eq!(chunk_file_name(0), "0");
        assert_eq!(chunk_file_name(17), "17");
    }
}
