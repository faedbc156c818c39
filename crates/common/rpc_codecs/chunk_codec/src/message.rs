//! Wire format of the chunk data protocol. One fixed-size header is shared
//! by requests, responses, and bulk sub-transfers; variable payload (path,
//! ownership bitset, chunk data) travels in the frame body.
use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};
use codec_common::MessageHeaderTrait;
use data_types::ChunkStat;
use std::mem::size_of;
use xxhash_rust::xxh3::xxh3_64;

/// XXH3-64 hash of an empty buffer (seed=0); the correct body checksum for
/// frames without a body.
const EMPTY_BODY_CHECKSUM: u64 = 0x2d06800538d394c2;

#[repr(C)]
#[derive(Pod, Debug, Clone, Copy, Zeroable)]
pub struct MessageHeader {
    /// A checksum covering only the remainder of this header, so the header
    /// can be trusted without having read the associated body.
    checksum: u64,
    /// The current protocol version; its position must never change so the
    /// version can be upgraded in the future.
    pub proto_version: u8,
    /// Number of retry attempts for this request (0 = first attempt).
    pub retry_count: u8,
    reserved: [u8; 2],
    /// The size of the header structure plus any associated body.
    pub size: u32,

    /// A checksum covering only the associated body after this header.
    pub checksum_body: u64,
    /// The protocol command (method) for this message.
    pub command: Command,
    /// Every request carries a unique id echoed in its response so the
    /// sender can match replies on a multiplexed connection.
    pub id: u32,

    /// Byte offset within the first selected chunk (`offset < chunk_size`).
    /// Bulk frames reuse this as the offset into the remote buffer window;
    /// truncate requests carry the new file length here.
    pub offset: u64,
    /// First chunk id of the full user request, inclusive.
    pub chunk_start: u64,
    /// Last chunk id of the full user request, inclusive.
    pub chunk_end: u64,
    /// Bytes this target moves; the sum of its per-chunk transfer sizes.
    /// Handshake requests carry the client's configured chunk size here.
    pub total_chunk_size: u64,
    /// Response: bytes actually transferred/written/read. Bulk pull
    /// requests reuse this as the requested transfer size.
    pub io_size: u64,
    /// Client-side bulk buffer exposure addressed by pull/push transfers.
    pub bulk_id: u64,

    /// Number of chunks selected for this target.
    pub chunk_n: u32,
    /// Length of the logical path prefix of the body.
    pub path_len: u32,

    /// Target daemon id, for sanity checking against the daemon's own.
    pub host_id: u32,
    /// Cluster size the sender planned with.
    pub host_count: u32,

    /// Errno-compatible result code, 0 on success.
    pub errno: i32,
    reserved2: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum Command {
    Invalid = 0,
    Handshake = 1,
    // Data-path commands start from 16
    WriteChunks = 16,
    ReadChunks = 17,
    TruncChunks = 18,
    ChunkStat = 19,
    // Bulk sub-transfers, initiated by the daemon against a client-side
    // buffer exposure
    BulkPull = 20,
    BulkPush = 21,
}

#[allow(clippy::derivable_impls)]
impl Default for Command {
    fn default() -> Self {
        Command::Invalid
    }
}

// Safety: Command is a #[repr(i32)] enum with 0 as Invalid and no padding.
// Header checksum validation runs before decode, so no invalid enum value
// is ever interpreted.
unsafe impl Pod for Command {}
unsafe impl Zeroable for Command {}

impl Default for MessageHeader {
    fn default() -> Self {
        Self {
            checksum: 0,
            proto_version: Self::PROTO_VERSION,
            retry_count: 0,
            reserved: [0u8; 2],
            size: size_of::<Self>() as u32,
            checksum_body: EMPTY_BODY_CHECKSUM,
            command: Command::Invalid,
            id: 0,
            offset: 0,
            chunk_start: 0,
            chunk_end: 0,
            total_chunk_size: 0,
            io_size: 0,
            bulk_id: 0,
            chunk_n: 0,
            path_len: 0,
            host_id: 0,
            host_count: 0,
            errno: 0,
            reserved2: 0,
        }
    }
}

impl MessageHeader {
    const _SIZE_OK: () = assert!(size_of::<Self>() == 104);
    pub const PROTO_VERSION: u8 = 1;
}

impl MessageHeaderTrait for MessageHeader {
    const SIZE: usize = size_of::<Self>();

    fn encode(&self, dst: &mut BytesMut) {
        let bytes: &[u8] = bytemuck::bytes_of(self);
        dst.put(bytes);
    }

    fn decode(src: &[u8]) -> Self {
        bytemuck::pod_read_unaligned::<Self>(&src[..size_of::<Self>()])
    }

    fn peek_size(src: &[u8]) -> usize {
        let off = std::mem::offset_of!(MessageHeader, size);
        let mut raw = [0u8; size_of::<u32>()];
        raw.copy_from_slice(&src[off..off + size_of::<u32>()]);
        u32::from_ne_bytes(raw) as usize
    }

    fn get_size(&self) -> usize {
        self.size as usize
    }

    fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    fn get_id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    fn body_size(&self) -> usize {
        self.size as usize - size_of::<Self>()
    }

    fn set_checksum(&mut self) {
        let header_bytes: &[u8] = bytemuck::bytes_of(self);
        let checksum_offset = std::mem::offset_of!(MessageHeader, checksum);
        let bytes_to_hash = &header_bytes[checksum_offset + size_of::<u64>()..size_of::<Self>()];
        self.checksum = xxh3_64(bytes_to_hash);
    }

    fn verify_header_checksum_raw(src: &[u8]) -> bool {
        let checksum_offset = std::mem::offset_of!(MessageHeader, checksum);
        let mut stored = [0u8; size_of::<u64>()];
        stored.copy_from_slice(&src[checksum_offset..checksum_offset + size_of::<u64>()]);
        let calculated = xxh3_64(&src[checksum_offset + size_of::<u64>()..size_of::<Self>()]);
        u64::from_ne_bytes(stored) == calculated
    }

    fn set_body_checksum(&mut self, body: &[u8]) {
        self.checksum_body = xxh3_64(body);
    }

    fn verify_body_checksum(&self, body: &[u8]) -> bool {
        self.checksum_body == xxh3_64(body)
    }
}

/// Body of a write/read data request: the logical path followed by the
/// compressed ownership bitset. The path length travels in the header.
pub fn encode_data_request_body(path: &str, bitset: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(path.len() + bitset.len());
    body.put(path.as_bytes());
    body.put(bitset);
    body.freeze()
}

/// Split a data request body back into path and bitset bytes. Returns
/// `None` when `path_len` is inconsistent or the path is not UTF-8.
pub fn split_data_request_body(body: &[u8], path_len: usize) -> Option<(&str, &[u8])> {
    if path_len > body.len() {
        return None;
    }
    let (path, bitset) = body.split_at(path_len);
    Some((std::str::from_utf8(path).ok()?, bitset))
}

/// Body of a chunk-stat response: three little-endian u64 values.
pub fn encode_chunk_stat(stat: &ChunkStat) -> Bytes {
    let mut body = BytesMut::with_capacity(3 * size_of::<u64>());
    body.put_u64_le(stat.chunk_size);
    body.put_u64_le(stat.chunk_total);
    body.put_u64_le(stat.chunk_free);
    body.freeze()
}

pub fn decode_chunk_stat(body: &[u8]) -> Option<ChunkStat> {
    if body.len() != 3 * size_of::<u64>() {
        return None;
    }
    let word = |i: usize| {
        let mut raw = [0u8; size_of::<u64>()];
        raw.copy_from_slice(&body[i * 8..i * 8 + 8]);
        u64::from_le_bytes(raw)
    };
    Some(ChunkStat {
        chunk_size: word(0),
        chunk_total: word(1),
        chunk_free: word(2),
    })
}
