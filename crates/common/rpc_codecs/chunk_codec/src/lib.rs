pub mod bitset;
pub mod message;

pub use bitset::{BitsetError, compress_bitset, decompress_bitset};
pub use message::{Command, MessageHeader};

pub type MessageCodec = codec_common::MessageCodec<MessageHeader>;
pub type MessageFrame<B = bytes::Bytes> = codec_common::MessageFrame<MessageHeader, B>;
