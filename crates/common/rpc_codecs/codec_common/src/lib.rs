use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Fixed-size POD message header shared by every frame on a connection.
///
/// Implementations carry two checksums: one over the header itself (so a
/// header can be trusted without reading the body) and one over the body.
pub trait MessageHeaderTrait: Sized + Clone + Copy + Send + Sync + 'static {
    const SIZE: usize;

    fn encode(&self, dst: &mut BytesMut);
    fn decode(src: &[u8]) -> Self;

    /// Peek the total frame size (header + body) from raw header bytes.
    fn peek_size(src: &[u8]) -> usize;

    fn get_size(&self) -> usize;
    fn set_size(&mut self, size: u32);
    fn get_id(&self) -> u32;
    fn set_id(&mut self, id: u32);
    fn body_size(&self) -> usize;

    fn set_checksum(&mut self);
    fn verify_header_checksum_raw(src: &[u8]) -> bool;
    fn set_body_checksum(&mut self, body: &[u8]);
    fn verify_body_checksum(&self, body: &[u8]) -> bool;
}

pub struct MessageFrame<H: MessageHeaderTrait, B = Bytes> {
    pub header: H,
    pub body: B,
}

impl<H: MessageHeaderTrait, B> MessageFrame<H, B> {
    pub fn new(header: H, body: B) -> Self {
        Self { header, body }
    }
}

/// Splits a byte stream into `MessageFrame`s. Both checksums are verified
/// here so consumers never see a corrupted frame; a mismatch poisons the
/// connection with `InvalidData`.
#[derive(Default, Clone)]
pub struct MessageCodec<H: MessageHeaderTrait> {
    _phantom: std::marker::PhantomData<H>,
}

/// Upper bound on a single frame; bulk transfers move at most one chunk
/// per frame, so this also bounds the configurable chunk size.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

impl<H: MessageHeaderTrait> Decoder for MessageCodec<H> {
    type Item = MessageFrame<H>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header_size = H::SIZE;
        if src.len() < header_size {
            return Ok(None);
        }

        if !H::verify_header_checksum_raw(&src[..header_size]) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header checksum verification failed",
            ));
        }

        let size = H::peek_size(src.as_ref());
        if size < header_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame size {size} is smaller than header size {header_size}"),
            ));
        }
        if size > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of size {size} is too large"),
            ));
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let header = H::decode(&src[..header_size]);
        src.advance(header_size);
        let body = src.split_to(size - header_size).freeze();

        if !header.verify_body_checksum(&body) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "body checksum verification failed",
            ));
        }

        Ok(Some(MessageFrame::new(header, body)))
    }
}
