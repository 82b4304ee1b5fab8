//! Codec for encoding/decoding tunnel frames

use crate::frame::TunnelFrame;
use crate::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
///
/// Any of these is fatal for the connection it happened on, never for the broker.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel frame codec
///
/// Format: `[length: u32 BE][payload: bincode serialized frame]`
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame to bytes, length prefix included
    pub fn encode_frame(frame: &TunnelFrame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a frame from the front of `buf`
    ///
    /// Returns Ok(None) if more data is needed.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<TunnelFrame>, CodecError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + length {
            buf.reserve(LENGTH_PREFIX_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let frame_bytes = buf.split_to(length);
        let frame: TunnelFrame = bincode::deserialize(&frame_bytes)?;

        Ok(Some(frame))
    }

    fn encode_into(frame: &TunnelFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = TunnelFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_frame(src)
    }
}

impl Encoder<TunnelFrame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: TunnelFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_into(&item, dst)
    }
}
