//! Reverse tunnel protocol definitions
//!
//! This crate defines the frames exchanged between the broker and an internal
//! client over the control connection, plus the length-prefixed codec used to
//! put them on the wire.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameCodec};
pub use frame::{ChannelId, FrameType, TunnelFrame};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;
