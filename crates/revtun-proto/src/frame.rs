//! Tunnel frame types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a control connection or an external connection.
///
/// Ids are minted by the broker when a socket is accepted and are never reused
/// for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Mint a fresh id for a newly accepted socket.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frame type tag, mirrors the variants of [`TunnelFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Register,
    RegisterResult,
    Data,
    Keepalive,
    Disconnected,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Register => "REGISTER",
            FrameType::RegisterResult => "REGISTER_RESULT",
            FrameType::Data => "DATA",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message exchanged on the control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TunnelFrame {
    /// Client asks the broker to expose `open_tcp_port`
    Register {
        channel_id: ChannelId,
        password: String,
        open_tcp_port: u16,
    },
    /// Broker reports the outcome of a `Register`.
    ///
    /// `channel_id` is the broker-assigned id of the control connection.
    RegisterResult {
        channel_id: ChannelId,
        open_tcp_port: u16,
        success: bool,
        description: String,
    },
    /// A slice of the proxied byte stream for one external connection
    Data {
        channel_id: ChannelId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Client heartbeat, never answered
    Keepalive { channel_id: ChannelId },
    /// Close one external connection, or every listener of the control
    /// connection when `channel_id` names the control connection itself
    Disconnected { channel_id: ChannelId },
}

impl TunnelFrame {
    pub fn data(channel_id: ChannelId, payload: impl Into<Vec<u8>>) -> Self {
        TunnelFrame::Data {
            channel_id,
            payload: payload.into(),
        }
    }

    pub fn disconnected(channel_id: ChannelId) -> Self {
        TunnelFrame::Disconnected { channel_id }
    }

    pub fn register_ok(channel_id: ChannelId, open_tcp_port: u16) -> Self {
        TunnelFrame::RegisterResult {
            channel_id,
            open_tcp_port,
            success: true,
            description: String::new(),
        }
    }

    pub fn register_failed(
        channel_id: ChannelId,
        open_tcp_port: u16,
        description: impl Into<String>,
    ) -> Self {
        TunnelFrame::RegisterResult {
            channel_id,
            open_tcp_port,
            success: false,
            description: description.into(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            TunnelFrame::Register { .. } => FrameType::Register,
            TunnelFrame::RegisterResult { .. } => FrameType::RegisterResult,
            TunnelFrame::Data { .. } => FrameType::Data,
            TunnelFrame::Keepalive { .. } => FrameType::Keepalive,
            TunnelFrame::Disconnected { .. } => FrameType::Disconnected,
        }
    }

    /// Routing id carried by the frame
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            TunnelFrame::Register { channel_id, .. }
            | TunnelFrame::RegisterResult { channel_id, .. }
            | TunnelFrame::Data { channel_id, .. }
            | TunnelFrame::Keepalive { channel_id }
            | TunnelFrame::Disconnected { channel_id } => channel_id,
        }
    }
}

// Payloads are serialized as a byte string rather than a sequence of u8
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
