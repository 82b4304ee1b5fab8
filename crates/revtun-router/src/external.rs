//! Handle to one accepted external connection

use bytes::Bytes;
use revtun_proto::ChannelId;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;

/// Commands consumed by the task that owns the external socket's write half
#[derive(Debug)]
pub enum ExternalCommand {
    /// Write these bytes to the user socket
    Data(Bytes),
    /// Flush what is queued, then shut the socket down
    Close,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExternalWriteError {
    #[error("External connection is closed")]
    Closed,

    #[error("External connection write queue stalled for {0:?}")]
    Timeout(Duration),
}

/// Cheap, cloneable handle to an external connection.
///
/// The socket itself is owned by its pump task; the handle only queues writes
/// and signals shutdown.
#[derive(Debug, Clone)]
pub struct ExternalConnection {
    channel_id: ChannelId,
    port: u16,
    owner: ChannelId,
    peer_addr: SocketAddr,
    writer: mpsc::Sender<ExternalCommand>,
    shutdown: CancellationToken,
}

impl ExternalConnection {
    pub fn new(
        channel_id: ChannelId,
        port: u16,
        owner: ChannelId,
        peer_addr: SocketAddr,
        writer: mpsc::Sender<ExternalCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            channel_id,
            port,
            owner,
            peer_addr,
            writer,
            shutdown,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Exposed port this connection was accepted on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Channel id of the owning control connection
    pub fn owner(&self) -> &ChannelId {
        &self.owner
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.writer.is_closed()
    }

    /// Queue `payload` for the user socket.
    ///
    /// Returns at once while the queue has room; only a full queue waits, at
    /// most `timeout`.
    pub async fn send_payload(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(), ExternalWriteError> {
        if self.shutdown.is_cancelled() {
            return Err(ExternalWriteError::Closed);
        }

        let command = match self.writer.try_send(ExternalCommand::Data(payload)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(ExternalWriteError::Closed),
            Err(TrySendError::Full(command)) => command,
        };

        match self.writer.send_timeout(command, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ExternalWriteError::Timeout(timeout)),
            Err(SendTimeoutError::Closed(_)) => Err(ExternalWriteError::Closed),
        }
    }

    /// Close after everything already queued has been written.
    ///
    /// Falls back to an immediate abort when the queue is full.
    pub fn close_gracefully(&self) {
        match self.writer.try_send(ExternalCommand::Close) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => self.abort(),
        }
    }

    /// Drop the connection now, discarding queued writes
    pub fn abort(&self) {
        self.shutdown.cancel();
    }
}
