//! Byte pump for one external connection

use chrono::{DateTime, Utc};
use revtun_control::ControlHandle;
use revtun_proto::{ChannelId, TunnelFrame};
use revtun_router::{ConnectionRegistry, ExternalCommand, ExternalConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ExposedListenerConfig;

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// EOF or I/O error on the user socket
    UserClosed,
    /// The internal client sent DISCONNECTED
    ClosedByClient,
    /// Listener, control connection or broker shut down
    Cancelled,
    /// Control connection could not take more frames
    ControlClosed,
}

/// Tracks bytes moved through an individual external connection
struct ConnectionMetrics {
    bytes_from_user: AtomicU64,
    bytes_to_user: AtomicU64,
    connected_at: DateTime<Utc>,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            bytes_from_user: AtomicU64::new(0),
            bytes_to_user: AtomicU64::new(0),
            connected_at: Utc::now(),
        }
    }
}

/// Register an accepted user socket and start pumping it.
///
/// The connection is cancelled together with `listener_shutdown`.
pub(crate) fn spawn_external(
    stream: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
    control: &ControlHandle,
    registry: &Arc<ConnectionRegistry>,
    config: &ExposedListenerConfig,
    listener_shutdown: &CancellationToken,
) -> Option<ChannelId> {
    let channel_id = ChannelId::generate();
    let shutdown = listener_shutdown.child_token();
    let (writer_tx, writer_rx) = mpsc::channel(config.write_queue_depth.max(1));

    let conn = ExternalConnection::new(
        channel_id.clone(),
        port,
        control.channel_id().clone(),
        peer_addr,
        writer_tx,
        shutdown.clone(),
    );
    if let Err(e) = registry.register_external(conn) {
        warn!("Dropping connection from {}: {}", peer_addr, e);
        return None;
    }

    debug!(
        "External connection {} from {} on port {} (control {})",
        channel_id,
        peer_addr,
        port,
        control.channel_id()
    );

    let pump = ExternalPump {
        channel_id: channel_id.clone(),
        control: control.clone(),
        registry: registry.clone(),
        shutdown,
        read_chunk_size: config.read_chunk_size.max(1),
    };
    tokio::spawn(pump.run(stream, writer_rx));

    Some(channel_id)
}

struct ExternalPump {
    channel_id: ChannelId,
    control: ControlHandle,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    read_chunk_size: usize,
}

impl ExternalPump {
    async fn run(self, stream: TcpStream, writer_rx: mpsc::Receiver<ExternalCommand>) {
        let metrics = ConnectionMetrics::new();
        let (read_half, write_half) = stream.into_split();

        let end = tokio::select! {
            end = self.forward_to_client(read_half, &metrics) => end,
            end = self.write_to_user(write_half, writer_rx, &metrics) => end,
        };

        self.shutdown.cancel();
        self.registry.remove_external(&self.channel_id);

        if end == PumpEnd::UserClosed {
            // Lets the internal client close its side of the stream
            if self
                .control
                .send(TunnelFrame::disconnected(self.channel_id.clone()))
                .await
                .is_err()
            {
                trace!(
                    "Control {} gone before DISCONNECTED for {}",
                    self.control.channel_id(),
                    self.channel_id
                );
            }
        }

        let duration_ms = (Utc::now() - metrics.connected_at).num_milliseconds();
        debug!(
            "External connection {} closed ({:?}): {} bytes in, {} bytes out, {}ms",
            self.channel_id,
            end,
            metrics.bytes_from_user.load(Ordering::Relaxed),
            metrics.bytes_to_user.load(Ordering::Relaxed),
            duration_ms
        );
    }

    /// User socket -> DATA frames on the control connection
    async fn forward_to_client(
        &self,
        mut reader: OwnedReadHalf,
        metrics: &ConnectionMetrics,
    ) -> PumpEnd {
        let mut buffer = vec![0u8; self.read_chunk_size];
        loop {
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => return PumpEnd::Cancelled,
                read = reader.read(&mut buffer) => match read {
                    Ok(0) => return PumpEnd::UserClosed,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read from {} failed: {}", self.channel_id, e);
                        return PumpEnd::UserClosed;
                    }
                },
            };

            metrics
                .bytes_from_user
                .fetch_add(n as u64, Ordering::Relaxed);
            trace!("Read {} bytes from {}", n, self.channel_id);

            let frame = TunnelFrame::data(self.channel_id.clone(), &buffer[..n]);
            if self.control.send(frame).await.is_err() {
                return PumpEnd::ControlClosed;
            }
        }
    }

    /// Queued writes -> user socket
    async fn write_to_user(
        &self,
        mut writer: OwnedWriteHalf,
        mut commands: mpsc::Receiver<ExternalCommand>,
        metrics: &ConnectionMetrics,
    ) -> PumpEnd {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => return PumpEnd::Cancelled,
                command = commands.recv() => command,
            };

            match command {
                Some(ExternalCommand::Data(bytes)) => {
                    let written = tokio::select! {
                        _ = self.shutdown.cancelled() => return PumpEnd::Cancelled,
                        written = writer.write_all(&bytes) => written,
                    };
                    if let Err(e) = written {
                        debug!("Write to {} failed: {}", self.channel_id, e);
                        return PumpEnd::UserClosed;
                    }
                    metrics
                        .bytes_to_user
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                Some(ExternalCommand::Close) => {
                    if let Err(e) = writer.flush().await {
                        debug!("Flush to {} failed: {}", self.channel_id, e);
                    }
                    if let Err(e) = writer.shutdown().await {
                        debug!("Shutdown of {} failed: {}", self.channel_id, e);
                    }
                    return PumpEnd::ClosedByClient;
                }
                None => return PumpEnd::Cancelled,
            }
        }
    }
}
