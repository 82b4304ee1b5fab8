//! Control session handler
//!
//! One `ControlSession` drives one control connection: it decodes inbound
//! frames, authenticates REGISTER requests, asks the [`ListenerSpawner`] to
//! expose ports, routes DATA and DISCONNECTED frames to external connections
//! and evicts everything the connection owns when it goes away.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use revtun_proto::{ChannelId, CodecError, FrameCodec, TunnelFrame};
use revtun_router::{ConnectionRegistry, ExternalWriteError};

use crate::config::SessionConfig;
use crate::connection::{ControlClosed, ControlHandle};
use crate::liveness::{IdleVerdict, LivenessMonitor};

/// Upper bound on flushing queued replies once a session is closing
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Reasons a port could not be exposed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExposeError {
    /// Another registration already holds the port
    #[error("Port {0} is already bound")]
    PortTaken(u16),

    /// The OS refused the bind
    #[error("Failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

/// Creates exposed listeners on behalf of a control session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListenerSpawner: Send + Sync {
    /// Bind `port` and forward every accepted connection to `control`.
    ///
    /// Returns the bound local address. On error nothing may be left behind in
    /// the registry.
    async fn spawn(&self, control: ControlHandle, port: u16) -> Result<SocketAddr, ExposeError>;
}

/// Fatal session errors; each one closes the control connection
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed frame: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bind(ExposeError),

    #[error(transparent)]
    ControlClosed(#[from] ControlClosed),

    #[error("No frame received for {misses} idle windows")]
    IdleTimeout { misses: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Registered,
    Closed,
}

/// Protocol state machine for one control connection
pub struct ControlSession {
    handle: ControlHandle,
    outbound_rx: Option<mpsc::Receiver<TunnelFrame>>,
    registry: Arc<ConnectionRegistry>,
    spawner: Arc<dyn ListenerSpawner>,
    config: SessionConfig,
    liveness: LivenessMonitor,
    state: SessionState,
    peer_addr: Option<SocketAddr>,
}

impl ControlSession {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        spawner: Arc<dyn ListenerSpawner>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (handle, outbound_rx) =
            ControlHandle::new(ChannelId::generate(), config.outbound_queue_depth, shutdown);
        let liveness = LivenessMonitor::from_config(&config);

        Self {
            handle,
            outbound_rx: Some(outbound_rx),
            registry,
            spawner,
            config,
            liveness,
            state: SessionState::Unauthenticated,
            peer_addr: None,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn channel_id(&self) -> &ChannelId {
        self.handle.channel_id()
    }

    pub fn handle(&self) -> &ControlHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    /// Drive the control connection until it closes.
    ///
    /// Returns `Ok(())` when the peer hung up or the broker shut down; any
    /// other ending is reported as a [`SessionError`]. Either way the
    /// connection's listeners and external connections are released before
    /// this returns.
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let shutdown = self.handle.shutdown_token().clone();

        let writer_task = self.outbound_rx.take().map(|outbound_rx| {
            tokio::spawn(write_frames(
                writer,
                outbound_rx,
                shutdown.clone(),
                self.channel_id().clone(),
            ))
        });

        self.registry
            .register_control(self.channel_id().clone(), self.peer_addr);
        info!(
            "Control connection {} opened (peer: {:?})",
            self.channel_id(),
            self.peer_addr
        );

        let result = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                next = self.liveness.read_or_idle(frames.next()) => next,
            };

            match next {
                None => match self.liveness.on_read_idle() {
                    IdleVerdict::Wait { misses } => {
                        warn!(
                            "Control connection {} idle ({}/{})",
                            self.channel_id(),
                            misses,
                            self.liveness.retry_limit()
                        );
                    }
                    IdleVerdict::Evict { misses } => {
                        break Err(SessionError::IdleTimeout { misses });
                    }
                },
                Some(None) => {
                    debug!("Control connection {} closed by peer", self.channel_id());
                    break Ok(());
                }
                Some(Some(Err(e))) => break Err(SessionError::Codec(e)),
                Some(Some(Ok(frame))) => {
                    let outcome = tokio::select! {
                        outcome = self.process_frame(frame) => outcome,
                        _ = shutdown.cancelled() => break Ok(()),
                    };
                    if let Err(e) = outcome {
                        break Err(e);
                    }
                }
            }
        };

        match &result {
            Ok(()) => {}
            Err(SessionError::Bind(e)) => error!("Closing {}: {}", self.channel_id(), e),
            Err(e) => warn!("Closing {}: {}", self.channel_id(), e),
        }

        self.close();
        if let Some(task) = writer_task {
            match task.await {
                Ok(Err(e)) => debug!("Writer for {} stopped: {}", self.channel_id(), e),
                Err(e) => error!("Writer task for {} panicked: {}", self.channel_id(), e),
                Ok(Ok(())) => {}
            }
        }
        result
    }

    /// Apply one inbound frame
    pub async fn process_frame(&mut self, frame: TunnelFrame) -> Result<(), SessionError> {
        self.liveness.record_activity();
        trace!(
            "{} <- {} ({})",
            self.channel_id(),
            frame.frame_type(),
            frame.channel_id()
        );

        match frame {
            TunnelFrame::Register {
                password,
                open_tcp_port,
                ..
            } => self.handle_register(&password, open_tcp_port).await,
            TunnelFrame::Data {
                channel_id,
                payload,
            } => self.handle_data(channel_id, payload).await,
            TunnelFrame::Keepalive { .. } => {
                debug!("Keepalive from {}", self.channel_id());
                Ok(())
            }
            TunnelFrame::Disconnected { channel_id } => self.handle_disconnected(channel_id).await,
            TunnelFrame::RegisterResult { .. } => Err(SessionError::Protocol(
                "REGISTER_RESULT is only sent by the broker".to_string(),
            )),
        }
    }

    async fn handle_register(&mut self, password: &str, port: u16) -> Result<(), SessionError> {
        let id = self.channel_id().clone();

        if !self.config.check_password(password) {
            warn!("Rejected registration from {}: wrong token", id);
            self.handle
                .send(TunnelFrame::register_failed(id, port, "Token is wrong"))
                .await?;
            return Ok(());
        }

        if port == 0 {
            warn!("Rejected registration from {}: port 0", id);
            self.handle
                .send(TunnelFrame::register_failed(id, port, "Invalid port 0"))
                .await?;
            return Ok(());
        }

        match self.spawner.spawn(self.handle.clone(), port).await {
            Ok(local_addr) => {
                self.state = SessionState::Registered;
                info!("Control connection {} exposed {}", id, local_addr);
                self.handle
                    .send(TunnelFrame::register_ok(id, port))
                    .await?;
                Ok(())
            }
            Err(e @ ExposeError::PortTaken(_)) => {
                warn!("Rejected registration from {}: {}", id, e);
                self.handle
                    .send(TunnelFrame::register_failed(id, port, e.to_string()))
                    .await?;
                Ok(())
            }
            Err(e @ ExposeError::Bind { .. }) => {
                self.state = SessionState::Closed;
                Err(SessionError::Bind(e))
            }
        }
    }

    async fn handle_data(
        &mut self,
        channel_id: ChannelId,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        let Some(conn) = self
            .registry
            .find_owned_external(&channel_id, self.channel_id())
        else {
            trace!("No external connection {} for DATA, dropped", channel_id);
            return Ok(());
        };

        match conn
            .send_payload(Bytes::from(payload), self.config.data_write_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(ExternalWriteError::Closed) => {
                trace!("External connection {} closed before DATA", channel_id);
                Ok(())
            }
            Err(ExternalWriteError::Timeout(waited)) => {
                warn!(
                    "External connection {} stalled for {:?}, closing it",
                    channel_id, waited
                );
                conn.abort();
                self.registry.remove_external(&channel_id);
                self.handle
                    .send(TunnelFrame::disconnected(channel_id))
                    .await?;
                Ok(())
            }
        }
    }

    async fn handle_disconnected(&mut self, channel_id: ChannelId) -> Result<(), SessionError> {
        if &channel_id == self.channel_id() {
            let ports = self.registry.close_listeners_of(&channel_id);
            info!(
                "Control connection {} closed its listeners {:?}",
                channel_id, ports
            );
        } else if self
            .registry
            .close_external(&channel_id, self.channel_id())
            .is_some()
        {
            debug!("External connection {} closed by client", channel_id);
        } else {
            trace!("No external connection {} for DISCONNECTED", channel_id);
            return Ok(());
        }

        self.handle
            .send(TunnelFrame::disconnected(channel_id))
            .await?;
        Ok(())
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        let released = self.registry.evict_control(self.channel_id());
        self.handle.close();

        let stats = self.registry.stats();
        info!(
            "Control connection {} closed, released ports {:?} ({} sessions, {} listeners, {} external connections remain)",
            self.channel_id(),
            released,
            stats.sessions,
            stats.listeners,
            stats.external_connections
        );
    }
}

async fn write_frames<W>(
    writer: W,
    mut outbound: mpsc::Receiver<TunnelFrame>,
    shutdown: CancellationToken,
    channel_id: ChannelId,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, FrameCodec::new());

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    trace!("{} -> {} ({})", channel_id, frame.frame_type(), frame.channel_id());
                    sink.send(frame).await?;
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // Deliver whatever was queued before the close, e.g. a final reply
    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            sink.feed(frame).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Gave up flushing {} after {:?}", channel_id, DRAIN_TIMEOUT);
            Ok(())
        }
    }
}
