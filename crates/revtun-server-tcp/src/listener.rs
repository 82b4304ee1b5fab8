//! Exposed listener implementation
//!
//! Binds a public port on behalf of a control connection. Every accepted
//! socket becomes an external connection with its own channel id.

use revtun_control::{ControlHandle, ExposeError};
use revtun_proto::ChannelId;
use revtun_router::{ConnectionRegistry, ListenerSocket, RegistryError};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ExposedListenerConfig;
use crate::pump::spawn_external;

const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ExposedListenerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<ExposedListenerError> for ExposeError {
    fn from(err: ExposedListenerError) -> Self {
        match err {
            ExposedListenerError::Registry(RegistryError::AlreadyBound { port, .. }) => {
                ExposeError::PortTaken(port)
            }
            ExposedListenerError::BindError { address, reason } => ExposeError::Bind {
                port: address.port(),
                reason,
            },
            other => ExposeError::Bind {
                port: 0,
                reason: other.to_string(),
            },
        }
    }
}

/// Accepting socket shared by the accept loop and the registry.
///
/// Whoever closes the port drops the socket right away instead of waiting for
/// the accept loop to notice its cancellation.
#[derive(Debug)]
struct SharedListener {
    slot: Mutex<Option<TcpListener>>,
}

impl SharedListener {
    fn new(listener: TcpListener) -> Self {
        Self {
            slot: Mutex::new(Some(listener)),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` once the socket has been released
    async fn accept(&self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<(TcpStream, SocketAddr)>>> {
        match self.slot().as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        }
    }
}

impl ListenerSocket for SharedListener {
    fn release(&self) {
        self.slot().take();
    }
}

/// A bound public port forwarding to one control connection
#[derive(Debug)]
pub struct ExposedListener {
    port: u16,
    local_addr: SocketAddr,
    owner: ChannelId,
    registry: Arc<ConnectionRegistry>,
    socket: Arc<SharedListener>,
    shutdown: CancellationToken,
}

impl ExposedListener {
    /// Reserve `port`, bind it and start accepting.
    ///
    /// Nothing stays in the registry when the bind fails. The listener stops
    /// when [`close`](Self::close) is called, when it is evicted from the
    /// registry or when `control` shuts down.
    pub fn create(
        port: u16,
        control: ControlHandle,
        registry: Arc<ConnectionRegistry>,
        config: ExposedListenerConfig,
    ) -> Result<Self, ExposedListenerError> {
        let shutdown = control.shutdown_token().child_token();
        let reservation = registry.bind_port(port, control.channel_id(), shutdown.clone())?;

        let address = SocketAddr::new(config.bind_ip, port);
        let listener = bind_reuse(address).map_err(|e| ExposedListenerError::BindError {
            address,
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;
        let socket = Arc::new(SharedListener::new(listener));
        reservation.commit_with_socket(local_addr, socket.clone());

        info!(
            "Exposed {} for control connection {}",
            local_addr,
            control.channel_id()
        );

        let owner = control.channel_id().clone();
        tokio::spawn(accept_loop(
            socket.clone(),
            port,
            control,
            registry.clone(),
            config,
            shutdown.clone(),
        ));

        Ok(Self {
            port,
            local_addr,
            owner,
            registry,
            socket,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn owner(&self) -> &ChannelId {
        &self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting, close every external connection on this port and
    /// release the port.
    ///
    /// The OS socket is closed when this returns.
    pub fn close(&self) {
        self.registry.close_listener(self.port, &self.owner);
        self.socket.release();
        self.shutdown.cancel();
    }
}

fn bind_reuse(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(
    socket: Arc<SharedListener>,
    port: u16,
    control: ControlHandle,
    registry: Arc<ConnectionRegistry>,
    config: ExposedListenerConfig,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = socket.accept() => accepted,
        };

        match accepted {
            Some(Ok((stream, peer_addr))) => {
                spawn_external(stream, peer_addr, port, &control, &registry, &config, &shutdown);
            }
            Some(Err(e)) => {
                error!("Failed to accept connection on port {}: {}", port, e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
            None => break,
        }
    }

    registry.close_listener(port, control.channel_id());
    socket.release();
    debug!("Listener on port {} stopped", port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use revtun_proto::TunnelFrame;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn loopback() -> ExposedListenerConfig {
        ExposedListenerConfig::default().with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn control(name: &str) -> (ControlHandle, mpsc::Receiver<TunnelFrame>) {
        ControlHandle::new(ChannelId::from(name), 64, CancellationToken::new())
    }

    async fn next_frame(rx: &mut mpsc::Receiver<TunnelFrame>) -> TunnelFrame {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("control queue closed")
    }

    #[tokio::test]
    async fn test_user_bytes_become_data_frames() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = control("ctl-a");
        let port = free_port();
        let listener =
            ExposedListener::create(port, handle, registry.clone(), loopback()).unwrap();

        let mut user = TcpStream::connect(listener.local_addr()).await.unwrap();
        user.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let (channel_id, payload) = match next_frame(&mut rx).await {
            TunnelFrame::Data {
                channel_id,
                payload,
            } => (channel_id, payload),
            other => panic!("Expected DATA, got {:?}", other),
        };
        assert_eq!(payload, b"GET / HTTP/1.1\r\n\r\n");

        let conn = registry.find_external(&channel_id).unwrap();
        assert_eq!(conn.port(), port);
        assert_eq!(conn.owner(), &ChannelId::from("ctl-a"));
        assert_eq!(registry.externals_on_port(port), vec![channel_id.clone()]);

        conn.send_payload(
            bytes_of(b"HTTP/1.1 204 No Content\r\n\r\n"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let mut reply = vec![0u8; 27];
        user.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    fn bytes_of(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[tokio::test]
    async fn test_user_close_notifies_client() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = control("ctl-a");
        let listener =
            ExposedListener::create(free_port(), handle, registry.clone(), loopback()).unwrap();

        let mut user = TcpStream::connect(listener.local_addr()).await.unwrap();
        user.write_all(b"ping").await.unwrap();
        let id = next_frame(&mut rx).await.channel_id().clone();

        drop(user);
        assert_eq!(
            next_frame(&mut rx).await,
            TunnelFrame::disconnected(id.clone())
        );
        assert!(registry.find_external(&id).is_none());
    }

    #[tokio::test]
    async fn test_graceful_close_flushes_queued_data() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = control("ctl-a");
        let listener =
            ExposedListener::create(free_port(), handle, registry.clone(), loopback()).unwrap();

        let mut user = TcpStream::connect(listener.local_addr()).await.unwrap();
        user.write_all(b"hello").await.unwrap();
        let id = next_frame(&mut rx).await.channel_id().clone();

        let conn = registry.find_external(&id).unwrap();
        conn.send_payload(bytes_of(b"bye"), Duration::from_secs(1))
            .await
            .unwrap();
        registry.close_external(&id, &ChannelId::from("ctl-a")).unwrap();

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), user.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"bye");

        // Closed on the client's request, so no DISCONNECTED goes back
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_port_taken_in_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (first, _rx1) = control("ctl-a");
        let (second, _rx2) = control("ctl-b");
        let port = free_port();

        let _listener =
            ExposedListener::create(port, first, registry.clone(), loopback()).unwrap();
        let err = ExposedListener::create(port, second, registry.clone(), loopback()).unwrap_err();

        assert!(matches!(
            ExposeError::from(err),
            ExposeError::PortTaken(p) if p == port
        ));
    }

    #[tokio::test]
    async fn test_os_bind_failure_leaves_nothing_behind() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, _rx) = control("ctl-a");
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = squatter.local_addr().unwrap().port();

        let err = ExposedListener::create(port, handle, registry.clone(), loopback()).unwrap_err();

        assert!(matches!(err, ExposedListenerError::BindError { .. }));
        assert!(matches!(
            ExposeError::from(err),
            ExposeError::Bind { port: p, .. } if p == port
        ));
        assert!(registry.listener_for_port(port).is_none());
        assert!(registry.listeners_of(&ChannelId::from("ctl-a")).is_empty());
    }

    #[tokio::test]
    async fn test_close_stops_accepting_and_drops_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = control("ctl-a");
        let listener =
            ExposedListener::create(free_port(), handle, registry.clone(), loopback()).unwrap();
        let addr = listener.local_addr();

        let mut user = TcpStream::connect(addr).await.unwrap();
        user.write_all(b"x").await.unwrap();
        next_frame(&mut rx).await;

        listener.close();
        assert!(listener.is_closed());
        assert!(registry.listener_for_port(addr.port()).is_none());
        assert_eq!(registry.stats().external_connections, 0);

        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), user.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_port_rebinds_right_after_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (first, _rx1) = control("ctl-a");
        let (second, _rx2) = control("ctl-b");
        let port = free_port();

        let listener = ExposedListener::create(port, first, registry.clone(), loopback()).unwrap();
        listener.close();

        // No yield in between: the old accept loop has not run yet
        let successor =
            ExposedListener::create(port, second, registry.clone(), loopback()).unwrap();
        assert_eq!(successor.local_addr().port(), port);
        assert_eq!(registry.listener_for_port(port).unwrap().owner, ChannelId::from("ctl-b"));
    }

    #[tokio::test]
    async fn test_port_rebinds_right_after_eviction() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = control("ctl-a");
        let port = free_port();

        let _listener =
            ExposedListener::create(port, handle.clone(), registry.clone(), loopback()).unwrap();
        let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        user.write_all(b"x").await.unwrap();
        next_frame(&mut rx).await;

        registry.evict_control(handle.channel_id());

        let (again, _rx2) = control("ctl-a");
        ExposedListener::create(port, again, registry.clone(), loopback()).unwrap();
        assert_eq!(registry.listeners_of(&ChannelId::from("ctl-a")), vec![port]);
    }

    #[tokio::test]
    async fn test_control_shutdown_cascades() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, _rx) = control("ctl-a");
        let listener = ExposedListener::create(
            free_port(),
            handle.clone(),
            registry.clone(),
            loopback(),
        )
        .unwrap();

        handle.close();
        assert!(listener.is_closed());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.listener_for_port(listener.port()).is_none());
        assert!(TcpStream::connect(listener.local_addr()).await.is_err());
    }
}
