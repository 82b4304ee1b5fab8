//! Broker builder and accept loop

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use revtun_control::{ControlSession, ListenerSpawner, SessionConfig};
use revtun_router::{ConnectionRegistry, RegistryStats};
use revtun_server_tcp::{ExposedListenerConfig, TcpListenerSpawner};

pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:7000";

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Failed to bind control listener to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything a broker needs to start
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Where internal clients open control connections
    pub control_addr: SocketAddr,
    pub session: SessionConfig,
    pub listener: ExposedListenerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            session: SessionConfig::default(),
            listener: ExposedListenerConfig::default(),
        }
    }
}

/// Builder for [`Broker`]
#[derive(Debug, Default)]
pub struct BrokerBuilder {
    config: BrokerConfig,
    shutdown: Option<CancellationToken>,
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: BrokerConfig) -> Self {
        Self {
            config,
            shutdown: None,
        }
    }

    /// Address for control connections, e.g. `"0.0.0.0:7000"`
    pub fn control_addr(mut self, addr: &str) -> Result<Self, BrokerError> {
        self.config.control_addr = addr
            .parse()
            .map_err(|e| BrokerError::ParseError(format!("Invalid control address {}: {}", addr, e)))?;
        Ok(self)
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.session.password = Some(password.into());
        self
    }

    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn listener_config(mut self, listener: ExposedListenerConfig) -> Self {
        self.config.listener = listener;
        self
    }

    /// Address exposed ports are bound on
    pub fn public_bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.listener.bind_ip = ip;
        self
    }

    /// Use an externally owned token; cancelling it stops the broker
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Bind the control listener
    pub async fn bind(self) -> Result<Broker, BrokerError> {
        let address = self.config.control_addr;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| BrokerError::BindError {
                address,
                reason: e.to_string(),
            })?;

        if self.config.session.password.is_none() {
            warn!("No password configured, every registration will be rejected");
        }

        let registry = Arc::new(ConnectionRegistry::new());
        let spawner: Arc<dyn ListenerSpawner> = Arc::new(TcpListenerSpawner::new(
            registry.clone(),
            self.config.listener.clone(),
        ));

        Ok(Broker {
            listener,
            registry,
            spawner,
            session_config: self.config.session,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

/// A bound broker, ready to [`run`](Broker::run)
pub struct Broker {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    spawner: Arc<dyn ListenerSpawner>,
    session_config: SessionConfig,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Accept control connections until the shutdown token is cancelled.
    ///
    /// On shutdown every session, listener and external connection is closed
    /// before this returns.
    pub async fn run(self) -> Result<(), BrokerError> {
        let local_addr = self.listener.local_addr()?;
        info!("Broker accepting control connections on {}", local_addr);

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Control session task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }
                        let session = ControlSession::new(
                            self.registry.clone(),
                            self.spawner.clone(),
                            self.session_config.clone(),
                            self.shutdown.child_token(),
                        )
                        .with_peer_addr(peer_addr);

                        debug!("Accepted control connection {} from {}", session.channel_id(), peer_addr);
                        sessions.spawn(async move {
                            if let Err(e) = session.run(stream).await {
                                debug!("Control connection from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!(
            "Broker shutting down, closing {} control connection(s)",
            sessions.len()
        );
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Control session task failed: {}", e);
            }
        }
        Ok(())
    }
}
