use async_trait::async_trait;
use revtun_control::{ControlHandle, ExposeError, ListenerSpawner};
use revtun_router::ConnectionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ExposedListenerConfig;
use crate::listener::ExposedListener;

/// Binds real TCP listeners for control sessions
pub struct TcpListenerSpawner {
    registry: Arc<ConnectionRegistry>,
    config: ExposedListenerConfig,
}

impl TcpListenerSpawner {
    pub fn new(registry: Arc<ConnectionRegistry>, config: ExposedListenerConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl ListenerSpawner for TcpListenerSpawner {
    async fn spawn(&self, control: ControlHandle, port: u16) -> Result<SocketAddr, ExposeError> {
        let listener =
            ExposedListener::create(port, control, self.registry.clone(), self.config.clone())?;
        Ok(listener.local_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtun_proto::ChannelId;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_spawn_binds_and_registers() {
        let registry = Arc::new(ConnectionRegistry::new());
        let spawner = TcpListenerSpawner::new(
            registry.clone(),
            ExposedListenerConfig::default().with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        );
        let (control, _rx) =
            ControlHandle::new(ChannelId::from("ctl-a"), 8, CancellationToken::new());
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let addr = spawner.spawn(control.clone(), port).await.unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(registry.listeners_of(control.channel_id()), vec![port]);

        assert_eq!(
            spawner.spawn(control, port).await,
            Err(ExposeError::PortTaken(port))
        );
    }
}
