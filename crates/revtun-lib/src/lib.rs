//! Reverse tunnel broker library
//!
//! Re-exports the broker crates and provides [`Broker`], which accepts
//! control connections from internal clients and exposes the ports they
//! register.
//!
//! # Quick Start
//!
//! ```ignore
//! use revtun_lib::BrokerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = BrokerBuilder::new()
//!         .control_addr("0.0.0.0:7000")?
//!         .password("s3cret")
//!         .bind()
//!         .await?;
//!
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **`revtun-proto`**: Tunnel frames and the length-prefixed codec
//! - **`revtun-router`**: Connection registry (ports, control connections, external connections)
//! - **`revtun-control`**: Control session state machine and liveness monitor
//! - **`revtun-server-tcp`**: Exposed listeners and external connection pumps

pub mod broker;

pub use broker::{Broker, BrokerBuilder, BrokerConfig, BrokerError, DEFAULT_CONTROL_ADDR};

// Re-export protocol types
pub use revtun_proto::{ChannelId, CodecError, FrameCodec, FrameType, TunnelFrame};

// Re-export registry types
pub use revtun_router::{ConnectionRegistry, RegistryError, RegistryStats};

// Re-export control plane types
pub use revtun_control::{
    ControlHandle, ControlSession, ExposeError, ListenerSpawner, SessionConfig, SessionError,
};

// Re-export listener types
pub use revtun_server_tcp::{
    ExposedListener, ExposedListenerConfig, ExposedListenerError, TcpListenerSpawner,
};

// Cancellation handle used by `Broker::shutdown_token`
pub use tokio_util::sync::CancellationToken;
