//! Public TCP listeners for exposed ports
//!
//! An [`ExposedListener`] accepts user connections on a port requested by an
//! internal client and pumps their bytes through the owning control
//! connection as DATA frames.

pub mod config;
pub mod listener;
mod pump;
pub mod spawner;

pub use config::ExposedListenerConfig;
pub use listener::{ExposedListener, ExposedListenerError};
pub use spawner::TcpListenerSpawner;
