//! Connection routing tables for the broker
//!
//! Relates control connections, exposed ports and external connections so that
//! inbound frames can be routed by channel id and teardown can cascade.

pub mod external;
pub mod registry;

pub use external::{ExternalCommand, ExternalConnection, ExternalWriteError};
pub use registry::{
    ConnectionRegistry, ListenerEntry, ListenerSocket, ListenerState, PortReservation,
    RegistryError, RegistryStats,
};
