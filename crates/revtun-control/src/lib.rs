//! Control plane for reverse tunnel sessions
pub mod config;
pub mod connection;
pub mod handler;
pub mod liveness;

pub use config::SessionConfig;
pub use connection::{ControlClosed, ControlHandle};
pub use handler::{ControlSession, ExposeError, ListenerSpawner, SessionError, SessionState};
pub use liveness::{IdleVerdict, LivenessMonitor};
