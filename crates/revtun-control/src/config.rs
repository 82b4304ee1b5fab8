//! Per-session tunables

use std::time::Duration;

/// Default read-idle window before a miss is counted
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(30);

/// Misses tolerated before the control connection is dropped
pub const DEFAULT_IDLE_RETRY_LIMIT: u32 = 5;

/// Longest a DATA frame may wait for room in an external connection's queue
pub const DEFAULT_DATA_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Settings shared by every control session of a broker
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shared secret expected in REGISTER. `None` rejects every registration.
    pub password: Option<String>,
    pub idle_window: Duration,
    pub idle_retry_limit: u32,
    pub data_write_timeout: Duration,
    /// Frames queued towards the internal client before senders wait
    pub outbound_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            password: None,
            idle_window: DEFAULT_IDLE_WINDOW,
            idle_retry_limit: DEFAULT_IDLE_RETRY_LIMIT,
            data_write_timeout: DEFAULT_DATA_WRITE_TIMEOUT,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
        }
    }
}

impl SessionConfig {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn with_idle_window(mut self, idle_window: Duration) -> Self {
        self.idle_window = idle_window;
        self
    }

    pub fn with_idle_retry_limit(mut self, limit: u32) -> Self {
        self.idle_retry_limit = limit;
        self
    }

    pub fn with_data_write_timeout(mut self, timeout: Duration) -> Self {
        self.data_write_timeout = timeout;
        self
    }

    pub fn with_outbound_queue_depth(mut self, depth: usize) -> Self {
        self.outbound_queue_depth = depth.max(1);
        self
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        self.password
            .as_deref()
            .is_some_and(|expected| expected == candidate)
    }
}
