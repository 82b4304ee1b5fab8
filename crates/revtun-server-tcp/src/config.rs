use std::net::{IpAddr, Ipv4Addr};

/// Settings for exposed listeners
#[derive(Debug, Clone)]
pub struct ExposedListenerConfig {
    /// Address public ports are bound on
    pub bind_ip: IpAddr,
    /// Largest chunk read from a user socket into one DATA frame
    pub read_chunk_size: usize,
    /// Pending writes per external connection before DATA frames wait
    pub write_queue_depth: usize,
}

impl Default for ExposedListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            read_chunk_size: 8192,
            write_queue_depth: 64,
        }
    }
}

impl ExposedListenerConfig {
    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth.max(1);
        self
    }
}
