//! Connection registry for control connections, exposed ports and external connections
//!
//! Every structural change is a single atomic step on one DashMap entry, so two
//! control connections racing for the same port, or a lookup racing with a
//! close, can never observe a half-applied update.

use crate::external::ExternalConnection;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use revtun_proto::ChannelId;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Port {port} is already bound by {owner}")]
    AlreadyBound { port: u16, owner: ChannelId },

    #[error("Channel id already registered: {0}")]
    DuplicateChannel(ChannelId),
}

/// Lifecycle of a port entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Port claimed, socket not bound yet
    Reserved,
    /// Accepting on this address
    Bound(SocketAddr),
}

/// The OS socket behind a bound port
///
/// `release` must close the socket before it returns. The registry calls it
/// while it still holds the port entry, so a later `bind_port` for the same
/// port can always bind at the OS level.
pub trait ListenerSocket: Send + Sync + fmt::Debug {
    fn release(&self);
}

/// An exposed port and the control connection it forwards to
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub owner: ChannelId,
    pub state: ListenerState,
    shutdown: CancellationToken,
    socket: Option<Arc<dyn ListenerSocket>>,
}

impl ListenerEntry {
    /// Cancelled when the listener is closed; external connections accepted on
    /// it hold child tokens.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn release(&self) {
        if let Some(socket) = &self.socket {
            socket.release();
        }
        self.shutdown.cancel();
    }
}

/// A live control connection
#[derive(Debug, Clone)]
pub struct ControlEntry {
    pub peer_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

/// Point-in-time table sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub sessions: usize,
    pub listeners: usize,
    pub external_connections: usize,
}

/// Broker-wide connection tables.
///
/// Owned by the broker and shared with every session and listener through an
/// `Arc`; there is no global instance.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Live control connections
    sessions: DashMap<ChannelId, ControlEntry>,
    /// port -> owning control connection
    listeners_by_port: DashMap<u16, ListenerEntry>,
    /// control connection -> ports it has bound
    listeners_by_control: DashMap<ChannelId, Vec<u16>>,
    /// channel id -> external connection
    external_connections: DashMap<ChannelId, ExternalConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted control connection
    pub fn register_control(&self, id: ChannelId, peer_addr: Option<SocketAddr>) {
        self.sessions.insert(
            id,
            ControlEntry {
                peer_addr,
                connected_at: Utc::now(),
            },
        );
    }

    pub fn control(&self, id: &ChannelId) -> Option<ControlEntry> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Forget a control connection and tear down everything it owns.
    ///
    /// Returns the ports that were released.
    pub fn evict_control(&self, id: &ChannelId) -> Vec<u16> {
        self.sessions.remove(id);
        let ports = self.close_listeners_of(id);
        debug!(
            "Evicted control connection {} ({} listener(s) released)",
            id,
            ports.len()
        );
        ports
    }

    /// Atomically claim `port` for `owner`.
    ///
    /// The claim is released again when the returned reservation is dropped
    /// without being committed, so a failed socket bind leaves nothing behind.
    pub fn bind_port(
        self: &Arc<Self>,
        port: u16,
        owner: &ChannelId,
        shutdown: CancellationToken,
    ) -> Result<PortReservation, RegistryError> {
        match self.listeners_by_port.entry(port) {
            Entry::Occupied(existing) => Err(RegistryError::AlreadyBound {
                port,
                owner: existing.get().owner.clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(ListenerEntry {
                    owner: owner.clone(),
                    state: ListenerState::Reserved,
                    shutdown: shutdown.clone(),
                    socket: None,
                });
                trace!("Reserved port {} for {}", port, owner);
                Ok(PortReservation {
                    registry: Arc::clone(self),
                    port,
                    owner: owner.clone(),
                    shutdown,
                    committed: false,
                })
            }
        }
    }

    /// Associate `port` with its owning control connection
    pub fn add_listener(&self, owner: &ChannelId, port: u16) {
        let mut ports = self.listeners_by_control.entry(owner.clone()).or_default();
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    pub fn listener_for_port(&self, port: u16) -> Option<ListenerEntry> {
        self.listeners_by_port
            .get(&port)
            .map(|entry| entry.value().clone())
    }

    /// Ports currently owned by a control connection
    pub fn listeners_of(&self, owner: &ChannelId) -> Vec<u16> {
        self.listeners_by_control
            .get(owner)
            .map(|ports| ports.value().clone())
            .unwrap_or_default()
    }

    /// Close one listener if it still belongs to `owner`.
    ///
    /// Cancels its acceptor and every external connection accepted on it. The
    /// OS socket is closed before the port can be claimed again.
    pub fn close_listener(&self, port: u16, owner: &ChannelId) -> bool {
        if !self.release_port(port, owner) {
            return false;
        }

        if let Some(mut ports) = self.listeners_by_control.get_mut(owner) {
            ports.retain(|p| *p != port);
        }

        self.drop_external_where(|conn| conn.port() == port && conn.owner() == owner);
        debug!("Closed listener on port {} (owner {})", port, owner);
        true
    }

    /// Close every listener owned by `owner`, returning the released ports
    pub fn close_listeners_of(&self, owner: &ChannelId) -> Vec<u16> {
        let ports = self
            .listeners_by_control
            .remove(owner)
            .map(|(_, ports)| ports)
            .unwrap_or_default();

        for port in &ports {
            self.release_port(*port, owner);
        }

        self.drop_external_where(|conn| conn.owner() == owner);
        ports
    }

    /// Add an external connection to the routing index
    pub fn register_external(&self, conn: ExternalConnection) -> Result<(), RegistryError> {
        match self.external_connections.entry(conn.channel_id().clone()) {
            Entry::Occupied(existing) => {
                Err(RegistryError::DuplicateChannel(existing.key().clone()))
            }
            Entry::Vacant(vacant) => {
                trace!(
                    "Registered external connection {} on port {}",
                    conn.channel_id(),
                    conn.port()
                );
                vacant.insert(conn);
                Ok(())
            }
        }
    }

    pub fn remove_external(&self, id: &ChannelId) -> Option<ExternalConnection> {
        self.external_connections.remove(id).map(|(_, conn)| conn)
    }

    /// Look up an external connection by channel id.
    ///
    /// A connection that closed concurrently is simply not found.
    pub fn find_external(&self, id: &ChannelId) -> Option<ExternalConnection> {
        self.external_connections
            .get(id)
            .map(|entry| entry.value().clone())
    }

    /// Like [`find_external`](Self::find_external), but only matches connections
    /// owned by `owner`
    pub fn find_owned_external(
        &self,
        id: &ChannelId,
        owner: &ChannelId,
    ) -> Option<ExternalConnection> {
        self.find_external(id)
            .filter(|conn| conn.owner() == owner)
    }

    /// Remove an owned external connection and close it after its queued writes
    pub fn close_external(&self, id: &ChannelId, owner: &ChannelId) -> Option<ExternalConnection> {
        let (_, conn) = self
            .external_connections
            .remove_if(id, |_, conn| conn.owner() == owner)?;
        conn.close_gracefully();
        Some(conn)
    }

    pub fn externals_on_port(&self, port: u16) -> Vec<ChannelId> {
        self.external_connections
            .iter()
            .filter(|entry| entry.value().port() == port)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions: self.sessions.len(),
            listeners: self.listeners_by_port.len(),
            external_connections: self.external_connections.len(),
        }
    }

    /// Remove `port` if `owner` holds it, closing its socket under the entry lock
    fn release_port(&self, port: u16, owner: &ChannelId) -> bool {
        match self.listeners_by_port.entry(port) {
            Entry::Occupied(entry) if &entry.get().owner == owner => {
                entry.get().release();
                entry.remove();
                true
            }
            _ => false,
        }
    }

    fn drop_external_where<F>(&self, predicate: F)
    where
        F: Fn(&ExternalConnection) -> bool,
    {
        self.external_connections.retain(|_, conn| {
            if predicate(conn) {
                conn.abort();
                false
            } else {
                true
            }
        });
    }
}

/// A claimed port that has not been bound yet
#[derive(Debug)]
pub struct PortReservation {
    registry: Arc<ConnectionRegistry>,
    port: u16,
    owner: ChannelId,
    shutdown: CancellationToken,
    committed: bool,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn owner(&self) -> &ChannelId {
        &self.owner
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Mark the port as bound and attach it to its control connection
    pub fn commit(self, local_addr: SocketAddr) {
        self.commit_inner(local_addr, None);
    }

    /// Like [`commit`](Self::commit), handing the registry the socket to
    /// close when the port is released
    pub fn commit_with_socket(self, local_addr: SocketAddr, socket: Arc<dyn ListenerSocket>) {
        self.commit_inner(local_addr, Some(socket));
    }

    fn commit_inner(mut self, local_addr: SocketAddr, socket: Option<Arc<dyn ListenerSocket>>) {
        if let Some(mut entry) = self.registry.listeners_by_port.get_mut(&self.port) {
            if entry.owner == self.owner {
                entry.state = ListenerState::Bound(local_addr);
                entry.socket = socket;
            }
        }
        self.registry.add_listener(&self.owner, self.port);
        self.committed = true;
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let owner = &self.owner;
        if self
            .registry
            .listeners_by_port
            .remove_if(&self.port, |_, entry| {
                &entry.owner == owner && entry.state == ListenerState::Reserved
            })
            .is_some()
        {
            trace!("Released uncommitted reservation for port {}", self.port);
        }
    }
}
