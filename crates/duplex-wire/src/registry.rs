//! Peer registry: the table of live connections keyed by remote address.
//!
//! Connection-handling tasks insert and evict entries concurrently, so the
//! table sits behind a single `RwLock`. Entries hold no back-reference to
//! the registry.

use crate::connection::PeerConnection;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe registry of live peer connections.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    connections: Arc<RwLock<HashMap<String, PeerConnection>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `addr`, returning any connection it replaced.
    pub fn insert(&self, addr: String, conn: PeerConnection) -> Option<PeerConnection> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(addr, conn)
    }

    /// Look up the connection registered under `addr`.
    pub fn get(&self, addr: &str) -> Option<PeerConnection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.get(addr).cloned()
    }

    /// Remove and return the connection registered under `addr`.
    pub fn remove(&self, addr: &str) -> Option<PeerConnection> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.remove(addr)
    }

    /// Remove `addr` only if it still maps to `conn`'s session.
    ///
    /// A closing connection must not evict a newer one registered under the
    /// same address.
    pub fn remove_if_same(&self, addr: &str, conn: &PeerConnection) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        match connections.get(addr) {
            Some(existing) if existing.same_connection(conn) => {
                connections.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Addresses of all registered connections, sorted.
    pub fn addrs(&self) -> Vec<String> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut addrs: Vec<String> = connections.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// All registered connections, in no particular order.
    pub fn all(&self) -> Vec<PeerConnection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<PeerConnection> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.drain().map(|(_, conn)| conn).collect()
    }
}
