//! Shared connection registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionId};
use crate::errors::RegistryError;

/// Concurrency-safe mapping from connection identity to connection.
///
/// The single source of truth for "is this connection still tracked".
/// Passed by `Arc` to both ingestion paths and every session — never an
/// ambient global.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a connection under its identity.
    ///
    /// Fails with [`RegistryError::Duplicate`] if the identity is already
    /// live; the existing entry is never overwritten.
    pub async fn insert(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let mut conns = self.connections.write().await;
        match conns.entry(connection.id) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(connection.id)),
            Entry::Vacant(slot) => {
                let _ = slot.insert(connection);
                Ok(())
            }
        }
    }

    /// Remove a connection by identity. Returns whether an entry was
    /// removed; absent identities are a no-op, safe to repeat concurrently.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Whether an identity is currently tracked.
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Number of tracked connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot of currently-tracked identities, for observability.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
