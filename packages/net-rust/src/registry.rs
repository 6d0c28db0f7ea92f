//! Concurrent set of live connections kept by a server.

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::connection::{ClientConnection, ConnectionId};

/// Thread-safe registry of server-side connections.
///
/// Uses `DashMap` so accept completions, close callbacks and broadcasts can
/// add, remove and iterate concurrently.
pub struct ConnectionRegistry<M> {
    connections: DashMap<ConnectionId, ClientConnection<M>>,
}

impl<M: Send + 'static> ConnectionRegistry<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Adds a connection and returns its id.
    pub fn register(&self, conn: ClientConnection<M>) -> ConnectionId {
        let id = conn.id();
        self.connections.insert(id, conn);
        trace!(conn_id = %id, count = self.connections.len(), "connection registered");
        id
    }

    /// Removes a connection, returning it if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<ClientConnection<M>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<ClientConnection<M>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of the current connections.
    #[must_use]
    pub fn connections(&self) -> Vec<ClientConnection<M>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sends `message` to every connection in a snapshot taken at call time.
    ///
    /// Connections registered after the snapshot are skipped. Connections
    /// removed after it may still be offered the message; sends that fail
    /// synchronously (for example because the connection already closed) are
    /// skipped. Returns the number of sends that were submitted.
    pub fn broadcast(&self, message: &M) -> usize {
        self.broadcast_where(message, |_| true)
    }

    /// Like [`broadcast`](Self::broadcast), skipping the connection `except`.
    pub fn broadcast_except(&self, message: &M, except: ConnectionId) -> usize {
        self.broadcast_where(message, |conn| conn.id() != except)
    }

    fn broadcast_where(
        &self,
        message: &M,
        include: impl Fn(&ClientConnection<M>) -> bool,
    ) -> usize {
        let mut submitted = 0;
        for conn in self.connections() {
            if !include(&conn) {
                continue;
            }
            match conn.send(message) {
                Ok(()) => submitted += 1,
                Err(err) => {
                    trace!(conn_id = %conn.id(), error = %err, "broadcast skipped connection");
                }
            }
        }
        submitted
    }

    /// Removes and returns all connections.
    pub fn drain_all(&self) -> Vec<ClientConnection<M>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }

    /// Drains the registry and shuts every connection down so peers observe
    /// closure. Returns how many were shut down.
    pub fn shutdown_all(&self) -> usize {
        let drained = self.drain_all();
        for conn in &drained {
            conn.shutdown();
        }
        debug!(count = drained.len(), "shut down registered connections");
        drained.len()
    }
}

impl<M: Send + 'static> Default for ConnectionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use sockflow_core::RawSerializer;

    use super::*;
    use crate::pool::ContextPool;

    fn idle_connection() -> ClientConnection<Vec<u8>> {
        ClientConnection::builder()
            .pool(Arc::new(ContextPool::default()))
            .serializer(RawSerializer)
            .build()
    }

    #[test]
    fn register_get_remove() {
        let registry = ConnectionRegistry::new();
        let conn = idle_connection();
        let id = registry.register(conn.clone());

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(id).unwrap().id(), id);

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.id(), conn.id());
        assert!(registry.is_empty());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn connections_returns_snapshot() {
        let registry = ConnectionRegistry::new();
        registry.register(idle_connection());
        registry.register(idle_connection());

        let snapshot = registry.connections();
        registry.register(idle_connection());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn broadcast_skips_connections_that_cannot_send() {
        let registry = ConnectionRegistry::new();
        registry.register(idle_connection());
        registry.register(idle_connection());
        assert_eq!(registry.broadcast(&b"hello".to_vec()), 0);
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        for _ in 0..5 {
            registry.register(idle_connection());
        }
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 5);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.shutdown_all(), 0);
    }

    #[test]
    fn concurrent_register_and_remove() {
        let registry = Arc::new(ConnectionRegistry::<Vec<u8>>::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let id = registry.register(ClientConnection::builder().build());
                        assert!(registry.remove(id).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
