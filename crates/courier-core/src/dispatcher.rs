//! Destination selection under per-connection concurrency limits.

use crate::client::{Client, ConnectionId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Dispatcher errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The connection is already registered.
    #[error("Connection already registered: {0}")]
    DuplicateRegistration(ConnectionId),
}

/// The set of connections consuming from one queue.
///
/// Selection takes the read lock; registration changes take the write lock.
/// Returning `None` from selection means every connection is saturated.
#[derive(Debug, Default)]
pub struct Dispatcher {
    clients: RwLock<Vec<Arc<Client>>>,
    cursor: AtomicUsize,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateRegistration`] if a connection with
    /// the same id is already registered.
    pub fn add(&self, client: Arc<Client>) -> Result<(), DispatchError> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.iter().any(|c| c.id() == client.id()) {
            return Err(DispatchError::DuplicateRegistration(client.id().clone()));
        }
        debug!(connection = %client.id(), "Connection registered");
        clients.push(client);
        Ok(())
    }

    /// Unregister a connection. Returns whether it was registered.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let before = clients.len();
        clients.retain(|c| c.id() != id);
        before != clients.len()
    }

    /// The first connection with a free delivery slot.
    #[must_use]
    pub fn next_available(&self) -> Option<Arc<Client>> {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        clients.iter().find(|c| c.is_available()).cloned()
    }

    /// Pick an available connection and take one of its slots.
    ///
    /// The scan starts one past the previous pick, spreading load across
    /// subscribers.
    pub fn reserve_next(&self) -> Option<Arc<Client>> {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        let count = clients.len();
        if count == 0 {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        (0..count)
            .map(|offset| &clients[(start + offset) % count])
            .find(|c| c.try_reserve())
            .cloned()
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|c| c.id() == id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister every connection.
    pub fn clear(&self) {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::client;

    #[test]
    fn test_empty_has_nothing_available() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.next_available().is_none());
        assert!(dispatcher.reserve_next().is_none());
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_available_client_is_returned() {
        let dispatcher = Dispatcher::new();
        dispatcher.add(client("c1", 1)).unwrap();

        let picked = dispatcher.next_available().unwrap();
        assert_eq!(picked.id().as_str(), "c1");
    }

    #[test]
    fn test_duplicate_registration() {
        let dispatcher = Dispatcher::new();
        dispatcher.add(client("c1", 1)).unwrap();

        assert_eq!(
            dispatcher.add(client("c1", 4)),
            Err(DispatchError::DuplicateRegistration(ConnectionId::from("c1")))
        );
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_saturated_clients_are_skipped() {
        let dispatcher = Dispatcher::new();
        let busy = client("busy", 1);
        let idle = client("idle", 1);
        dispatcher.add(busy.clone()).unwrap();
        dispatcher.add(idle).unwrap();

        assert!(busy.try_reserve());
        assert_eq!(dispatcher.next_available().unwrap().id().as_str(), "idle");

        assert!(dispatcher.reserve_next().is_some());
        assert!(dispatcher.next_available().is_none());
        assert!(dispatcher.reserve_next().is_none());
    }

    #[test]
    fn test_reserve_rotates() {
        let dispatcher = Dispatcher::new();
        dispatcher.add(client("a", 10)).unwrap();
        dispatcher.add(client("b", 10)).unwrap();

        let first = dispatcher.reserve_next().unwrap();
        let second = dispatcher.reserve_next().unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_remove() {
        let dispatcher = Dispatcher::new();
        dispatcher.add(client("c1", 1)).unwrap();

        let id = ConnectionId::from("c1");
        assert!(dispatcher.contains(&id));
        assert!(dispatcher.remove(&id));
        assert!(!dispatcher.remove(&id));
        assert!(dispatcher.next_available().is_none());
    }
}
