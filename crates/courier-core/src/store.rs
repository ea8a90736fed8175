//! Message store contract and an in-memory implementation.

use crate::message::{MessageId, StoredMessage};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A message with this id is already stored.
    #[error("Duplicate message id: {0}")]
    Duplicate(MessageId),
}

/// Durable home of messages between publish and full acknowledgment.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message.
    async fn add(&self, message: StoredMessage) -> Result<(), StoreError>;

    /// Fetch a message, or `None` if it is not stored.
    async fn try_get(&self, id: &MessageId) -> Result<Option<StoredMessage>, StoreError>;

    /// Delete a message. Returns whether it existed.
    async fn delete(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Up to `limit` stored message ids, oldest first.
    async fn pending_messages(&self, limit: usize) -> Result<Vec<MessageId>, StoreError>;
}

/// A process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    messages: DashMap<MessageId, StoredMessage>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn add(&self, message: StoredMessage) -> Result<(), StoreError> {
        match self.messages.entry(message.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(message.id)),
            Entry::Vacant(slot) => {
                trace!(message = %message.id, route = %message.route, "Message stored");
                slot.insert(message);
                Ok(())
            }
        }
    }

    async fn try_get(&self, id: &MessageId) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.messages.get(id).map(|m| m.value().clone()))
    }

    async fn delete(&self, id: &MessageId) -> Result<bool, StoreError> {
        Ok(self.messages.remove(id).is_some())
    }

    async fn pending_messages(&self, limit: usize) -> Result<Vec<MessageId>, StoreError> {
        let mut entries: Vec<(u64, MessageId)> = self
            .messages
            .iter()
            .map(|m| (m.timestamp, m.id))
            .collect();
        entries.sort_unstable();
        Ok(entries.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}
