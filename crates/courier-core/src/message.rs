//! Stored message types.

use bytes::Bytes;
use courier_protocol::CorrelationId;
use std::time::{SystemTime, UNIX_EPOCH};

/// A message identifier: the correlation id of the publishing frame.
pub type MessageId = CorrelationId;

/// Milliseconds since the Unix epoch; zero if the clock is before it.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// A published message held by the store until fully acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Route the message was published on.
    pub route: String,
    /// Message payload (shared across deliveries).
    pub payload: Bytes,
    /// Publishing connection, if any.
    pub source: Option<String>,
    /// Milliseconds since the Unix epoch when the message was accepted.
    pub timestamp: u64,
}

impl StoredMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(id: MessageId, route: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            route: route.into(),
            payload: payload.into(),
            source: None,
            timestamp: now_millis(),
        }
    }

    /// Create a message with a source connection.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
