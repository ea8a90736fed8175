//! Connected clients and the transport send contract.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::{codec, CorrelationId, Frame};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A unique connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors reported by a connection sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// The write failed.
    #[error("Send failed: {0}")]
    Failed(String),
}

/// The outbound half of a connection, implemented by the transport.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Write bytes to the peer, returning how many were sent.
    async fn send(&self, data: Bytes) -> Result<usize, SendError>;

    /// Close the connection.
    async fn close(&self);
}

/// A connected client as seen by dispatchers.
///
/// Concurrency accounting is per connection: the same record is shared by
/// every queue the client subscribes to.
pub struct Client {
    id: ConnectionId,
    sink: Arc<dyn ConnectionSink>,
    in_flight: AtomicUsize,
    max_concurrency: AtomicUsize,
    deliveries: DashSet<CorrelationId>,
}

impl Client {
    /// Create a client record.
    #[must_use]
    pub fn new(id: ConnectionId, sink: Arc<dyn ConnectionSink>, max_concurrency: usize) -> Self {
        Self {
            id,
            sink,
            in_flight: AtomicUsize::new(0),
            max_concurrency: AtomicUsize::new(max_concurrency),
            deliveries: DashSet::new(),
        }
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Deliveries currently outstanding.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Outstanding deliveries allowed at once.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::Acquire)
    }

    /// Change the concurrency ceiling.
    pub fn set_max_concurrency(&self, max: usize) {
        self.max_concurrency.store(max, Ordering::Release);
    }

    /// Whether the client can take another delivery.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.in_flight() < self.max_concurrency()
    }

    /// Take a delivery slot if one is free.
    pub fn try_reserve(&self) -> bool {
        let max = self.max_concurrency();
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give a delivery slot back.
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    /// Remember a delivery sent to this client.
    pub fn track_delivery(&self, delivery: CorrelationId) {
        self.deliveries.insert(delivery);
    }

    /// Forget a delivery; returns whether it was tracked.
    pub fn untrack_delivery(&self, delivery: &CorrelationId) -> bool {
        self.deliveries.remove(delivery).is_some()
    }

    /// Remove and return every tracked delivery.
    pub fn take_deliveries(&self) -> Vec<CorrelationId> {
        let ids: Vec<CorrelationId> = self.deliveries.iter().map(|id| *id).collect();
        ids.into_iter()
            .filter(|id| self.deliveries.remove(id).is_some())
            .collect()
    }

    /// Write raw bytes to the client.
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn send(&self, data: Bytes) -> Result<usize, SendError> {
        self.sink.send(data).await
    }

    /// Encode and write a frame.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Failed`] if the frame cannot be encoded, or the
    /// sink's error.
    pub async fn send_frame(&self, frame: &Frame) -> Result<usize, SendError> {
        let data = codec::encode(frame).map_err(|e| SendError::Failed(e.to_string()))?;
        self.sink.send(data).await
    }

    /// Close the underlying connection.
    pub async fn close(&self) {
        self.sink.close().await;
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .field("max_concurrency", &self.max_concurrency())
            .finish()
    }
}
