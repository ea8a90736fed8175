//! The session boundary between a transport host and the broker.

use crate::assembler::FrameAssembler;
use crate::client::{Client, ConnectionId, ConnectionSink};
use async_trait::async_trait;
use courier_protocol::{Frame, ProtocolError};
use dashmap::DashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors returned to the transport host.
///
/// Any error from [`SessionHandler::on_data_received`] ends the connection;
/// it never affects other connections.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session is registered under this id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// A session is already registered under this id.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// The peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connection lifecycle callbacks, called by the transport host.
///
/// Data for one connection is delivered in arrival order from a single
/// receive loop; different connections call in concurrently.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// A connection was accepted. `sink` is its outbound half.
    async fn on_connected(
        &self,
        id: ConnectionId,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<(), SessionError>;

    /// The connection is gone.
    async fn on_disconnected(&self, id: &ConnectionId);

    /// Bytes arrived on the connection.
    async fn on_data_received(&self, id: &ConnectionId, data: &[u8]) -> Result<(), SessionError>;
}

/// Per-connection broker state.
pub struct Session {
    client: Arc<Client>,
    assembler: Mutex<FrameAssembler>,
    subscriptions: DashSet<String>,
}

impl Session {
    /// Create a session for a client.
    #[must_use]
    pub fn new(client: Arc<Client>, assembler: FrameAssembler) -> Self {
        Self {
            client,
            assembler: Mutex::new(assembler),
            subscriptions: DashSet::new(),
        }
    }

    /// The client record shared with dispatchers.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.client.id()
    }

    /// Buffer received bytes.
    pub fn feed(&self, data: &[u8]) {
        self.assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(data);
    }

    /// Extract the next complete frame from the buffered bytes.
    ///
    /// Frames ahead of a protocol violation are returned before the error.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an oversized or malformed frame.
    pub fn next_frame(&self) -> Result<Option<Frame>, ProtocolError> {
        self.assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_frame()
    }

    /// Bytes buffered but not yet framed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record a subscription. Returns `false` if already present.
    pub fn add_subscription(&self, queue: &str) -> bool {
        self.subscriptions.insert(queue.to_string())
    }

    /// Forget a subscription. Returns whether it was present.
    pub fn remove_subscription(&self, queue: &str) -> bool {
        self.subscriptions.remove(queue).is_some()
    }

    /// Whether the session consumes from `queue`.
    #[must_use]
    pub fn is_subscribed(&self, queue: &str) -> bool {
        self.subscriptions.contains(queue)
    }

    /// Queues the session consumes from.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.iter().map(|q| q.clone()).collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
