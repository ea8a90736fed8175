//! Transport abstraction for Courier hosts.
//!
//! A transport accepts connections and drives a [`SessionHandler`] for each
//! of them: one receive loop per connection feeding `on_data_received`, and a
//! [`ConnectionSink`](courier_core::ConnectionSink) for the handler to write
//! back through.

use async_trait::async_trait;
use courier_core::SessionHandler;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to bind the listener.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that accepts connections and hosts their sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept connections until the listener fails, handing each one to
    /// `handler`.
    async fn serve(&self, handler: Arc<dyn SessionHandler>) -> Result<(), TransportError>;

    /// The address the transport listens on.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Get the transport name (e.g., "tcp").
    fn name(&self) -> &'static str;
}
