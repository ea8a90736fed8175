//! # courier-transport
//!
//! Host transport for the Courier broker.
//!
//! The transport owns sockets; the broker owns sessions. Each accepted
//! connection gets a generated [`ConnectionId`](courier_core::ConnectionId),
//! a [`TcpSink`] for outbound frames and one receive loop that feeds raw
//! bytes to [`SessionHandler::on_data_received`](courier_core::SessionHandler).
//! A handler error or a read failure closes the connection and reports the
//! disconnect.
//!
//! ```rust,ignore
//! use courier_core::{Broker, BrokerConfig};
//! use courier_transport::{TcpTransport, Transport};
//!
//! let broker = Broker::in_memory(BrokerConfig::default());
//! let transport = TcpTransport::bind("127.0.0.1:7070".parse()?).await?;
//! transport.serve(Arc::new(broker)).await?;
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{TcpConfig, TcpSink, TcpTransport};
pub use traits::{Transport, TransportError};
