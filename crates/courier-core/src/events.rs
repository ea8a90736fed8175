//! Broker events for observers.

use crate::client::ConnectionId;
use crate::message::MessageId;
use serde::Serialize;

/// Something that happened inside the broker.
///
/// Delivered over a broadcast channel; a receiver that falls behind misses
/// events rather than slowing the broker down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A connection was registered.
    Connected { connection: ConnectionId },
    /// A connection went away.
    Disconnected { connection: ConnectionId },
    /// A published message was stored and fanned out.
    MessageStored { id: MessageId, matches: usize },
    /// A delivery was acknowledged by a subscriber.
    MessageDelivered {
        id: MessageId,
        queue: String,
        connection: ConnectionId,
    },
    /// Every matched queue acknowledged the message; it left the store.
    MessageRetired { id: MessageId },
    /// A delivery attempt was rejected, timed out or could not be sent.
    DeliveryFailed {
        id: MessageId,
        queue: String,
        reason: String,
    },
}

impl BrokerEvent {
    /// Short event name, used as a metric label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::MessageStored { .. } => "message_stored",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRetired { .. } => "message_retired",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }
}
