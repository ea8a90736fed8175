//! Frame types for the Courier protocol.
//!
//! A frame carries a payload type tag, a 128-bit correlation id and an
//! opaque body. Structured bodies are serialized with MessagePack.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{self, ProtocolError};

/// Payload type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    Message = 0x01,
    Ack = 0x02,
    Nack = 0x03,
    Subscribe = 0x04,
    Unsubscribe = 0x05,
    QueueDeclare = 0x06,
    QueueDelete = 0x07,
    Ready = 0x08,
}

impl From<PayloadType> for u8 {
    fn from(pt: PayloadType) -> u8 {
        pt as u8
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PayloadType::Message),
            0x02 => Ok(PayloadType::Ack),
            0x03 => Ok(PayloadType::Nack),
            0x04 => Ok(PayloadType::Subscribe),
            0x05 => Ok(PayloadType::Unsubscribe),
            0x06 => Ok(PayloadType::QueueDeclare),
            0x07 => Ok(PayloadType::QueueDelete),
            0x08 => Ok(PayloadType::Ready),
            _ => Err("Invalid payload type"),
        }
    }
}

/// A 128-bit identifier linking a request to its eventual acknowledgment.
///
/// Published messages use the correlation id of their `Message` frame as
/// their message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u128);

impl CorrelationId {
    /// Generate a random (v4) correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().as_u128())
    }

    /// Big-endian wire representation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Read from the big-endian wire representation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_u128(self.0))
    }
}

impl From<u128> for CorrelationId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

/// Body of a `Message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Route the message was published on, e.g. `orders/eu/created`.
    pub route: String,
    /// Opaque application payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Body of a `Subscribe` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeBody {
    /// Queue to consume from.
    pub queue: String,
    /// Deliveries this connection may have outstanding at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

/// Body of an `Unsubscribe` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeBody {
    /// Queue to stop consuming from.
    pub queue: String,
}

/// Body of a `QueueDeclare` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclareBody {
    /// Queue name.
    pub name: String,
    /// Route pattern; `*` matches any single segment.
    pub route: String,
}

/// Body of a `QueueDelete` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeleteBody {
    /// Queue name.
    pub name: String,
}

/// Body of a `Nack` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackBody {
    /// Human-readable error message.
    pub message: String,
}

/// An owned protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the body contains.
    pub payload_type: PayloadType,
    /// Request/acknowledgment correlation.
    pub correlation_id: CorrelationId,
    /// Raw body bytes.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame from its parts.
    #[must_use]
    pub fn new(
        payload_type: PayloadType,
        correlation_id: CorrelationId,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            payload_type,
            correlation_id,
            body: body.into(),
        }
    }

    /// Create a frame whose body is a serialized struct.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn with_body<T: Serialize>(
        payload_type: PayloadType,
        correlation_id: CorrelationId,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            payload_type,
            correlation_id,
            codec::encode_body(body)?,
        ))
    }

    /// Create a new Message frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn message(
        id: CorrelationId,
        route: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, ProtocolError> {
        let body = MessageBody {
            route: route.into(),
            payload: payload.into(),
        };
        Self::with_body(PayloadType::Message, id, &body)
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: CorrelationId) -> Self {
        Self::new(PayloadType::Ack, id, Bytes::new())
    }

    /// Create a new Nack frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn nack(id: CorrelationId, message: impl Into<String>) -> Result<Self, ProtocolError> {
        let body = NackBody {
            message: message.into(),
        };
        Self::with_body(PayloadType::Nack, id, &body)
    }

    /// Create a new Subscribe frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn subscribe(
        id: CorrelationId,
        queue: impl Into<String>,
        concurrency: Option<u32>,
    ) -> Result<Self, ProtocolError> {
        let body = SubscribeBody {
            queue: queue.into(),
            concurrency,
        };
        Self::with_body(PayloadType::Subscribe, id, &body)
    }

    /// Create a new Unsubscribe frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn unsubscribe(id: CorrelationId, queue: impl Into<String>) -> Result<Self, ProtocolError> {
        let body = UnsubscribeBody {
            queue: queue.into(),
        };
        Self::with_body(PayloadType::Unsubscribe, id, &body)
    }

    /// Create a new QueueDeclare frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn queue_declare(
        id: CorrelationId,
        name: impl Into<String>,
        route: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let body = QueueDeclareBody {
            name: name.into(),
            route: route.into(),
        };
        Self::with_body(PayloadType::QueueDeclare, id, &body)
    }

    /// Create a new QueueDelete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be encoded.
    pub fn queue_delete(id: CorrelationId, name: impl Into<String>) -> Result<Self, ProtocolError> {
        let body = QueueDeleteBody { name: name.into() };
        Self::with_body(PayloadType::QueueDelete, id, &body)
    }

    /// Create a new Ready frame.
    #[must_use]
    pub fn ready(id: CorrelationId) -> Self {
        Self::new(PayloadType::Ready, id, Bytes::new())
    }

    /// Deserialize the body as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the body does not decode.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        codec::decode_body(self.payload_type, &self.body)
    }

    /// Number of bytes this frame occupies on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        codec::HEADER_SIZE + self.body.len()
    }
}

/// A frame whose body borrows from the receive buffer.
///
/// The view is only valid while the buffer it was read from is borrowed;
/// it cannot outlive the next write to that buffer. Call
/// [`FrameView::to_frame`] to keep the frame past that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameView<'a> {
    /// What the body contains.
    pub payload_type: PayloadType,
    /// Request/acknowledgment correlation.
    pub correlation_id: CorrelationId,
    /// Borrowed body bytes.
    pub body: &'a [u8],
}

impl FrameView<'_> {
    /// Copy the body out into an owned frame.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::new(
            self.payload_type,
            self.correlation_id,
            Bytes::copy_from_slice(self.body),
        )
    }

    /// Deserialize the body as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the body does not decode.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        codec::decode_body(self.payload_type, self.body)
    }
}
