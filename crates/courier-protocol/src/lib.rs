//! # courier-protocol
//!
//! Wire protocol definitions for the Courier message broker.
//!
//! Every unit on the wire is a length-prefixed frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────┬──────────────────┐
//! │ length (u32) │ payload type │ correlation id     │ body             │
//! │ big-endian   │ 1 byte       │ 16 bytes (u128 BE) │ length - 17      │
//! └──────────────┴──────────────┴────────────────────┴──────────────────┘
//! ```
//!
//! `length` counts everything after the length field itself. Bodies are
//! MessagePack-encoded structs whose shape depends on the payload type
//! (see [`frames`]).
//!
//! ## Payload Types
//!
//! - `Message` - Publish a message, or deliver one to a subscriber
//! - `Ack` / `Nack` - Positive and negative acknowledgments
//! - `Subscribe` / `Unsubscribe` - Queue consumption
//! - `QueueDeclare` / `QueueDelete` - Queue lifecycle
//! - `Ready` - Broker greeting and liveness probe
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, CorrelationId, Frame};
//!
//! let frame = Frame::message(CorrelationId::generate(), "orders/eu", b"hello".to_vec()).unwrap();
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded, codec::DEFAULT_MAX_BODY_SIZE).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, FrameHeader, ProtocolError, HEADER_SIZE};
pub use frames::{
    CorrelationId, Frame, FrameView, MessageBody, NackBody, PayloadType, QueueDeclareBody,
    QueueDeleteBody, SubscribeBody, UnsubscribeBody,
};
