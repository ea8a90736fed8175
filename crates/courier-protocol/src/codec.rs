//! Codec for encoding and decoding Courier frames.
//!
//! Frames use a fixed 21-byte header followed by the body. Structured bodies
//! are MessagePack with named fields.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::frames::{CorrelationId, Frame, PayloadType};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Payload type tag size in bytes.
pub const PAYLOAD_TYPE_SIZE: usize = 1;

/// Correlation id size in bytes.
pub const CORRELATION_ID_SIZE: usize = 16;

/// Full header size: length prefix, payload type and correlation id.
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + PAYLOAD_TYPE_SIZE + CORRELATION_ID_SIZE;

/// Smallest legal value of the length field (a frame with an empty body).
pub const MIN_FRAME_LENGTH: usize = PAYLOAD_TYPE_SIZE + CORRELATION_ID_SIZE;

/// Default maximum body size (4 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame body exceeds the configured maximum.
    #[error("Frame body size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The bytes do not form a valid frame.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// A read asked for more bytes than are buffered.
    #[error("Buffer underrun: requested {requested} bytes, {available} available")]
    BufferUnderrun { requested: usize, available: usize },

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl ProtocolError {
    /// Whether the peer violated the protocol (as opposed to a local misuse).
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::Malformed(_)
        )
    }
}

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes following the length field.
    pub length: u32,
    /// Payload type tag.
    pub payload_type: PayloadType,
    /// Correlation id.
    pub correlation_id: CorrelationId,
}

impl FrameHeader {
    /// Body size implied by the length field.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.length as usize - MIN_FRAME_LENGTH
    }

    /// Total frame size including the length prefix.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.length as usize
    }

    /// Write the header into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
        buf.put_u8(self.payload_type.into());
        buf.put_slice(&self.correlation_id.to_bytes());
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns `Incomplete` if fewer than [`HEADER_SIZE`] bytes are given,
    /// `Malformed` for an impossible length or unknown payload type, and
    /// `FrameTooLarge` if the body would exceed `max_body_size`.
    pub fn decode(data: &[u8], max_body_size: usize) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Incomplete(HEADER_SIZE - data.len()));
        }

        let length = check_length(read_length(data), max_body_size)?;

        let payload_type = PayloadType::try_from(data[LENGTH_PREFIX_SIZE]).map_err(|_| {
            ProtocolError::Malformed(format!(
                "unknown payload type 0x{:02x}",
                data[LENGTH_PREFIX_SIZE]
            ))
        })?;

        let mut id = [0u8; CORRELATION_ID_SIZE];
        id.copy_from_slice(&data[LENGTH_PREFIX_SIZE + PAYLOAD_TYPE_SIZE..HEADER_SIZE]);

        Ok(Self {
            length,
            payload_type,
            correlation_id: CorrelationId::from_bytes(id),
        })
    }
}

/// Read the big-endian length prefix. `data` must hold at least 4 bytes.
#[must_use]
pub fn read_length(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Validate a length field against the protocol minimum and `max_body_size`.
///
/// # Errors
///
/// Returns `Malformed` if the length cannot hold a header, `FrameTooLarge`
/// if the implied body exceeds `max_body_size`.
pub fn check_length(length: u32, max_body_size: usize) -> Result<u32, ProtocolError> {
    let length_usize = length as usize;
    if length_usize < MIN_FRAME_LENGTH {
        return Err(ProtocolError::Malformed(format!(
            "declared length {} is shorter than the {} byte header",
            length, MIN_FRAME_LENGTH
        )));
    }
    let body = length_usize - MIN_FRAME_LENGTH;
    if body > max_body_size {
        return Err(ProtocolError::FrameTooLarge {
            size: body,
            max: max_body_size,
        });
    }
    Ok(length)
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the body does not fit in the 32-bit length field.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the body does not fit in the 32-bit length field.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let length = u32::try_from(MIN_FRAME_LENGTH + frame.body.len()).map_err(|_| {
        ProtocolError::FrameTooLarge {
            size: frame.body.len(),
            max: u32::MAX as usize - MIN_FRAME_LENGTH,
        }
    })?;

    buf.reserve(frame.encoded_len());
    FrameHeader {
        length,
        payload_type: frame.payload_type,
        correlation_id: frame.correlation_id,
    }
    .encode_into(buf);
    buf.extend_from_slice(&frame.body);

    Ok(())
}

/// Decode one complete frame from the start of `data`.
///
/// # Errors
///
/// Returns `Incomplete` if `data` is shorter than the declared frame, or a
/// protocol error if the header is invalid.
pub fn decode(data: &[u8], max_body_size: usize) -> Result<Frame, ProtocolError> {
    let header = FrameHeader::decode(data, max_body_size)?;

    let total_size = header.frame_len();
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(Frame::new(
        header.payload_type,
        header.correlation_id,
        Bytes::copy_from_slice(&data[HEADER_SIZE..total_size]),
    ))
}

/// Serialize a structured body.
///
/// # Errors
///
/// Returns an error if MessagePack encoding fails.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(body)?))
}

/// Deserialize a structured body of the given payload type.
///
/// # Errors
///
/// Returns `Malformed` if the bytes do not decode as `T`.
pub fn decode_body<T: DeserializeOwned>(
    payload_type: PayloadType,
    body: &[u8],
) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(body)
        .map_err(|e| ProtocolError::Malformed(format!("{:?} body: {}", payload_type, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let id = CorrelationId(42);
        let frames = vec![
            Frame::message(id, "bar/foo", b"Hello, world!".to_vec()).unwrap(),
            Frame::ack(id),
            Frame::nack(id, "queue not found").unwrap(),
            Frame::subscribe(id, "jobs", Some(4)).unwrap(),
            Frame::unsubscribe(id, "jobs").unwrap(),
            Frame::queue_declare(id, "jobs", "jobs/*").unwrap(),
            Frame::queue_delete(id, "jobs").unwrap(),
            Frame::ready(id),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            assert_eq!(encoded.len(), frame.encoded_len());
            let decoded = decode(&encoded, DEFAULT_MAX_BODY_SIZE).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(PayloadType::Nack, CorrelationId(1), vec![0xAA, 0xBB]);
        let encoded = encode(&frame).unwrap();

        assert_eq!(read_length(&encoded), (MIN_FRAME_LENGTH + 2) as u32);
        assert_eq!(encoded[4], 0x03);
        assert_eq!(encoded[20], 0x01);
        assert_eq!(&encoded[HEADER_SIZE..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::message(CorrelationId(1), "a", b"payload".to_vec()).unwrap();
        let encoded = encode(&frame).unwrap();

        match decode(&encoded[..5], DEFAULT_MAX_BODY_SIZE) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
        match decode(&encoded[..encoded.len() - 1], DEFAULT_MAX_BODY_SIZE) {
            Err(ProtocolError::Incomplete(1)) => {}
            other => panic!("Expected Incomplete(1) error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::new(PayloadType::Message, CorrelationId(1), vec![0u8; 101]);
        let encoded = encode(&frame).unwrap();

        match decode(&encoded, 100) {
            Err(ProtocolError::FrameTooLarge { size: 101, max: 100 }) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_short_length_is_malformed() {
        let mut data = vec![0u8; HEADER_SIZE];
        data[..4].copy_from_slice(&3u32.to_be_bytes());
        let err = FrameHeader::decode(&data, DEFAULT_MAX_BODY_SIZE).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_unknown_payload_type() {
        let mut buf = BytesMut::new();
        encode_into(&Frame::ack(CorrelationId(5)), &mut buf).unwrap();
        buf[4] = 0x7F;

        match decode(&buf, DEFAULT_MAX_BODY_SIZE) {
            Err(ProtocolError::Malformed(msg)) => assert!(msg.contains("0x7f")),
            other => panic!("Expected Malformed error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::new();
        encode_into(&Frame::ack(CorrelationId(1)), &mut buf).unwrap();
        encode_into(&Frame::ready(CorrelationId(2)), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE * 2);

        let second = decode(&buf[HEADER_SIZE..], DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(second.payload_type, PayloadType::Ready);
        assert_eq!(second.correlation_id, CorrelationId(2));
    }
}
