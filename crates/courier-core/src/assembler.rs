//! Frame assembler for boundary-less byte streams.
//!
//! The assembler keeps inbound bytes in a single pooled buffer with a read
//! cursor and a write cursor:
//!
//! ```text
//! 0            read_pos          write_pos         capacity
//! │  consumed  │     unread      │      free       │
//! ```
//!
//! - When the consumed prefix reaches half the capacity the unread tail is
//!   shifted to offset 0.
//! - When a write does not fit, a larger buffer is rented, the unread tail is
//!   copied over and the old buffer goes back to the pool.
//!
//! Frames are only surfaced once every byte of them is buffered.

use courier_protocol::codec::{FrameHeader, HEADER_SIZE};
use courier_protocol::{Frame, FrameView, ProtocolError};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::pool::{BufferPool, PooledBuffer};

/// Accumulates stream bytes and yields complete frames in arrival order.
pub struct FrameAssembler {
    pool: Arc<BufferPool>,
    buffer: Option<PooledBuffer>,
    read_pos: usize,
    write_pos: usize,
    max_body_size: usize,
}

impl FrameAssembler {
    /// Create an assembler backed by `pool`.
    #[must_use]
    pub fn new(pool: Arc<BufferPool>, initial_capacity: usize, max_body_size: usize) -> Self {
        let buffer = pool.rent(initial_capacity.max(HEADER_SIZE));
        Self {
            pool,
            buffer: Some(buffer),
            read_pos: 0,
            write_pos: 0,
            max_body_size,
        }
    }

    fn buf(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }

    /// Number of unread bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Whether no unread bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the current backing buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf().len()
    }

    /// Append bytes from the stream.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        self.compact();

        if self.capacity() - self.write_pos < data.len() {
            self.grow(self.len() + data.len());
        }

        let end = self.write_pos + data.len();
        if let Some(buffer) = self.buffer.as_mut() {
            buffer[self.write_pos..end].copy_from_slice(data);
        }
        self.write_pos = end;
    }

    /// Shift the unread tail to the front once half the buffer is consumed.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
            return;
        }
        if self.read_pos >= self.capacity() / 2 {
            let (start, end) = (self.read_pos, self.write_pos);
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.copy_within(start..end, 0);
            }
            self.write_pos = end - start;
            self.read_pos = 0;
            trace!(unread = self.write_pos, "Compacted assembler buffer");
        }
    }

    /// Move the unread bytes into a buffer of at least `required` bytes.
    fn grow(&mut self, required: usize) {
        let target = required.max(self.capacity() * 2);
        let mut next = self.pool.rent(target);
        let unread = self.len();

        if let Some(old) = self.buffer.take() {
            next[..unread].copy_from_slice(&old[self.read_pos..self.write_pos]);
            if let Err(e) = self.pool.give_back(old) {
                warn!(error = %e, "Failed to return assembler buffer");
            }
        }

        trace!(capacity = next.capacity(), unread, "Grew assembler buffer");
        self.buffer = Some(next);
        self.read_pos = 0;
        self.write_pos = unread;
    }

    /// Whether at least `n` unread bytes are buffered.
    #[must_use]
    pub fn can_read(&self, n: usize) -> bool {
        self.len() >= n
    }

    fn check(&self, n: usize) -> Result<(), ProtocolError> {
        if self.can_read(n) {
            Ok(())
        } else {
            Err(ProtocolError::BufferUnderrun {
                requested: n,
                available: self.len(),
            })
        }
    }

    /// Peek at the next `n` unread bytes without consuming them.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferUnderrun`] if fewer than `n` bytes are
    /// buffered; callers are expected to check [`Self::can_read`] first.
    pub fn read(&self, n: usize) -> Result<&[u8], ProtocolError> {
        self.check(n)?;
        Ok(&self.buf()[self.read_pos..self.read_pos + n])
    }

    /// Consume the next `n` unread bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferUnderrun`] if fewer than `n` bytes are
    /// buffered.
    pub fn read_and_clear(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.check(n)?;
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.buf()[start..start + n])
    }

    /// Extract the next complete frame as a view into the buffer.
    ///
    /// Returns `Ok(None)` until the whole frame has arrived. Oversized and
    /// malformed headers are reported as soon as the header is buffered.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` or `Malformed` on a protocol violation.
    pub fn next_frame_view(&mut self) -> Result<Option<FrameView<'_>>, ProtocolError> {
        if !self.can_read(HEADER_SIZE) {
            return Ok(None);
        }

        let header = FrameHeader::decode(self.read(HEADER_SIZE)?, self.max_body_size)?;
        if !self.can_read(header.frame_len()) {
            return Ok(None);
        }

        let bytes = self.read_and_clear(header.frame_len())?;
        Ok(Some(FrameView {
            payload_type: header.payload_type,
            correlation_id: header.correlation_id,
            body: &bytes[HEADER_SIZE..],
        }))
    }

    /// Extract the next complete frame, copying its body out of the buffer.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` or `Malformed` on a protocol violation.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Ok(self.next_frame_view()?.map(|view| view.to_frame()))
    }

    /// Write `data` and drain every frame that is now complete.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` or `Malformed` on a protocol violation; frames
    /// decoded before the violation are discarded along with the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.write(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

impl Drop for FrameAssembler {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = self.pool.give_back(buffer) {
                warn!(error = %e, "Failed to return assembler buffer");
            }
        }
    }
}
