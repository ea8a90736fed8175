//! Shared fixtures for the Courier benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{Broker, ConnectionId, ConnectionSink, SendError, SessionHandler};
use courier_protocol::{codec, Frame};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A sink that hands every outbound frame to a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send(&self, data: Bytes) -> Result<usize, SendError> {
        let len = data.len();
        self.tx.send(data).map_err(|_| SendError::Closed)?;
        Ok(len)
    }

    async fn close(&self) {}
}

/// An in-process connection to a broker.
pub struct BenchClient {
    /// Connection id.
    pub id: ConnectionId,
    /// Frames the broker sent, one per send.
    pub rx: mpsc::UnboundedReceiver<Bytes>,
}

impl BenchClient {
    /// Register a new connection and swallow its Ready frame.
    ///
    /// # Panics
    ///
    /// Panics if the broker rejects the connection.
    pub async fn connect(broker: &Broker, id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(id);
        broker
            .on_connected(id.clone(), Arc::new(ChannelSink { tx }))
            .await
            .expect("connect");

        let mut client = Self { id, rx };
        client.recv().await;
        client
    }

    /// Encode and feed a frame to the broker.
    ///
    /// # Panics
    ///
    /// Panics if the frame does not encode or the broker drops it.
    pub async fn send(&self, broker: &Broker, frame: &Frame) {
        let bytes = codec::encode(frame).expect("encode");
        broker
            .on_data_received(&self.id, &bytes)
            .await
            .expect("send");
    }

    /// Next frame from the broker.
    ///
    /// # Panics
    ///
    /// Panics if the broker hung up.
    pub async fn recv(&mut self) -> Frame {
        let bytes = self.rx.recv().await.expect("broker closed");
        codec::decode(&bytes, codec::DEFAULT_MAX_BODY_SIZE).expect("decode")
    }
}

/// A payload of `size` bytes.
#[must_use]
pub fn payload(size: usize) -> Vec<u8> {
    vec![0xAB; size]
}
