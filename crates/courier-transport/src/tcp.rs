//! TCP transport implementation.
//!
//! Frames travel over a plain TCP stream. The read half runs the
//! connection's receive loop; the write half sits behind a mutex as the
//! connection's sink.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{ConnectionId, ConnectionSink, SendError, SessionHandler};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::traits::{Transport, TransportError};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Size of the per-connection read buffer.
    pub read_buffer_size: usize,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Disable Nagle's algorithm on accepted streams.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            read_buffer_size: 8 * 1024,
            max_connections: 100_000,
            nodelay: true,
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
    permits: Arc<Semaphore>,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        info!("TCP transport listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
        })
    }

    /// Create a new TCP transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn serve(&self, handler: Arc<dyn SessionHandler>) -> Result<(), TransportError> {
        loop {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;

            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if self.config.nodelay {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
            }

            let handler = Arc::clone(&handler);
            let read_buffer_size = self.config.read_buffer_size;
            tokio::spawn(async move {
                handle_connection(stream, addr, handler, read_buffer_size).await;
                drop(permit);
            });
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Run one connection from accept to disconnect.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn SessionHandler>,
    read_buffer_size: usize,
) {
    let id = ConnectionId::generate();
    let (reader, writer) = stream.into_split();
    let sink = Arc::new(TcpSink::new(writer));

    debug!(connection = %id, "Accepted TCP connection from {}", addr);

    if let Err(e) = handler.on_connected(id.clone(), sink.clone()).await {
        warn!(connection = %id, error = %e, "Connection rejected");
        sink.close().await;
        return;
    }

    receive_loop(&id, reader, &sink, handler.as_ref(), read_buffer_size).await;

    sink.close().await;
    handler.on_disconnected(&id).await;
    debug!(connection = %id, "Connection closed");
}

async fn receive_loop(
    id: &ConnectionId,
    mut reader: OwnedReadHalf,
    sink: &TcpSink,
    handler: &dyn SessionHandler,
    read_buffer_size: usize,
) {
    let mut buf = vec![0u8; read_buffer_size.max(1)];
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            () = sink.closed() => return,
        };

        match read {
            Ok(0) => {
                debug!(connection = %id, "Peer closed the stream");
                return;
            }
            Ok(n) => {
                if let Err(e) = handler.on_data_received(id, &buf[..n]).await {
                    warn!(connection = %id, error = %e, "Dropping connection");
                    return;
                }
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "Read failed");
                return;
            }
        }
    }
}

/// The write half of a TCP connection.
pub struct TcpSink {
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    closing: Notify,
}

impl TcpSink {
    fn new(writer: OwnedWriteHalf) -> Self {
        Self {
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            closing: Notify::new(),
        }
    }

    /// Whether the sink still accepts writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Resolves once the sink is closed.
    async fn closed(&self) {
        loop {
            let notified = self.closing.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ConnectionSink for TcpSink {
    async fn send(&self, data: Bytes) -> Result<usize, SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&data)
            .await
            .map_err(|e| SendError::Failed(e.to_string()))?;
        Ok(data.len())
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return; // Already closed
        }
        self.closing.notify_waiters();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Failed to shut down write half: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::SessionError;
    use courier_protocol::{codec, CorrelationId, Frame};
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Connected(ConnectionId),
        Data(ConnectionId, Vec<u8>),
        Disconnected(ConnectionId),
    }

    /// Echoes every chunk back and reports lifecycle events.
    struct EchoHandler {
        events: mpsc::UnboundedSender<Event>,
        sinks: Mutex<Vec<(ConnectionId, Arc<dyn ConnectionSink>)>>,
        reject_data: bool,
    }

    #[async_trait]
    impl SessionHandler for EchoHandler {
        async fn on_connected(
            &self,
            id: ConnectionId,
            sink: Arc<dyn ConnectionSink>,
        ) -> Result<(), SessionError> {
            self.sinks.lock().await.push((id.clone(), sink));
            let _ = self.events.send(Event::Connected(id));
            Ok(())
        }

        async fn on_disconnected(&self, id: &ConnectionId) {
            let _ = self.events.send(Event::Disconnected(id.clone()));
        }

        async fn on_data_received(
            &self,
            id: &ConnectionId,
            data: &[u8],
        ) -> Result<(), SessionError> {
            if self.reject_data {
                return Err(SessionError::UnknownConnection(id.clone()));
            }
            let _ = self.events.send(Event::Data(id.clone(), data.to_vec()));
            let sinks = self.sinks.lock().await;
            if let Some((_, sink)) = sinks.iter().find(|(sid, _)| sid == id) {
                let _ = sink.send(Bytes::copy_from_slice(data)).await;
            }
            Ok(())
        }
    }

    async fn start(reject_data: bool) -> (SocketAddr, mpsc::UnboundedReceiver<Event>) {
        let transport = TcpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        assert_eq!(transport.name(), "tcp");

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(EchoHandler {
            events: tx,
            sinks: Mutex::new(Vec::new()),
            reject_data,
        });
        tokio::spawn(async move { transport.serve(handler).await });
        (addr, rx)
    }

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.bind_addr.port(), 7070);
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let (addr, mut events) = start(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let Some(Event::Connected(id)) = events.recv().await else {
            panic!("expected connect event");
        };

        let frame = codec::encode(&Frame::ack(CorrelationId(1))).unwrap();
        client.write_all(&frame).await.unwrap();

        let mut received = Vec::new();
        while received.len() < frame.len() {
            match events.recv().await.unwrap() {
                Event::Data(data_id, data) => {
                    assert_eq!(data_id, id);
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(received, frame.to_vec());

        let mut echoed = vec![0u8; frame.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, frame.to_vec());

        drop(client);
        assert_eq!(events.recv().await, Some(Event::Disconnected(id)));
    }

    #[tokio::test]
    async fn test_handler_error_closes_connection() {
        let (addr, mut events) = start(true).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let Some(Event::Connected(id)) = events.recv().await else {
            panic!("expected connect event");
        };

        client.write_all(b"garbage").await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Disconnected(id)));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
