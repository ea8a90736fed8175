//! Server wiring for Courier.
//!
//! Builds the broker from configuration, hosts it on the TCP transport and
//! serves the admin HTTP endpoints.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use bytes::Bytes;
use courier_core::{
    Broker, BrokerContext, ConnectionId, ConnectionSink, SendError, SessionError, SessionHandler,
};
use courier_transport::{TcpConfig, TcpTransport, Transport};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shared admin state.
pub struct AppState {
    /// The broker.
    pub broker: Broker,
    /// When the server started.
    pub started: Instant,
}

/// Run the broker server until the listener fails or Ctrl-C.
///
/// The broker uses the process-local [`courier_core::InMemoryStore`], so the
/// startup `recover()` finds nothing. A durable store plugs in through
/// [`BrokerContext::new`] when embedding the broker.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let broker = Broker::new(BrokerContext::in_memory(config.broker.clone()));

    for queue in &config.queues {
        broker
            .declare_queue(&queue.name, &queue.route)
            .with_context(|| format!("Failed to declare queue {}", queue.name))?;
    }
    let report = broker.recover().await.context("Recovery failed")?;
    info!(
        queues = config.queues.len(),
        recovered = report.recovered,
        "Broker ready"
    );

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    tokio::spawn(forward_events(broker.clone()));

    if config.admin.enabled {
        let addr = config.admin_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint {addr}"))?;
        let state = Arc::new(AppState {
            broker: broker.clone(),
            started: Instant::now(),
        });
        info!("Admin endpoints listening on http://{}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, admin_router(state)).await {
                error!("Admin server failed: {}", e);
            }
        });
    }

    let transport = TcpTransport::new(TcpConfig {
        bind_addr: config.bind_addr()?,
        read_buffer_size: config.transport.read_buffer_size,
        max_connections: config.transport.max_connections,
        nodelay: config.transport.nodelay,
    })
    .await?;
    info!("Courier listening on {}", transport.local_addr()?);

    let handler: Arc<dyn SessionHandler> = Arc::new(MeteredHandler::new(broker.clone()));
    tokio::select! {
        served = transport.serve(handler) => served?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    broker.shutdown().await;
    Ok(())
}

/// Build the admin router.
pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

/// Broker statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    metrics::set_active_queues(stats.queues.len());
    axum::Json(stats)
}

/// Turn broker events into metrics.
async fn forward_events(broker: Broker) {
    let mut events = broker.subscribe_events();
    drop(broker);

    loop {
        match events.recv().await {
            Ok(event) => {
                debug!(kind = event.kind(), "Broker event");
                metrics::record_event(&event);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Session handler that records connection metrics around the broker.
pub struct MeteredHandler {
    broker: Broker,
}

impl MeteredHandler {
    /// Wrap a broker.
    #[must_use]
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl SessionHandler for MeteredHandler {
    async fn on_connected(
        &self,
        id: ConnectionId,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<(), SessionError> {
        let sink: Arc<dyn ConnectionSink> = Arc::new(MeteredSink { inner: sink });
        self.broker.on_connected(id, sink).await?;
        metrics::record_connection();
        Ok(())
    }

    async fn on_disconnected(&self, id: &ConnectionId) {
        self.broker.on_disconnected(id).await;
        metrics::record_disconnection();
    }

    async fn on_data_received(&self, id: &ConnectionId, data: &[u8]) -> Result<(), SessionError> {
        let start = Instant::now();
        metrics::record_bytes(data.len(), "inbound");

        let result = self.broker.on_data_received(id, data).await;
        metrics::record_latency(start.elapsed().as_secs_f64());
        if let Err(SessionError::Protocol(_)) = &result {
            metrics::record_error("protocol");
        }
        result
    }
}

/// Counts outbound bytes.
struct MeteredSink {
    inner: Arc<dyn ConnectionSink>,
}

#[async_trait]
impl ConnectionSink for MeteredSink {
    async fn send(&self, data: Bytes) -> Result<usize, SendError> {
        let sent = self.inner.send(data).await?;
        metrics::record_bytes(sent, "outbound");
        Ok(sent)
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::Response;
    use courier_core::BrokerConfig;

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            broker: Broker::in_memory(BrokerConfig::default()),
            started: Instant::now(),
        })
    }

    async fn json_body(response: Response) -> serde_json::Value {
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = health_handler(State(state())).await.into_response();
        let health = json_body(response).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_stats() {
        let state = state();
        state.broker.declare_queue("orders", "orders/*").unwrap();

        let response = stats_handler(State(state)).await.into_response();
        let stats = json_body(response).await;
        assert_eq!(stats["sessions"], 0);
        assert_eq!(stats["queues"][0]["name"], "orders");
        assert_eq!(stats["queues"][0]["pattern"], "orders/*");
    }
}
