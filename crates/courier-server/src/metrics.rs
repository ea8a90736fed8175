//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use courier_core::BrokerEvent;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const FRAMES_BYTES: &str = "courier_frames_bytes";
    pub const MESSAGES_STORED: &str = "courier_messages_stored_total";
    pub const MESSAGES_DELIVERED: &str = "courier_messages_delivered_total";
    pub const MESSAGES_RETIRED: &str = "courier_messages_retired_total";
    pub const DELIVERY_FAILURES: &str = "courier_delivery_failures_total";
    pub const FAN_OUT: &str = "courier_fan_out_queues";
    pub const QUEUES_ACTIVE: &str = "courier_queues_active";
    pub const LATENCY_SECONDS: &str = "courier_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_BYTES, "Bytes read from and written to connections");
    metrics::describe_counter!(names::MESSAGES_STORED, "Messages accepted from publishers");
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED,
        "Deliveries acknowledged by subscribers"
    );
    metrics::describe_counter!(
        names::MESSAGES_RETIRED,
        "Messages acknowledged by every matched queue"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES,
        "Deliveries rejected, timed out or not sent"
    );
    metrics::describe_histogram!(names::FAN_OUT, "Matched queues per published message");
    metrics::describe_gauge!(names::QUEUES_ACTIVE, "Current number of declared queues");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound data handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record bytes moved over a connection.
pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the declared queue count.
pub fn set_active_queues(count: usize) {
    gauge!(names::QUEUES_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Record a broker event.
///
/// Connection lifecycle is counted at the transport boundary instead.
pub fn record_event(event: &BrokerEvent) {
    match event {
        BrokerEvent::Connected { .. } | BrokerEvent::Disconnected { .. } => {}
        BrokerEvent::MessageStored { matches, .. } => {
            counter!(names::MESSAGES_STORED).increment(1);
            histogram!(names::FAN_OUT).record(*matches as f64);
        }
        BrokerEvent::MessageDelivered { queue, .. } => {
            counter!(names::MESSAGES_DELIVERED, "queue" => queue.clone()).increment(1);
        }
        BrokerEvent::MessageRetired { .. } => {
            counter!(names::MESSAGES_RETIRED).increment(1);
        }
        BrokerEvent::DeliveryFailed { queue, .. } => {
            counter!(names::DELIVERY_FAILURES, "queue" => queue.clone()).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ConnectionId, MessageId};

    #[test]
    fn test_record_events_without_recorder() {
        // No recorder installed: recording must be a no-op.
        let id = MessageId::from(1u128);
        for event in [
            BrokerEvent::Connected {
                connection: ConnectionId::from("c1"),
            },
            BrokerEvent::MessageStored { id, matches: 2 },
            BrokerEvent::MessageDelivered {
                id,
                queue: "orders".into(),
                connection: ConnectionId::from("c1"),
            },
            BrokerEvent::MessageRetired { id },
            BrokerEvent::DeliveryFailed {
                id,
                queue: "orders".into(),
                reason: "timeout".into(),
            },
        ] {
            record_event(&event);
        }
        record_bytes(21, "inbound");
        record_error("protocol");
    }
}
