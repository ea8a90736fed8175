//! Broker configuration.

use crate::wait::Backoff;
use courier_protocol::codec::DEFAULT_MAX_BODY_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Largest accepted frame body in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Initial receive buffer size per connection.
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,

    /// Outstanding deliveries per connection when a subscribe gives none.
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    /// How long a delivery waits for its acknowledgment, in milliseconds.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// First retry delay when no subscriber is available, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Retry delay multiplier.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,

    /// Check pooled buffer returns. On in debug builds.
    #[serde(default = "default_pool_integrity_checks")]
    pub pool_integrity_checks: bool,

    /// Stored messages re-routed by one recovery pass.
    #[serde(default = "default_recovery_batch_limit")]
    pub recovery_batch_limit: usize,

    /// Broker event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_initial_buffer_size() -> usize {
    4 * 1024
}

fn default_max_concurrency() -> usize {
    16
}

fn default_ack_timeout_ms() -> u64 {
    60_000
}

fn default_backoff_base_ms() -> u64 {
    1
}

fn default_backoff_max_ms() -> u64 {
    100
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_pool_integrity_checks() -> bool {
    cfg!(debug_assertions)
}

fn default_recovery_batch_limit() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            initial_buffer_size: default_initial_buffer_size(),
            default_max_concurrency: default_max_concurrency(),
            ack_timeout_ms: default_ack_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_factor: default_backoff_factor(),
            pool_integrity_checks: default_pool_integrity_checks(),
            recovery_batch_limit: default_recovery_batch_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Acknowledgment deadline for deliveries.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// A fresh backoff for a delivery loop.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_factor,
        )
    }
}
