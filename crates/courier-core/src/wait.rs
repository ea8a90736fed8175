//! Cooperative wait primitives for polling loops.
//!
//! - [`Gate`] - open/blocked flag with a single waiter
//! - [`Backoff`] - exponential delay between retries

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Gate errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// Another task is already suspended on this gate.
    #[error("Gate already has a pending waiter")]
    ConcurrentWait,
}

/// A block/unblock gate for one cooperative waiter.
#[derive(Debug)]
pub struct Gate {
    open: AtomicBool,
    waiting: AtomicBool,
    notify: Notify,
}

impl Gate {
    /// Create a gate in the given state.
    #[must_use]
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            waiting: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Close the gate.
    pub fn block(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Open the gate and wake the waiter, if any.
    pub fn unblock(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Whether the gate is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Wait until the gate is open.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::ConcurrentWait`] if another task is already
    /// waiting.
    pub async fn wait(&self) -> Result<(), GateError> {
        if self.is_open() {
            return Ok(());
        }
        if self.waiting.swap(true, Ordering::AcqRel) {
            return Err(GateError::ConcurrentWait);
        }
        let _waiter = WaiterGuard(&self.waiting);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_open() {
                return Ok(());
            }
            notified.await;
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Clears the waiting flag even if the wait future is dropped.
struct WaiterGuard<'a>(&'a AtomicBool);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exponential backoff between retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u32,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `base`, multiplied by `factor` per step
    /// and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration, factor: u32) -> Self {
        Self {
            base,
            max,
            factor: factor.max(1),
            current: base.min(max),
        }
    }

    /// The delay to use now; advances the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    /// Sleep for the next delay.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    /// Start over from the base delay.
    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }

    /// The delay the next call to [`Self::next_delay`] returns.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }
}
