//! Named queues bound to a route pattern.
//!
//! A queue holds the ids of messages waiting for delivery, the dispatcher of
//! connections consuming from it, and the gate its delivery worker parks on.

use crate::dispatcher::Dispatcher;
use crate::message::MessageId;
use crate::route::RoutePattern;
use crate::wait::Gate;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Maximum queue name length.
pub const MAX_QUEUE_NAME_LENGTH: usize = 256;

/// Validate a queue name.
///
/// # Errors
///
/// Returns an error message if the queue name is invalid.
pub fn validate_queue_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Queue name cannot be empty");
    }
    if name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err("Queue name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Queue name contains invalid characters");
    }
    Ok(())
}

/// A delivery queue.
#[derive(Debug)]
pub struct Queue {
    name: String,
    pattern: RoutePattern,
    pending: Mutex<Pending>,
    dispatcher: Dispatcher,
    gate: Gate,
}

#[derive(Debug, Default)]
struct Pending {
    ids: VecDeque<MessageId>,
    closed: bool,
}

impl Queue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(name: impl Into<String>, pattern: RoutePattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            pending: Mutex::new(Pending::default()),
            dispatcher: Dispatcher::new(),
            gate: Gate::new(false),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route pattern.
    #[must_use]
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    /// Whether messages published on `route` belong in this queue.
    #[must_use]
    pub fn matches(&self, route: &str) -> bool {
        self.pattern.matches(route)
    }

    /// Connections consuming from this queue.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The gate the delivery worker waits on.
    #[must_use]
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Append a message for delivery and wake the worker.
    ///
    /// Returns `false` without queueing if the queue is closed; the caller
    /// still owns the message's reference.
    #[must_use]
    pub fn enqueue(&self, id: MessageId) -> bool {
        {
            let mut pending = self.lock();
            if pending.closed {
                return false;
            }
            pending.ids.push_back(id);
        }
        trace!(queue = %self.name, message = %id, "Message enqueued");
        self.gate.unblock();
        true
    }

    /// Put a message back at the head of the queue and wake the worker.
    ///
    /// Returns `false` without queueing if the queue is closed.
    #[must_use]
    pub fn requeue(&self, id: MessageId) -> bool {
        {
            let mut pending = self.lock();
            if pending.closed {
                return false;
            }
            pending.ids.push_front(id);
        }
        trace!(queue = %self.name, message = %id, "Message requeued");
        self.gate.unblock();
        true
    }

    /// Take the next message.
    pub fn pop(&self) -> Option<MessageId> {
        self.lock().ids.pop_front()
    }

    /// Number of messages waiting.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().ids.len()
    }

    /// Whether any message is waiting.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.lock().ids.is_empty()
    }

    /// Remove every waiting message.
    pub fn drain(&self) -> Vec<MessageId> {
        self.lock().ids.drain(..).collect()
    }

    /// Mark the queue closed and wake the worker so it can exit.
    ///
    /// Once closed, `enqueue` and `requeue` refuse new ids.
    pub fn close(&self) {
        self.lock().closed = true;
        self.gate.unblock();
    }

    /// Whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
