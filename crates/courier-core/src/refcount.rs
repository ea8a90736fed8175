//! Outstanding-acknowledgment counts for fanned-out messages.

use crate::message::MessageId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Tracks how many matched queues still owe an acknowledgment per message.
#[derive(Debug, Default)]
pub struct RefCounter {
    counts: DashMap<MessageId, Arc<AtomicUsize>>,
}

impl RefCounter {
    /// Create an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outstanding count for a message, replacing any previous one.
    ///
    /// A count of zero leaves nothing to release and removes the entry.
    pub fn set_up_ref_counter(&self, id: MessageId, count: usize) {
        if count == 0 {
            self.counts.remove(&id);
            return;
        }
        self.counts.insert(id, Arc::new(AtomicUsize::new(count)));
        trace!(message = %id, count, "Reference count set");
    }

    /// Release one reference.
    ///
    /// Returns `true` exactly once, when the last reference is released; the
    /// entry is gone afterwards. Unknown ids return `false`.
    pub fn release_one(&self, id: &MessageId) -> bool {
        let Some(counter) = self.counts.get(id).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };

        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current > 1 {
            return false;
        }

        // A concurrent set_up_ref_counter may have replaced the entry.
        self.counts
            .remove_if(id, |_, entry| Arc::ptr_eq(entry, &counter))
            .is_some()
    }

    /// References still outstanding for a message.
    #[must_use]
    pub fn outstanding(&self, id: &MessageId) -> Option<usize> {
        self.counts
            .get(id)
            .map(|entry| entry.value().load(Ordering::Acquire))
    }

    /// Number of messages with outstanding references.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no message has outstanding references.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
