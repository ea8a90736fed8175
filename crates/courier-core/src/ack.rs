//! Acknowledgment tracking for sent frames.
//!
//! Every tracked send registers a pending completion keyed by correlation id.
//! Whichever of remote ok, remote error, local send success, local send
//! failure, deadline or cancellation happens first resolves it; later calls
//! see [`Resolution::AlreadyCompleted`].

use courier_protocol::CorrelationId;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Deadline applied when the caller does not give one.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a tracked send did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The peer answered with an error.
    #[error("Rejected by peer: {0}")]
    Rejected(String),

    /// The transport failed to send the frame.
    #[error("Send failed")]
    SendFailed,

    /// No answer before the deadline.
    #[error("Acknowledgment timed out")]
    Timeout,

    /// The wait was cancelled.
    #[error("Cancelled")]
    Cancelled,
}

/// Final outcome of a tracked send.
pub type DeliveryResult = Result<(), DeliveryError>;

/// What a resolution call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call resolved the completion.
    Completed,
    /// The completion waits for the remote acknowledgment instead.
    Deferred,
    /// Nothing pending under this id; the call was a no-op.
    AlreadyCompleted,
}

struct PendingCompletion {
    complete_on_acknowledge: bool,
    generation: u64,
    sender: oneshot::Sender<DeliveryResult>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCompletion {
    fn finish(self, result: DeliveryResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.sender.send(result);
    }
}

type PendingMap = DashMap<CorrelationId, PendingCompletion>;

/// Converts send/acknowledge exchanges into single completion events.
pub struct AckTracker {
    pending: Arc<PendingMap>,
    generation: AtomicU64,
    default_timeout: Duration,
}

impl AckTracker {
    /// Create a tracker with the default one-minute deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_ACK_TIMEOUT)
    }

    /// Create a tracker with a custom default deadline.
    #[must_use]
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            default_timeout,
        }
    }

    /// Register a pending completion for `id`.
    ///
    /// With `complete_on_acknowledge` false the completion resolves on local
    /// send success; otherwise it waits for the peer's ok or error. The
    /// deadline falls back to the tracker default. A completion already
    /// pending under the same id is resolved as cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn setup(
        &self,
        id: CorrelationId,
        complete_on_acknowledge: bool,
        deadline: Option<Duration>,
    ) -> Completion {
        let (sender, receiver) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let replaced = self.pending.insert(
            id,
            PendingCompletion {
                complete_on_acknowledge,
                generation,
                sender,
                timer: None,
            },
        );
        if let Some(previous) = replaced {
            debug!(correlation = %id, "Replacing pending completion");
            previous.finish(Err(DeliveryError::Cancelled));
        }

        let timer = spawn_deadline(
            Arc::downgrade(&self.pending),
            id,
            generation,
            deadline.unwrap_or(self.default_timeout),
        );
        match self.pending.get_mut(&id) {
            Some(mut entry) if entry.generation == generation => entry.timer = Some(timer),
            _ => timer.abort(),
        }

        trace!(correlation = %id, complete_on_acknowledge, "Completion registered");
        Completion { id, receiver }
    }

    /// The peer acknowledged `id`.
    pub fn on_payload_ok_result(&self, id: &CorrelationId) -> Resolution {
        self.resolve(id, Ok(()))
    }

    /// The peer rejected `id` with an error message.
    pub fn on_payload_error_result(
        &self,
        id: &CorrelationId,
        error: impl Into<String>,
    ) -> Resolution {
        self.resolve(id, Err(DeliveryError::Rejected(error.into())))
    }

    /// The frame for `id` was written locally.
    ///
    /// Completes only completions registered without
    /// `complete_on_acknowledge`; the others stay pending.
    pub fn on_payload_send_success(&self, id: &CorrelationId) -> Resolution {
        match self
            .pending
            .remove_if(id, |_, entry| !entry.complete_on_acknowledge)
        {
            Some((_, entry)) => {
                entry.finish(Ok(()));
                Resolution::Completed
            }
            None if self.pending.contains_key(id) => Resolution::Deferred,
            None => Resolution::AlreadyCompleted,
        }
    }

    /// The frame for `id` could not be written.
    pub fn on_payload_send_failed(&self, id: &CorrelationId) -> Resolution {
        self.resolve(id, Err(DeliveryError::SendFailed))
    }

    /// Cancel the wait for `id`.
    pub fn cancel(&self, id: &CorrelationId) -> Resolution {
        self.resolve(id, Err(DeliveryError::Cancelled))
    }

    /// Cancel every pending completion.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.iter()
            .filter(|id| self.cancel(id) == Resolution::Completed)
            .count()
    }

    /// Number of unresolved completions.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether `id` is still unresolved.
    #[must_use]
    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    fn resolve(&self, id: &CorrelationId, result: DeliveryResult) -> Resolution {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                trace!(correlation = %id, ?result, "Completion resolved");
                entry.finish(result);
                Resolution::Completed
            }
            None => Resolution::AlreadyCompleted,
        }
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckTracker")
            .field("pending", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn spawn_deadline(
    pending: Weak<PendingMap>,
    id: CorrelationId,
    generation: u64,
    deadline: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let Some(pending) = pending.upgrade() else {
            return;
        };
        if let Some((_, mut entry)) =
            pending.remove_if(&id, |_, entry| entry.generation == generation)
        {
            debug!(correlation = %id, ?deadline, "Completion timed out");
            // This task is the timer; nothing to abort.
            entry.timer = None;
            entry.finish(Err(DeliveryError::Timeout));
        }
    })
}

/// Resolves once the tracked send has an outcome.
///
/// If the tracker goes away first, resolves as [`DeliveryError::Cancelled`].
#[derive(Debug)]
pub struct Completion {
    id: CorrelationId,
    receiver: oneshot::Receiver<DeliveryResult>,
}

impl Completion {
    /// The tracked correlation id.
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// The outcome, if already known.
    pub fn try_result(&mut self) -> Option<DeliveryResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DeliveryError::Cancelled)),
        }
    }
}

impl Future for Completion {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DeliveryError::Cancelled)))
    }
}
