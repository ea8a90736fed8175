//! The delivery engine.
//!
//! The broker owns the queues, the per-connection sessions, the
//! acknowledgment tracker and the fan-out reference counter. Transports
//! drive it through [`SessionHandler`].
//!
//! Each queue runs one worker task. The worker pops the next message id,
//! reserves a slot on an available subscriber and spawns a delivery task that
//! sends the message and waits for its acknowledgment. Acknowledged and
//! rejected deliveries release one fan-out reference; the last release
//! deletes the message from the store. Timed-out and failed deliveries go
//! back to the head of their queue.

use crate::ack::{AckTracker, DeliveryError, Resolution};
use crate::assembler::FrameAssembler;
use crate::client::{Client, ConnectionId, ConnectionSink};
use crate::config::BrokerConfig;
use crate::dispatcher::DispatchError;
use crate::events::BrokerEvent;
use crate::message::{MessageId, StoredMessage};
use crate::pool::BufferPool;
use crate::queue::{validate_queue_name, Queue};
use crate::refcount::RefCounter;
use crate::route::RoutePattern;
use crate::session::{Session, SessionError, SessionHandler};
use crate::store::{InMemoryStore, MessageStore, StoreError};
use async_trait::async_trait;
use courier_protocol::codec::HEADER_SIZE;
use courier_protocol::{
    CorrelationId, Frame, MessageBody, NackBody, PayloadType, QueueDeclareBody, QueueDeleteBody,
    SubscribeBody, UnsubscribeBody,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Broker errors. Reported to the requesting peer as a `Nack`.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid queue name or route pattern.
    #[error("Invalid queue: {0}")]
    InvalidQueue(&'static str),

    /// The queue exists with a different route pattern.
    #[error("Queue {name} already declared with route {pattern}")]
    QueueConflict { name: String, pattern: String },

    /// Queue not found.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Not subscribed to queue.
    #[error("Not subscribed to queue: {0}")]
    NotSubscribed(String),

    /// No declared queue matches the published route.
    #[error("No queue matches route: {0}")]
    NoMatchingQueue(String),

    /// No session is registered under this id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Dispatcher rejected the registration.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Message store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared resources, built once at startup.
pub struct BrokerContext {
    /// Engine settings.
    pub config: BrokerConfig,
    /// Receive buffers for frame assembly.
    pub buffers: Arc<BufferPool>,
    /// Where messages live until fully acknowledged.
    pub store: Arc<dyn MessageStore>,
}

impl BrokerContext {
    /// Build a context around a store.
    #[must_use]
    pub fn new(config: BrokerConfig, store: Arc<dyn MessageStore>) -> Self {
        let buffers = Arc::new(BufferPool::new(
            config.initial_buffer_size,
            config.max_body_size.saturating_add(HEADER_SIZE),
            config.pool_integrity_checks,
        ));
        Self {
            config,
            buffers,
            store,
        }
    }

    /// Build a context with a process-local store.
    #[must_use]
    pub fn in_memory(config: BrokerConfig) -> Self {
        Self::new(config, Arc::new(InMemoryStore::new()))
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Messages routed to at least one queue.
    pub recovered: usize,
    /// Messages no declared queue matches; left in the store.
    pub unroutable: usize,
    /// Messages already in flight in this process.
    pub skipped: usize,
}

/// Per-queue statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Queue name.
    pub name: String,
    /// Route pattern.
    pub pattern: String,
    /// Messages waiting for delivery.
    pub pending: usize,
    /// Subscribed connections.
    pub subscribers: usize,
}

/// Broker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Declared queues.
    pub queues: Vec<QueueStats>,
    /// Connected sessions.
    pub sessions: usize,
    /// Sends awaiting an outcome.
    pub pending_acks: usize,
    /// Messages with unacknowledged fan-out references.
    pub outstanding_messages: usize,
}

struct Inner {
    context: BrokerContext,
    queues: DashMap<String, Arc<Queue>>,
    sessions: DashMap<ConnectionId, Arc<Session>>,
    acks: AckTracker,
    refs: RefCounter,
    events: broadcast::Sender<BrokerEvent>,
    shutting_down: AtomicBool,
}

/// The message broker.
///
/// Cheap to clone; clones share state. Must be used from within a Tokio
/// runtime.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

enum Step {
    Delivered,
    Idle,
    Saturated,
}

impl Broker {
    /// Create a broker from a context.
    #[must_use]
    pub fn new(context: BrokerContext) -> Self {
        info!("Creating broker with config: {:?}", context.config);
        let (events, _) = broadcast::channel(context.config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                acks: AckTracker::with_timeout(context.config.ack_timeout()),
                context,
                queues: DashMap::new(),
                sessions: DashMap::new(),
                refs: RefCounter::new(),
                events,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Create a broker with an in-memory store.
    #[must_use]
    pub fn in_memory(config: BrokerConfig) -> Self {
        Self::new(BrokerContext::in_memory(config))
    }

    /// Shared resources.
    #[must_use]
    pub fn context(&self) -> &BrokerContext {
        &self.inner.context
    }

    /// Receive broker events from now on.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Declare a queue bound to a route pattern.
    ///
    /// Redeclaring with the same pattern returns the existing queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or pattern is invalid, or the queue
    /// exists with a different pattern.
    pub fn declare_queue(&self, name: &str, pattern: &str) -> Result<Arc<Queue>, BrokerError> {
        validate_queue_name(name).map_err(BrokerError::InvalidQueue)?;
        let pattern = RoutePattern::parse(pattern)
            .ok_or(BrokerError::InvalidQueue("Route pattern cannot be empty"))?;

        match self.inner.queues.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let queue = existing.get();
                if queue.pattern() == &pattern {
                    Ok(Arc::clone(queue))
                } else {
                    Err(BrokerError::QueueConflict {
                        name: name.to_string(),
                        pattern: queue.pattern().to_string(),
                    })
                }
            }
            Entry::Vacant(slot) => {
                let queue = Arc::new(Queue::new(name, pattern));
                tokio::spawn(run_queue_worker(
                    Arc::downgrade(&self.inner),
                    Arc::clone(&queue),
                ));
                info!(queue = %name, pattern = %queue.pattern(), "Queue declared");
                slot.insert(Arc::clone(&queue));
                Ok(queue)
            }
        }
    }

    /// Delete a queue.
    ///
    /// Its worker stops, subscribers are detached and every message still
    /// waiting in it gives up its reference.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueNotFound`] for an unknown queue.
    pub async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let (_, queue) = self
            .inner
            .queues
            .remove(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;

        queue.close();
        queue.dispatcher().clear();
        for session in self.inner.sessions.iter() {
            session.remove_subscription(name);
        }

        let drained = queue.drain();
        for id in &drained {
            self.inner.release_reference(id).await;
        }

        info!(queue = %name, released = drained.len(), "Queue deleted");
        Ok(())
    }

    /// Look up a queue.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.inner.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    /// Start delivering a queue's messages to a connection.
    ///
    /// `concurrency` replaces the connection's ceiling on outstanding
    /// deliveries, shared across all its queues.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown connection or queue, or if the
    /// connection already consumes from the queue.
    pub fn subscribe(
        &self,
        id: &ConnectionId,
        queue_name: &str,
        concurrency: Option<u32>,
    ) -> Result<(), BrokerError> {
        let session = self.inner.session(id)?;
        let queue = self
            .queue(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;

        if let Some(max) = concurrency {
            session.client().set_max_concurrency(max.max(1) as usize);
        }
        queue.dispatcher().add(Arc::clone(session.client()))?;
        session.add_subscription(queue_name);
        queue.gate().unblock();

        debug!(
            connection = %id,
            queue = %queue_name,
            subscribers = queue.dispatcher().len(),
            "Subscribed"
        );
        Ok(())
    }

    /// Stop delivering a queue's messages to a connection.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown connection or if it is not
    /// subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, queue_name: &str) -> Result<(), BrokerError> {
        let session = self.inner.session(id)?;
        if !session.remove_subscription(queue_name) {
            return Err(BrokerError::NotSubscribed(queue_name.to_string()));
        }
        if let Some(queue) = self.queue(queue_name) {
            queue.dispatcher().remove(id);
        }

        debug!(connection = %id, queue = %queue_name, "Unsubscribed");
        Ok(())
    }

    /// Store a message and enqueue it on every matching queue.
    ///
    /// Returns the number of matching queues.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NoMatchingQueue`] if no queue matches, in which
    /// case nothing is stored, or the store's error. Matching queues deleted
    /// while the message was being stored do not count; if none is left the
    /// message is removed again and the publish fails the same way.
    pub async fn publish(&self, message: StoredMessage) -> Result<usize, BrokerError> {
        let queues = self.inner.matching_queues(&message.route);
        if queues.is_empty() {
            return Err(BrokerError::NoMatchingQueue(message.route));
        }

        let id = message.id;
        let route = message.route.clone();
        self.inner.context.store.add(message).await?;
        let matches = self.inner.fan_out(id, &queues).await;
        if matches == 0 {
            return Err(BrokerError::NoMatchingQueue(route));
        }

        self.inner.emit(BrokerEvent::MessageStored { id, matches });
        Ok(matches)
    }

    /// Re-route messages left in the store, as if freshly published.
    ///
    /// Call after declaring queues at startup.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn recover(&self) -> Result<RecoveryReport, BrokerError> {
        let store = &self.inner.context.store;
        let ids = store
            .pending_messages(self.inner.context.config.recovery_batch_limit)
            .await?;

        let mut report = RecoveryReport::default();
        for id in ids {
            if self.inner.refs.outstanding(&id).is_some() {
                report.skipped += 1;
                continue;
            }
            let Some(message) = store.try_get(&id).await? else {
                continue;
            };

            let queues = self.inner.matching_queues(&message.route);
            if queues.is_empty() {
                debug!(message = %id, route = %message.route, "Recovered message has no queue");
                report.unroutable += 1;
                continue;
            }
            if self.inner.fan_out(id, &queues).await == 0 {
                report.unroutable += 1;
            } else {
                report.recovered += 1;
            }
        }

        info!(
            recovered = report.recovered,
            unroutable = report.unroutable,
            skipped = report.skipped,
            "Recovery finished"
        );
        Ok(report)
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let mut queues: Vec<QueueStats> = self
            .inner
            .queues
            .iter()
            .map(|q| QueueStats {
                name: q.name().to_string(),
                pattern: q.pattern().to_string(),
                pending: q.pending_len(),
                subscribers: q.dispatcher().len(),
            })
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));

        BrokerStats {
            queues,
            sessions: self.inner.sessions.len(),
            pending_acks: self.inner.acks.pending(),
            outstanding_messages: self.inner.refs.len(),
        }
    }

    /// Stop every queue worker, cancel outstanding deliveries and close all
    /// connections. Unacknowledged messages stay in the store.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        for queue in self.inner.queues.iter() {
            queue.close();
        }
        self.inner.queues.clear();

        let cancelled = self.inner.acks.cancel_all();

        let clients: Vec<Arc<Client>> = self
            .inner
            .sessions
            .iter()
            .map(|s| Arc::clone(s.client()))
            .collect();
        for client in clients {
            client.close().await;
        }

        info!(cancelled, "Broker shut down");
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.inner.queues.len())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl Inner {
    fn emit(&self, event: BrokerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn session(&self, id: &ConnectionId) -> Result<Arc<Session>, BrokerError> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| BrokerError::UnknownConnection(id.clone()))
    }

    fn matching_queues(&self, route: &str) -> Vec<Arc<Queue>> {
        self.queues
            .iter()
            .filter(|q| q.matches(route))
            .map(|q| Arc::clone(q.value()))
            .collect()
    }

    /// Returns the number of queues that accepted the message.
    async fn fan_out(&self, id: MessageId, queues: &[Arc<Queue>]) -> usize {
        // References must exist before any worker can deliver.
        self.refs.set_up_ref_counter(id, queues.len());
        let mut accepted = 0;
        for queue in queues {
            if queue.enqueue(id) {
                accepted += 1;
            } else {
                debug!(queue = %queue.name(), message = %id, "Queue closed, skipping");
                self.release_reference(&id).await;
            }
        }
        trace!(message = %id, matches = accepted, "Message fanned out");
        accepted
    }

    async fn release_reference(&self, id: &MessageId) {
        if !self.refs.release_one(id) {
            return;
        }
        match self.context.store.delete(id).await {
            Ok(_) => {
                trace!(message = %id, "Message retired");
                self.emit(BrokerEvent::MessageRetired { id: *id });
            }
            Err(e) => warn!(message = %id, error = %e, "Failed to delete retired message"),
        }
    }

    async fn try_deliver_next(self: &Arc<Self>, queue: &Arc<Queue>) -> Step {
        if !queue.has_pending() {
            return Step::Idle;
        }
        let Some(client) = queue.dispatcher().reserve_next() else {
            return Step::Saturated;
        };
        let Some(id) = queue.pop() else {
            client.release();
            return Step::Idle;
        };

        let message = match self.context.store.try_get(&id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!(
                    queue = %queue.name(),
                    message = %id,
                    "Message missing from store, dropping"
                );
                client.release();
                self.release_reference(&id).await;
                return Step::Delivered;
            }
            Err(e) => {
                warn!(queue = %queue.name(), message = %id, error = %e, "Store read failed");
                client.release();
                if !queue.requeue(id) {
                    self.release_reference(&id).await;
                }
                return Step::Saturated;
            }
        };

        let delivery = CorrelationId::generate();
        let frame = match Frame::message(delivery, message.route, message.payload.to_vec()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    queue = %queue.name(),
                    message = %id,
                    error = %e,
                    "Cannot encode message, dropping"
                );
                client.release();
                self.release_reference(&id).await;
                return Step::Delivered;
            }
        };

        tokio::spawn(Arc::clone(self).deliver(Arc::clone(queue), client, id, delivery, frame));
        Step::Delivered
    }

    async fn deliver(
        self: Arc<Self>,
        queue: Arc<Queue>,
        client: Arc<Client>,
        id: MessageId,
        delivery: CorrelationId,
        frame: Frame,
    ) {
        let completion = self
            .acks
            .setup(delivery, true, Some(self.context.config.ack_timeout()));
        client.track_delivery(delivery);

        match client.send_frame(&frame).await {
            Ok(_) => {
                self.acks.on_payload_send_success(&delivery);
            }
            Err(e) => {
                debug!(
                    connection = %client.id(),
                    message = %id,
                    error = %e,
                    "Delivery send failed"
                );
                self.acks.on_payload_send_failed(&delivery);
            }
        }
        trace!(
            queue = %queue.name(),
            connection = %client.id(),
            message = %id,
            %delivery,
            "Delivery sent"
        );

        let outcome = completion.await;
        client.untrack_delivery(&delivery);
        client.release();
        queue.gate().unblock();

        match outcome {
            Ok(()) => {
                self.emit(BrokerEvent::MessageDelivered {
                    id,
                    queue: queue.name().to_string(),
                    connection: client.id().clone(),
                });
                self.release_reference(&id).await;
            }
            Err(DeliveryError::Rejected(reason)) => {
                debug!(
                    queue = %queue.name(),
                    message = %id,
                    %reason,
                    "Delivery rejected by subscriber"
                );
                self.emit(BrokerEvent::DeliveryFailed {
                    id,
                    queue: queue.name().to_string(),
                    reason,
                });
                self.release_reference(&id).await;
            }
            Err(e) => {
                self.emit(BrokerEvent::DeliveryFailed {
                    id,
                    queue: queue.name().to_string(),
                    reason: e.to_string(),
                });
                if self.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                if queue.requeue(id) {
                    debug!(queue = %queue.name(), message = %id, error = %e, "Message requeued");
                } else {
                    self.release_reference(&id).await;
                }
            }
        }
    }
}

impl Broker {
    async fn handle_frame(&self, session: &Session, frame: Frame) -> Result<(), SessionError> {
        let id = frame.correlation_id;
        trace!(
            connection = %session.id(),
            payload_type = ?frame.payload_type,
            correlation = %id,
            "Frame received"
        );

        let result = match frame.payload_type {
            PayloadType::Message => {
                let body: MessageBody = frame.decode_body()?;
                let message = StoredMessage::new(id, body.route, body.payload)
                    .with_source(session.id().as_str());
                self.publish(message).await.map(|_| ())
            }
            PayloadType::Ack => {
                if self.inner.acks.on_payload_ok_result(&id) == Resolution::AlreadyCompleted {
                    debug!(
                        connection = %session.id(),
                        correlation = %id,
                        "Ack for nothing pending"
                    );
                }
                return Ok(());
            }
            PayloadType::Nack => {
                let reason = if frame.body.is_empty() {
                    String::new()
                } else {
                    frame.decode_body::<NackBody>()?.message
                };
                let resolution = self.inner.acks.on_payload_error_result(&id, reason);
                if resolution == Resolution::AlreadyCompleted {
                    debug!(
                        connection = %session.id(),
                        correlation = %id,
                        "Nack for nothing pending"
                    );
                }
                return Ok(());
            }
            PayloadType::Subscribe => {
                let body: SubscribeBody = frame.decode_body()?;
                self.subscribe(session.id(), &body.queue, body.concurrency)
            }
            PayloadType::Unsubscribe => {
                let body: UnsubscribeBody = frame.decode_body()?;
                self.unsubscribe(session.id(), &body.queue)
            }
            PayloadType::QueueDeclare => {
                let body: QueueDeclareBody = frame.decode_body()?;
                self.declare_queue(&body.name, &body.route).map(|_| ())
            }
            PayloadType::QueueDelete => {
                let body: QueueDeleteBody = frame.decode_body()?;
                self.delete_queue(&body.name).await
            }
            PayloadType::Ready => Ok(()),
        };

        let reply = match result {
            Ok(()) => Frame::ack(id),
            Err(e) => {
                debug!(
                    connection = %session.id(),
                    correlation = %id,
                    error = %e,
                    "Request rejected"
                );
                Frame::nack(id, e.to_string())?
            }
        };
        if let Err(e) = session.client().send_frame(&reply).await {
            debug!(connection = %session.id(), error = %e, "Reply send failed");
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for queue in self.queues.iter() {
            queue.close();
        }
    }
}

async fn run_queue_worker(inner: Weak<Inner>, queue: Arc<Queue>) {
    let Some(mut backoff) = inner.upgrade().map(|i| i.context.config.backoff()) else {
        return;
    };
    debug!(queue = %queue.name(), "Queue worker started");

    while !queue.is_closed() {
        queue.gate().block();

        let step = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.try_deliver_next(&queue).await
        };

        match step {
            Step::Delivered => backoff.reset(),
            Step::Idle => {
                if let Err(e) = queue.gate().wait().await {
                    warn!(queue = %queue.name(), error = %e, "Queue worker wait failed");
                    break;
                }
            }
            Step::Saturated => {
                match tokio::time::timeout(backoff.next_delay(), queue.gate().wait()).await {
                    Ok(Ok(())) => trace!(queue = %queue.name(), "Worker woken early"),
                    Ok(Err(e)) => {
                        warn!(queue = %queue.name(), error = %e, "Queue worker wait failed");
                        break;
                    }
                    Err(_elapsed) => {}
                }
            }
        }
    }

    debug!(queue = %queue.name(), "Queue worker stopped");
}

#[async_trait]
impl SessionHandler for Broker {
    async fn on_connected(
        &self,
        id: ConnectionId,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<(), SessionError> {
        let config = &self.inner.context.config;
        let client = Arc::new(Client::new(id.clone(), sink, config.default_max_concurrency));
        let assembler = FrameAssembler::new(
            Arc::clone(&self.inner.context.buffers),
            config.initial_buffer_size,
            config.max_body_size,
        );

        match self.inner.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Session::new(Arc::clone(&client), assembler)));
            }
        }
        info!(connection = %id, "Connection registered");
        self.inner.emit(BrokerEvent::Connected {
            connection: id.clone(),
        });

        let ready = CorrelationId::generate();
        let mut completion = self.inner.acks.setup(ready, false, None);
        match client.send_frame(&Frame::ready(ready)).await {
            Ok(_) => self.inner.acks.on_payload_send_success(&ready),
            Err(_) => self.inner.acks.on_payload_send_failed(&ready),
        };
        if let Some(Err(e)) = completion.try_result() {
            warn!(connection = %id, error = %e, "Ready frame not sent");
        }
        Ok(())
    }

    async fn on_disconnected(&self, id: &ConnectionId) {
        let Some((_, session)) = self.inner.sessions.remove(id) else {
            return;
        };

        for name in session.subscriptions() {
            if let Some(queue) = self.queue(&name) {
                queue.dispatcher().remove(id);
            }
        }

        let outstanding = session.client().take_deliveries();
        for delivery in &outstanding {
            self.inner.acks.on_payload_send_failed(delivery);
        }

        info!(connection = %id, outstanding = outstanding.len(), "Connection removed");
        self.inner.emit(BrokerEvent::Disconnected {
            connection: id.clone(),
        });
    }

    async fn on_data_received(&self, id: &ConnectionId, data: &[u8]) -> Result<(), SessionError> {
        let session = self
            .inner
            .sessions
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SessionError::UnknownConnection(id.clone()))?;

        // Frames are handled as they are extracted, so a protocol violation
        // later in the read does not drop the frames ahead of it.
        session.feed(data);
        while let Some(frame) = session.next_frame()? {
            self.handle_frame(&session, frame).await?;
        }
        Ok(())
    }
}
