//! Delivery flows driven through the session interface, the way a transport
//! drives the broker.

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    Broker, BrokerConfig, BrokerContext, BrokerError, BrokerEvent, ConnectionId, ConnectionSink,
    InMemoryStore, MessageId, MessageStore, SendError, SessionHandler, StoreError, StoredMessage,
};
use courier_protocol::codec::HEADER_SIZE;
use courier_protocol::{codec, CorrelationId, Frame, MessageBody, NackBody, PayloadType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct ChannelSink {
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

struct Peer {
    id: ConnectionId,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Peer {
    async fn connect(broker: &Broker, id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from(id);
        broker
            .on_connected(id.clone(), Arc::new(ChannelSink { tx }))
            .await
            .unwrap();

        let mut peer = Self { id, rx };
        assert_eq!(peer.recv().await.payload_type, PayloadType::Ready);
        peer
    }

    async fn send(&self, broker: &Broker, frame: Frame) {
        let bytes = codec::encode(&frame).unwrap();
        broker.on_data_received(&self.id, &bytes).await.unwrap();
    }

    /// Send a request and assert it is acknowledged.
    async fn request(&mut self, broker: &Broker, frame: Frame) {
        let id = frame.correlation_id;
        self.send(broker, frame).await;
        let reply = self.recv().await;
        assert_eq!(reply.correlation_id, id);
        assert_eq!(reply.payload_type, PayloadType::Ack, "request {id} rejected");
    }

    async fn subscribe(&mut self, broker: &Broker, queue: &str, concurrency: Option<u32>) {
        let frame = Frame::subscribe(CorrelationId::generate(), queue, concurrency).unwrap();
        self.request(broker, frame).await;
    }

    async fn publish(&mut self, broker: &Broker, id: u128, route: &str, payload: &[u8]) {
        let frame = Frame::message(CorrelationId(id), route, payload.to_vec()).unwrap();
        self.request(broker, frame).await;
    }

    async fn recv(&mut self) -> Frame {
        let bytes = timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("sink dropped");
        codec::decode(&bytes, codec::DEFAULT_MAX_BODY_SIZE).unwrap()
    }

    async fn recv_message(&mut self) -> (CorrelationId, MessageBody) {
        let frame = self.recv().await;
        assert_eq!(frame.payload_type, PayloadType::Message);
        (frame.correlation_id, frame.decode_body().unwrap())
    }

    /// Assert nothing arrives for a little while.
    async fn assert_quiet(&mut self) {
        assert!(
            timeout(Duration::from_millis(100), self.rx.recv())
                .await
                .is_err(),
            "unexpected frame"
        );
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<BrokerEvent>,
    wanted: impl Fn(&BrokerEvent) -> bool,
) -> BrokerEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

/// Store whose `add` parks until released.
#[derive(Default)]
struct GatedStore {
    inner: InMemoryStore,
    adding: Notify,
    release: Notify,
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn add(&self, message: StoredMessage) -> Result<(), StoreError> {
        self.adding.notify_one();
        self.release.notified().await;
        self.inner.add(message).await
    }

    async fn try_get(&self, id: &MessageId) -> Result<Option<StoredMessage>, StoreError> {
        self.inner.try_get(id).await
    }

    async fn delete(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn pending_messages(&self, limit: usize) -> Result<Vec<MessageId>, StoreError> {
        self.inner.pending_messages(limit).await
    }
}

fn broker_with_store(config: BrokerConfig) -> (Broker, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let broker = Broker::new(BrokerContext::new(config, store.clone()));
    (broker, store)
}

#[tokio::test]
async fn test_publish_deliver_ack_retires() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    let mut events = broker.subscribe_events();
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "orders", None).await;

    producer.publish(&broker, 1, "orders/eu", b"hello").await;
    let (delivery, body) = consumer.recv_message().await;
    assert_eq!(body.route, "orders/eu");
    assert_eq!(body.payload, b"hello");
    assert_ne!(delivery, CorrelationId(1));
    assert_eq!(store.len(), 1);

    consumer.send(&broker, Frame::ack(delivery)).await;
    let delivered = wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::MessageDelivered { .. })
    })
    .await;
    assert_eq!(
        delivered,
        BrokerEvent::MessageDelivered {
            id: CorrelationId(1),
            queue: "orders".into(),
            connection: ConnectionId::from("consumer"),
        }
    );
    wait_for(&mut events, |e| {
        *e == BrokerEvent::MessageRetired {
            id: CorrelationId(1),
        }
    })
    .await;

    assert!(store.is_empty());
    let stats = broker.stats();
    assert_eq!(stats.pending_acks, 0);
    assert_eq!(stats.outstanding_messages, 0);
}

#[tokio::test]
async fn test_publish_without_matching_queue_is_nacked() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    broker.declare_queue("orders", "orders/*").unwrap();
    let mut producer = Peer::connect(&broker, "producer").await;

    let frame = Frame::message(CorrelationId(9), "users/eu", b"x".to_vec()).unwrap();
    producer.send(&broker, frame).await;

    let reply = producer.recv().await;
    assert_eq!(reply.payload_type, PayloadType::Nack);
    assert_eq!(reply.correlation_id, CorrelationId(9));
    let body: NackBody = reply.decode_body().unwrap();
    assert!(body.message.contains("users/eu"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_subscriber_nack_retires_message() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    let mut events = broker.subscribe_events();
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "orders", None).await;
    producer.publish(&broker, 1, "orders/eu", b"bad").await;

    let (delivery, _) = consumer.recv_message().await;
    consumer
        .send(&broker, Frame::nack(delivery, "cannot parse").unwrap())
        .await;

    let failed = wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::DeliveryFailed { .. })
    })
    .await;
    assert_eq!(
        failed,
        BrokerEvent::DeliveryFailed {
            id: CorrelationId(1),
            queue: "orders".into(),
            reason: "cannot parse".into(),
        }
    );
    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageRetired { .. })).await;
    assert!(store.is_empty());
    consumer.assert_quiet().await;
}

#[tokio::test]
async fn test_unacknowledged_delivery_is_redelivered() {
    let config = BrokerConfig {
        ack_timeout_ms: 200,
        ..BrokerConfig::default()
    };
    let (broker, store) = broker_with_store(config);
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "orders", None).await;
    producer.publish(&broker, 1, "orders/eu", b"retry").await;

    let (first, _) = consumer.recv_message().await;
    // No ack: the timeout puts it back at the head of the queue.
    let (second, body) = consumer.recv_message().await;
    assert_ne!(first, second);
    assert_eq!(body.payload, b"retry");

    // Late ack for the expired delivery is ignored.
    consumer.send(&broker, Frame::ack(first)).await;
    assert_eq!(store.len(), 1);

    let mut events = broker.subscribe_events();
    consumer.send(&broker, Frame::ack(second)).await;
    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageRetired { .. })).await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_disconnect_requeues_to_another_subscriber() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    let mut events = broker.subscribe_events();
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut first = Peer::connect(&broker, "first").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    first.subscribe(&broker, "orders", None).await;
    producer.publish(&broker, 1, "orders/eu", b"handover").await;
    first.recv_message().await;

    let mut second = Peer::connect(&broker, "second").await;
    second.subscribe(&broker, "orders", None).await;
    broker.on_disconnected(&first.id).await;

    let (delivery, body) = second.recv_message().await;
    assert_eq!(body.payload, b"handover");
    second.send(&broker, Frame::ack(delivery)).await;

    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageRetired { .. })).await;
    assert!(store.is_empty());
    assert_eq!(broker.stats().sessions, 2);
}

#[tokio::test]
async fn test_fan_out_retires_after_every_queue_acks() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    let mut events = broker.subscribe_events();
    broker.declare_queue("eu", "orders/eu").unwrap();
    broker.declare_queue("all", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "eu", None).await;
    consumer.subscribe(&broker, "all", None).await;
    producer.publish(&broker, 1, "orders/eu", b"both").await;

    let (a, _) = consumer.recv_message().await;
    let (b, _) = consumer.recv_message().await;
    assert_ne!(a, b);

    consumer.send(&broker, Frame::ack(a)).await;
    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageDelivered { .. })).await;
    assert_eq!(store.len(), 1);

    consumer.send(&broker, Frame::ack(b)).await;
    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageRetired { .. })).await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_concurrency_limits_outstanding_deliveries() {
    let (broker, _store) = broker_with_store(BrokerConfig::default());
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "orders", Some(1)).await;
    for id in 1..=3 {
        producer
            .publish(&broker, id, "orders/eu", &[id as u8])
            .await;
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (delivery, body) = consumer.recv_message().await;
        consumer.assert_quiet().await;
        seen.push(body.payload[0]);
        consumer.send(&broker, Frame::ack(delivery)).await;
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_queue_lifecycle_over_frames() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    let mut admin = Peer::connect(&broker, "admin").await;

    admin
        .request(
            &broker,
            Frame::queue_declare(CorrelationId::generate(), "audit", "audit/*").unwrap(),
        )
        .await;
    assert!(broker.queue("audit").is_some());

    // Same name, different route.
    let conflict = Frame::queue_declare(CorrelationId(5), "audit", "other/*").unwrap();
    admin.send(&broker, conflict).await;
    assert_eq!(admin.recv().await.payload_type, PayloadType::Nack);

    admin.publish(&broker, 1, "audit/login", b"x").await;
    assert_eq!(store.len(), 1);

    admin
        .request(
            &broker,
            Frame::queue_delete(CorrelationId::generate(), "audit").unwrap(),
        )
        .await;
    assert!(broker.queue("audit").is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (broker, _store) = broker_with_store(BrokerConfig::default());
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "orders", None).await;
    consumer
        .request(
            &broker,
            Frame::unsubscribe(CorrelationId::generate(), "orders").unwrap(),
        )
        .await;

    producer.publish(&broker, 1, "orders/eu", b"x").await;
    consumer.assert_quiet().await;
    assert_eq!(broker.queue("orders").unwrap().pending_len(), 1);
}

#[tokio::test]
async fn test_publish_racing_queue_delete_is_not_orphaned() {
    let store = Arc::new(GatedStore::default());
    let broker = Broker::new(BrokerContext::new(BrokerConfig::default(), store.clone()));
    broker.declare_queue("orders", "orders/*").unwrap();

    let publisher = broker.clone();
    let publish = tokio::spawn(async move {
        let message = StoredMessage::new(CorrelationId(1), "orders/eu", b"x".to_vec());
        publisher.publish(message).await
    });

    timeout(WAIT, store.adding.notified()).await.unwrap();
    broker.delete_queue("orders").await.unwrap();
    store.release.notify_one();

    let result = timeout(WAIT, publish).await.unwrap().unwrap();
    assert!(matches!(result, Err(BrokerError::NoMatchingQueue(_))));
    assert_eq!(broker.stats().outstanding_messages, 0);
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn test_publish_racing_one_queue_delete_keeps_the_other() {
    let store = Arc::new(GatedStore::default());
    let broker = Broker::new(BrokerContext::new(BrokerConfig::default(), store.clone()));
    broker.declare_queue("orders", "orders/*").unwrap();
    broker.declare_queue("audit", "orders/eu").unwrap();

    let publisher = broker.clone();
    let publish = tokio::spawn(async move {
        let message = StoredMessage::new(CorrelationId(1), "orders/eu", b"x".to_vec());
        publisher.publish(message).await
    });

    timeout(WAIT, store.adding.notified()).await.unwrap();
    broker.delete_queue("audit").await.unwrap();
    store.release.notify_one();

    assert_eq!(timeout(WAIT, publish).await.unwrap().unwrap().unwrap(), 1);
    assert_eq!(broker.queue("orders").unwrap().pending_len(), 1);

    let mut consumer = Peer::connect(&broker, "consumer").await;
    consumer.subscribe(&broker, "orders", None).await;
    let (delivery, _) = consumer.recv_message().await;

    let mut events = broker.subscribe_events();
    consumer.send(&broker, Frame::ack(delivery)).await;
    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageRetired { .. })).await;
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn test_timed_out_delivery_on_deleted_queue_retires() {
    let config = BrokerConfig {
        ack_timeout_ms: 200,
        ..BrokerConfig::default()
    };
    let (broker, store) = broker_with_store(config);
    let mut events = broker.subscribe_events();
    broker.declare_queue("orders", "orders/*").unwrap();

    let mut consumer = Peer::connect(&broker, "consumer").await;
    let mut producer = Peer::connect(&broker, "producer").await;
    consumer.subscribe(&broker, "orders", None).await;

    producer.publish(&broker, 1, "orders/eu", b"x").await;
    consumer.recv_message().await;
    broker.delete_queue("orders").await.unwrap();

    wait_for(&mut events, |e| matches!(e, BrokerEvent::MessageRetired { .. })).await;
    assert_eq!(broker.stats().outstanding_messages, 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_frames_ahead_of_bad_header_are_handled() {
    let (broker, store) = broker_with_store(BrokerConfig::default());
    broker.declare_queue("orders", "orders/*").unwrap();
    let mut producer = Peer::connect(&broker, "producer").await;

    let message = Frame::message(CorrelationId(1), "orders/eu", b"x".to_vec()).unwrap();
    let mut bytes = codec::encode(&message).unwrap().to_vec();
    // Header declaring a length shorter than itself.
    let mut bad = vec![0u8; HEADER_SIZE];
    bad[3] = 3;
    bad[4] = PayloadType::Message as u8;
    bytes.extend_from_slice(&bad);

    assert!(broker.on_data_received(&producer.id, &bytes).await.is_err());

    let reply = producer.recv().await;
    assert_eq!(reply.correlation_id, CorrelationId(1));
    assert_eq!(reply.payload_type, PayloadType::Ack);
    assert_eq!(broker.queue("orders").unwrap().pending_len(), 1);
    assert_eq!(store.len(), 1);
}
