//! # courier-core
//!
//! The Courier delivery engine: queues bound to route patterns, per-queue
//! dispatch under connection concurrency limits, acknowledgment tracking and
//! fan-out reference counting.
//!
//! - **Broker** - session boundary, queue workers, publish and recovery
//! - **Assembler** - frames out of a boundary-less byte stream
//! - **Pool** - reusable buffers for the receive path
//! - **Route** - wildcard route matching
//! - **Dispatcher** - destination selection with backpressure
//! - **Ack** - single-outcome completions for tracked sends
//! - **Refcount** - outstanding acknowledgments per fanned-out message
//! - **Wait** - gate and exponential backoff for polling loops
//! - **Store** - message store contract and in-memory store
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  bytes  ┌────────────┐ frames ┌────────────┐
//! │ Transport  │────────▶│  Session   │───────▶│   Broker   │
//! └────────────┘         │ (assembler)│        └─────┬──────┘
//!       ▲                └────────────┘              │ fan-out
//!       │                                            ▼
//!       │  Message   ┌────────────┐  pop   ┌────────────────┐
//!       └────────────│ Dispatcher │◀───────│ Queue + worker │
//!                    └────────────┘        └────────────────┘
//! ```

pub mod ack;
pub mod assembler;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod message;
pub mod pool;
pub mod queue;
pub mod refcount;
pub mod route;
pub mod session;
pub mod store;
pub mod wait;

pub use ack::{AckTracker, Completion, DeliveryError, DeliveryResult, Resolution};
pub use assembler::FrameAssembler;
pub use broker::{Broker, BrokerContext, BrokerError, BrokerStats, QueueStats, RecoveryReport};
pub use client::{Client, ConnectionId, ConnectionSink, SendError};
pub use config::BrokerConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use events::BrokerEvent;
pub use message::{MessageId, StoredMessage};
pub use pool::{BufferPool, Pool, PoolError, PoolOptions, Poolable, PooledBuffer};
pub use queue::Queue;
pub use refcount::RefCounter;
pub use route::{route_matches, RoutePattern};
pub use session::{Session, SessionError, SessionHandler};
pub use store::{InMemoryStore, MessageStore, StoreError};
pub use wait::{Backoff, Gate, GateError};
