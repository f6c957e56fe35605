//! Hornet Actor Node
//!
//! A hornet node hosts a set of named actors, routes messages addressed to
//! actor names across the cluster, queues them durably, and dispatches them
//! to handlers with a bounded worker pool. Callers get fire-and-forget
//! delivery (`tell`) and a synchronous request/response (`ask`) layered on
//! top of asynchronous transport.
//!
//! ## Architecture
//!
//! ```text
//! caller ─► ActorRegistry (pick destination)
//!        ─► MessageSender ──HTTP──► peer MessageReceiver
//!                                        │ durable enqueue
//!                                        ▼
//!                               ActorMessageQueue ◄── ActorStorage (sqlite)
//!                                        │
//!                                        ▼
//!                               ActorExecutor (N workers, retry, timers)
//!                                        │
//!                                        ▼
//!                                  actor handler ──► reply ──► asker
//! ```
//!
//! Delivery is at-least-once: retries may duplicate, the done set dedupes by
//! id, and handler idempotence beyond that is the caller's responsibility.
//!
//! ## Modules
//!
//! - `registry`: node topology and destination selection
//! - `storage` + `queue`: the durable mailbox with bounded pending/done sets
//! - `executor`: concurrent dispatch, retry budget, ack timeout, timer actors
//! - `receiver` / `sender` / `client`: the transport duality and `ask`
//! - `builtin`: system actors (init, gossip, compaction)
//! - `node`: the composition root

pub mod actor;
pub mod builtin;
pub mod client;
pub mod config;
pub mod executor;
pub mod node;
pub mod queue;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod storage;

// Re-export commonly used types
pub use actor::{ActorDescriptor, ActorError, ActorSet, Handler, HandlerError};
pub use client::{ActorClient, AskRegistry, ClientError};
pub use config::Config;
pub use executor::ActorExecutor;
pub use node::{ActorNode, LifecycleHook, NodeBuilder};
pub use queue::{ActorMessageQueue, QueueError};
pub use receiver::MessageReceiver;
pub use registry::{
    ActorRegistry, NewMessage, NodeSpec, RegistryError, TopologySnapshot,
};
pub use sender::{DeliveryError, MessageSender};
pub use storage::{ActorStorage, DoneStatus, StorageError};
