//! Caller-facing delivery: fire-and-forget `tell` and blocking `ask`.
//!
//! `ask` is synchronous request/response built on asynchronous transport:
//! a pending-reply slot keyed by message id is registered before the send,
//! the reply travels back through the normal receive path and resolves the
//! slot, and the caller blocks on the slot with a timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use hornet_wire::{ActorMessage, MessageId, ReplyContent};

use crate::queue::{ActorMessageQueue, QueueError};
use crate::registry::{ActorRegistry, RegistryError};
use crate::sender::{DeliveryError, MessageSender};

/// Errors surfaced to `tell`/`ask` callers.
///
/// Fire-and-forget callers only ever observe routing, queue-full, and
/// delivery errors at send time; downstream handler failures stay inside
/// the executor.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Routing(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// No correlated reply arrived within the budget.
    #[error("no reply within {0:?}")]
    AskTimeout(Duration),

    /// The node shut down while the ask was outstanding.
    #[error("node shutting down before reply")]
    Shutdown,

    /// The destination actor failed terminally; its error reply.
    #[error("actor failed: {0}")]
    Failure(String),

    /// An ask with the same id is already outstanding (caller error).
    #[error("an ask with id {0} is already outstanding")]
    DuplicateAsk(MessageId),

    /// The reply content did not decode as a reply.
    #[error("malformed reply content: {0}")]
    MalformedReply(String),
}

/// Pending-reply slots shared by the client, receiver, and executor.
///
/// Exactly one outstanding ask per message id; replies resolve the slot,
/// shutdown drains every slot so no asker hangs indefinitely.
#[derive(Default)]
pub struct AskRegistry {
    slots: Mutex<HashMap<MessageId, oneshot::Sender<ActorMessage>>>,
}

impl AskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot before sending; fails on id collision.
    pub fn register(&self, id: MessageId) -> Result<oneshot::Receiver<ActorMessage>, ClientError> {
        let mut slots = self.slots.lock().expect("ask registry lock poisoned");
        if slots.contains_key(&id) {
            return Err(ClientError::DuplicateAsk(id));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Ok(rx)
    }

    /// Deliver a reply to its waiting asker. Returns false when no slot is
    /// waiting (timed out or never asked) — the reply is then dropped.
    pub fn resolve(&self, id: &MessageId, reply: ActorMessage) -> bool {
        let slot = {
            let mut slots = self.slots.lock().expect("ask registry lock poisoned");
            slots.remove(id)
        };
        match slot {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(message_id = %id, "No pending ask for reply, dropping");
                false
            }
        }
    }

    /// Withdraw a slot (ask timed out or the send failed).
    pub fn remove(&self, id: &MessageId) {
        let mut slots = self.slots.lock().expect("ask registry lock poisoned");
        slots.remove(id);
    }

    /// Drop every outstanding slot; their askers observe shutdown.
    pub fn drain(&self) {
        let mut slots = self.slots.lock().expect("ask registry lock poisoned");
        let count = slots.len();
        slots.clear();
        if count > 0 {
            warn!(count, "Drained outstanding asks at shutdown");
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots.lock().expect("ask registry lock poisoned").len()
    }
}

/// Caller-facing handle for message delivery.
pub struct ActorClient {
    registry: Arc<ActorRegistry>,
    queue: Arc<ActorMessageQueue>,
    sender: Arc<MessageSender>,
    asks: Arc<AskRegistry>,
    ask_timeout: Duration,
}

impl ActorClient {
    pub fn new(
        registry: Arc<ActorRegistry>,
        queue: Arc<ActorMessageQueue>,
        sender: Arc<MessageSender>,
        asks: Arc<AskRegistry>,
        ask_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            sender,
            asks,
            ask_timeout,
        }
    }

    /// Fire-and-forget delivery: local destinations enqueue directly,
    /// remote ones go over the wire.
    pub async fn tell(&self, msg: ActorMessage) -> Result<(), ClientError> {
        self.deliver(msg).await
    }

    /// Send and block until a correlated reply arrives or the budget
    /// elapses, whichever comes first.
    pub async fn ask(&self, msg: ActorMessage) -> Result<Value, ClientError> {
        let id = msg.id;
        let rx = self.asks.register(id)?;

        if let Err(e) = self.deliver(msg).await {
            self.asks.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.ask_timeout, rx).await {
            Ok(Ok(reply)) => match ReplyContent::from_value(&reply.content) {
                Ok(ReplyContent::Result(value)) => Ok(value),
                Ok(ReplyContent::Error(detail)) => Err(ClientError::Failure(detail)),
                Err(e) => Err(ClientError::MalformedReply(e.to_string())),
            },
            // slot dropped without a reply: the node is tearing down
            Ok(Err(_)) => Err(ClientError::Shutdown),
            Err(_) => {
                self.asks.remove(&id);
                Err(ClientError::AskTimeout(self.ask_timeout))
            }
        }
    }

    async fn deliver(&self, msg: ActorMessage) -> Result<(), ClientError> {
        if self.registry.is_local(&msg.dst_node) {
            self.queue.enqueue(msg)?;
            Ok(())
        } else {
            self.sender.send(&msg, false).await?;
            Ok(())
        }
    }
}
