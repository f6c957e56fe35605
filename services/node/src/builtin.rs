//! Built-in system actors.
//!
//! Periodic node maintenance runs through the same pipeline as user traffic:
//! each concern is an actor in the reserved `system` module, driven by timer
//! messages. Gossip and compaction therefore inherit queue durability,
//! priority dispatch, and executor error handling for free.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use hornet_wire::ActorMessage;

use crate::actor::{ActorDescriptor, Handler, HandlerError};
use crate::queue::ActorMessageQueue;
use crate::registry::{ActorRegistry, NewMessage, TopologySnapshot};
use crate::sender::MessageSender;

/// Receives the one-shot startup message emitted when the node boots.
pub const ACTOR_INIT: &str = "system.init";
/// Exchanges topology snapshots with peers.
pub const ACTOR_GOSSIP: &str = "system.gossip";
/// Evicts finished work and fails out exhausted retries.
pub const ACTOR_COMPACT: &str = "system.compact";

/// Module name shared by all built-in actors. Always part of the node's
/// advertised module set.
pub const SYSTEM_MODULE: &str = "system";

/// Marks the node's transition to running. The startup message is the first
/// message every node processes, which doubles as a pipeline smoke check.
struct InitActor {
    registry: Arc<ActorRegistry>,
}

#[async_trait]
impl Handler for InitActor {
    async fn handle(&self, _msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
        let current = self.registry.current_node();
        info!(
            node = %current.name,
            modules = ?current.modules,
            "Actor system initialized"
        );
        Ok(None)
    }
}

/// Topology exchange.
///
/// A timer tick (null content) broadcasts this node's current topology view
/// to every known peer. An inbound snapshot from a peer is merged into the
/// registry. Both sides tick, so views converge without a request/response
/// protocol.
struct GossipActor {
    registry: Arc<ActorRegistry>,
    sender: Arc<MessageSender>,
}

impl GossipActor {
    async fn broadcast(&self) {
        let snapshot = TopologySnapshot {
            nodes: self.registry.snapshot(),
        };
        let content = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode topology snapshot");
                return;
            }
        };

        let current = self.registry.current_node().name.clone();
        let peers: Vec<String> = snapshot
            .nodes
            .iter()
            .map(|spec| spec.name.clone())
            .filter(|name| *name != current)
            .collect();

        debug!(peers = peers.len(), "Broadcasting topology");
        for peer in peers {
            let new = NewMessage::new(ACTOR_GOSSIP, ACTOR_GOSSIP)
                .to_node(peer.clone())
                .content(content.clone());
            let msg = match self.registry.create_message(new) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to create gossip message");
                    continue;
                }
            };
            // delivery failures are not retried, the next tick re-broadcasts
            if let Err(e) = self.sender.send(&msg, false).await {
                debug!(peer = %peer, error = %e, "Gossip delivery failed");
            }
        }
    }
}

#[async_trait]
impl Handler for GossipActor {
    async fn handle(&self, msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
        if msg.content.is_null() {
            self.broadcast().await;
            return Ok(None);
        }

        let snapshot: TopologySnapshot = serde_json::from_value(msg.content.clone())
            .map_err(|e| HandlerError::Terminal(format!("malformed topology snapshot: {e}")))?;
        debug!(
            from = %msg.src_node,
            nodes = snapshot.nodes.len(),
            "Merging topology from peer"
        );
        self.registry.merge_topology(snapshot.nodes);
        Ok(None)
    }
}

/// Periodic mailbox maintenance: moves exhausted retries to the failed set
/// and evicts the oldest completed entries beyond the retention cap.
struct CompactionActor {
    queue: Arc<ActorMessageQueue>,
}

#[async_trait]
impl Handler for CompactionActor {
    async fn handle(&self, _msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
        let stats = self
            .queue
            .compact()
            .map_err(|e| HandlerError::Retryable(format!("compaction failed: {e}")))?;
        if stats.evicted_done > 0 || !stats.failed_pending.is_empty() {
            info!(
                evicted_done = stats.evicted_done,
                failed_pending = stats.failed_pending.len(),
                "Compacted mailbox"
            );
        }
        Ok(None)
    }
}

/// Descriptors for the system actors every node runs.
pub fn builtin_actors(
    registry: Arc<ActorRegistry>,
    queue: Arc<ActorMessageQueue>,
    sender: Arc<MessageSender>,
    gossip_interval: Duration,
    compact_interval: Duration,
) -> Vec<ActorDescriptor> {
    vec![
        ActorDescriptor::new(
            ACTOR_INIT,
            InitActor {
                registry: Arc::clone(&registry),
            },
        ),
        ActorDescriptor::new(
            ACTOR_GOSSIP,
            GossipActor {
                registry: Arc::clone(&registry),
                sender,
            },
        )
        .with_timer(gossip_interval),
        ActorDescriptor::new(ACTOR_COMPACT, CompactionActor { queue })
            .with_timer(compact_interval),
    ]
}
