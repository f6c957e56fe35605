//! Node topology and destination selection.
//!
//! The registry owns this node's spec and the current view of its peers.
//! It answers "which node hosts actor X", stamps outgoing messages, and
//! merges topology snapshots received from gossip. It performs no network
//! I/O itself and its reads never block on a topology refresh.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use hornet_wire::{actor_module, ActorMessage, MessageId, Priority};

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No node in the current topology hosts the destination actor.
    #[error("no known host for actor '{0}'")]
    NoKnownHost(String),

    /// The node name is not in the current topology.
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// src and dst actor names must be non-empty.
    #[error("empty actor name in message addressing")]
    EmptyActorName,
}

/// A node's advertised identity: name, runnable modules, and endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node identifier.
    pub name: String,

    /// Actor modules this node can run.
    pub modules: BTreeSet<String>,

    /// Reachable base URLs, most-preferred first.
    pub networks: Vec<String>,
}

impl NodeSpec {
    /// Whether this node hosts the named actor (by module membership).
    #[must_use]
    pub fn hosts_actor(&self, actor: &str) -> bool {
        self.modules.contains(actor_module(actor))
    }
}

/// Topology snapshot exchanged between nodes by gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeSpec>,
}

/// Parameters for creating a message through the registry.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub src: String,
    pub dst: String,
    pub dst_node: Option<String>,
    pub content: Value,
    pub priority: Priority,
    pub is_ask: bool,
    pub require_ack: bool,
}

impl NewMessage {
    /// A fire-and-forget message with default priority and null content.
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            dst_node: None,
            content: Value::Null,
            priority: Priority::DEFAULT,
            is_ask: false,
            require_ack: false,
        }
    }

    /// Set the payload.
    #[must_use]
    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Pin the destination node instead of letting the registry choose.
    #[must_use]
    pub fn to_node(mut self, node: impl Into<String>) -> Self {
        self.dst_node = Some(node.into());
        self
    }

    /// Set the dispatch priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as an ask; the caller will block for a correlated reply.
    #[must_use]
    pub fn ask(mut self) -> Self {
        self.is_ask = true;
        self
    }

    /// Require a delivery acknowledgment even for fire-and-forget.
    #[must_use]
    pub fn require_ack(mut self) -> Self {
        self.require_ack = true;
        self
    }
}

/// Process-wide topology view, one instance per node.
///
/// The peer map includes the current node for uniform lookup. Peer entries
/// are replaced wholesale on merge; the current node's own entry is fixed at
/// startup and never overwritten by gossip.
pub struct ActorRegistry {
    current: NodeSpec,
    peers: RwLock<HashMap<String, NodeSpec>>,
}

impl ActorRegistry {
    /// Build a registry from this node's spec plus optional seed peers.
    pub fn new(current: NodeSpec, seeds: Vec<NodeSpec>) -> Self {
        let mut peers = HashMap::new();
        peers.insert(current.name.clone(), current.clone());
        for seed in seeds {
            if seed.name != current.name {
                peers.insert(seed.name.clone(), seed);
            }
        }
        Self {
            current,
            peers: RwLock::new(peers),
        }
    }

    /// This node's spec.
    #[must_use]
    pub fn current_node(&self) -> &NodeSpec {
        &self.current
    }

    /// Whether the given node name is this node.
    #[must_use]
    pub fn is_local(&self, node: &str) -> bool {
        node == self.current.name
    }

    /// Create a message: assign the id, stamp `src_node`, and default
    /// `dst_node` via [`choose_destination_node`](Self::choose_destination_node).
    pub fn create_message(&self, new: NewMessage) -> Result<ActorMessage, RegistryError> {
        if new.src.is_empty() || new.dst.is_empty() {
            return Err(RegistryError::EmptyActorName);
        }

        let id = MessageId::new();
        let dst_node = match new.dst_node {
            Some(node) => node,
            None => self.choose_destination_node(&new.dst, &id)?,
        };

        Ok(ActorMessage {
            id,
            src: new.src,
            src_node: self.current.name.clone(),
            dst: new.dst,
            dst_node,
            content: new.content,
            priority: new.priority,
            is_ask: new.is_ask,
            require_ack: new.require_ack,
            retry_count: 0,
        })
    }

    /// Pick the destination node for an actor name.
    ///
    /// Prefers the current node when it hosts the actor (no network hop).
    /// Otherwise spreads load deterministically: the message id is hashed
    /// over the sorted names of eligible peers, so the same id always maps
    /// to the same node and distinct ids spread out.
    pub fn choose_destination_node(
        &self,
        dst: &str,
        id: &MessageId,
    ) -> Result<String, RegistryError> {
        if self.current.hosts_actor(dst) {
            return Ok(self.current.name.clone());
        }

        let peers = self.peers.read().expect("registry lock poisoned");
        let mut eligible: Vec<&str> = peers
            .values()
            .filter(|spec| spec.name != self.current.name && spec.hosts_actor(dst))
            .map(|spec| spec.name.as_str())
            .collect();

        if eligible.is_empty() {
            return Err(RegistryError::NoKnownHost(dst.to_string()));
        }

        eligible.sort_unstable();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() % eligible.len() as u64) as usize;
        Ok(eligible[index].to_string())
    }

    /// Merge a topology snapshot: peer entries are inserted or replaced
    /// wholesale, never field-merged, so a peer's view is always internally
    /// consistent. The current node's entry is untouched.
    pub fn merge_topology(&self, specs: Vec<NodeSpec>) {
        let mut peers = self.peers.write().expect("registry lock poisoned");
        for spec in specs {
            if spec.name == self.current.name {
                continue;
            }
            debug!(node = %spec.name, modules = ?spec.modules, "Merged peer spec");
            peers.insert(spec.name.clone(), spec);
        }
    }

    /// All endpoints for a node in declared preference order; the sender
    /// walks them on connection failure.
    pub fn resolve_network(&self, node: &str) -> Result<Vec<String>, RegistryError> {
        let peers = self.peers.read().expect("registry lock poisoned");
        peers
            .get(node)
            .map(|spec| spec.networks.clone())
            .filter(|networks| !networks.is_empty())
            .ok_or_else(|| RegistryError::UnknownNode(node.to_string()))
    }

    /// Current topology view, sorted by node name, current node included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NodeSpec> {
        let peers = self.peers.read().expect("registry lock poisoned");
        let mut specs: Vec<NodeSpec> = peers.values().cloned().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, modules: &[&str]) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            networks: vec![format!("http://{name}.test:8000")],
        }
    }

    fn registry() -> ActorRegistry {
        ActorRegistry::new(
            spec("local", &["system"]),
            vec![spec("x", &["feed"]), spec("y", &["feed"]), spec("z", &["mail"])],
        )
    }

    #[test]
    fn test_create_message_stamps_identity() {
        let registry = registry();
        let msg = registry
            .create_message(NewMessage::new("system.init", "feed.sync"))
            .unwrap();
        assert_eq!(msg.src_node, "local");
        assert_eq!(msg.retry_count, 0);
        assert!(["x", "y"].contains(&msg.dst_node.as_str()));
    }

    #[test]
    fn test_create_message_rejects_empty_names() {
        let registry = registry();
        let err = registry
            .create_message(NewMessage::new("", "feed.sync"))
            .unwrap_err();
        assert_eq!(err, RegistryError::EmptyActorName);
    }

    #[test]
    fn test_choose_prefers_local_node() {
        let registry = registry();
        let id = MessageId::new();
        let node = registry.choose_destination_node("system.init", &id).unwrap();
        assert_eq!(node, "local");
    }

    #[test]
    fn test_choose_never_selects_non_hosting_node() {
        // actor hosted on {x, y} only; z must never be chosen
        let registry = registry();
        for _ in 0..50 {
            let id = MessageId::new();
            let node = registry.choose_destination_node("feed.sync", &id).unwrap();
            assert!(["x", "y"].contains(&node.as_str()), "selected {node}");
        }
    }

    #[test]
    fn test_choose_is_deterministic_per_id() {
        let registry = registry();
        let id = MessageId::new();
        let first = registry.choose_destination_node("feed.sync", &id).unwrap();
        for _ in 0..10 {
            assert_eq!(
                registry.choose_destination_node("feed.sync", &id).unwrap(),
                first
            );
        }
    }

    #[test]
    fn test_no_known_host() {
        let registry = registry();
        let err = registry
            .choose_destination_node("nowhere.actor", &MessageId::new())
            .unwrap_err();
        assert_eq!(err, RegistryError::NoKnownHost("nowhere.actor".to_string()));
    }

    #[test]
    fn test_merge_replaces_wholesale() {
        let registry = registry();

        // x loses the feed module entirely; the old entry must not linger
        let mut updated = spec("x", &["mail"]);
        updated.networks = vec!["http://x.test:9999".to_string()];
        registry.merge_topology(vec![updated.clone()]);

        let snapshot = registry.snapshot();
        let x = snapshot.iter().find(|s| s.name == "x").unwrap();
        assert_eq!(*x, updated);

        // only y hosts feed now
        for _ in 0..20 {
            let node = registry
                .choose_destination_node("feed.sync", &MessageId::new())
                .unwrap();
            assert_eq!(node, "y");
        }
    }

    #[test]
    fn test_merge_never_overwrites_current_node() {
        let registry = registry();
        registry.merge_topology(vec![spec("local", &["hijacked"])]);
        let snapshot = registry.snapshot();
        let local = snapshot.iter().find(|s| s.name == "local").unwrap();
        assert!(local.modules.contains("system"));
        assert!(!local.modules.contains("hijacked"));
    }

    #[test]
    fn test_resolve_network_preference_order() {
        let registry = ActorRegistry::new(
            spec("local", &["system"]),
            vec![NodeSpec {
                name: "multi".to_string(),
                modules: BTreeSet::new(),
                networks: vec![
                    "http://preferred:8000".to_string(),
                    "http://fallback:8000".to_string(),
                ],
            }],
        );

        let networks = registry.resolve_network("multi").unwrap();
        assert_eq!(networks[0], "http://preferred:8000");
        assert_eq!(networks[1], "http://fallback:8000");

        assert_eq!(
            registry.resolve_network("ghost").unwrap_err(),
            RegistryError::UnknownNode("ghost".to_string())
        );
    }
}
