//! The actor message value and its addressing helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::MessageId;

/// Dispatch priority of a message.
///
/// Lower values dequeue first; ties within a priority class are broken by
/// arrival order (FIFO). System messages use [`Priority::SYSTEM`], user
/// traffic defaults to [`Priority::DEFAULT`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent class, reserved for system traffic.
    pub const SYSTEM: Priority = Priority(0);

    /// Default class for user traffic.
    pub const DEFAULT: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the module segment of an actor name.
///
/// Actor names have the form `module.name`; the module is everything before
/// the first `.`. A name without a separator is its own module.
#[must_use]
pub fn actor_module(actor: &str) -> &str {
    actor.split('.').next().unwrap_or(actor)
}

/// A message addressed to a named actor.
///
/// Created through the registry (which assigns the id and stamps the source
/// node), owned by the queue while pending, and moved to the done set once
/// handled or permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorMessage {
    /// Unique id, immutable once assigned.
    pub id: MessageId,

    /// Logical name of the sending actor.
    pub src: String,

    /// Node the message originated from (the reply address for asks).
    pub src_node: String,

    /// Logical name of the destination actor.
    pub dst: String,

    /// Node the message is addressed to.
    pub dst_node: String,

    /// Opaque payload, validated against the destination actor's input
    /// schema before dispatch.
    #[serde(default)]
    pub content: Value,

    /// Dispatch priority; lower dequeues first.
    #[serde(default)]
    pub priority: Priority,

    /// When true the sender blocks awaiting a correlated reply.
    #[serde(default)]
    pub is_ask: bool,

    /// When true delivery must be acknowledged within the ack budget.
    #[serde(default)]
    pub require_ack: bool,

    /// Failed delivery attempts so far; bounded by the node's retry budget.
    #[serde(default)]
    pub retry_count: u32,
}

impl ActorMessage {
    /// Returns the module segment of the destination actor name.
    #[must_use]
    pub fn dst_module(&self) -> &str {
        actor_module(&self.dst)
    }

    /// Whether delivery of this message must be acknowledged.
    ///
    /// All ask messages require an ack; fire-and-forget messages may opt in.
    #[must_use]
    pub fn needs_ack(&self) -> bool {
        self.is_ask || self.require_ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("system.init", "system")]
    #[case("feed.sync", "feed")]
    #[case("feed.sync.extra", "feed")]
    #[case("plain", "plain")]
    fn test_actor_module(#[case] name: &str, #[case] module: &str) {
        assert_eq!(actor_module(name), module);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::SYSTEM < Priority::DEFAULT);
        assert!(Priority(1) < Priority(2));
    }

    #[test]
    fn test_message_defaults_on_deserialize() {
        let json = r#"{
            "id": "msg_01HV4Z2WQXKJNM8GPQY6VBKC3D",
            "src": "system.init",
            "src_node": "node-a",
            "dst": "feed.sync",
            "dst_node": "node-b"
        }"#;

        let msg: ActorMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.priority, Priority::DEFAULT);
        assert!(msg.content.is_null());
        assert!(!msg.is_ask);
        assert!(!msg.needs_ack());
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.dst_module(), "feed");
    }
}
