//! Wire envelope crossing the network boundary.
//!
//! Each inbound POST carries exactly one envelope and receives one
//! [`InboxResponse`]. The response is the transport-level accept/reject,
//! never the handling result: "received" is not "processed".

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ActorMessage;

/// One message framed for the network, plus transport concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The message itself; its fields are inlined into the JSON body.
    #[serde(flatten)]
    pub message: ActorMessage,

    /// Shared auth token; the receiver rejects mismatches without enqueueing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Marks an ask reply travelling back through the normal receive path.
    /// Replies resolve the originator's pending-ask slot instead of being
    /// enqueued.
    #[serde(default)]
    pub is_reply: bool,
}

/// Transport-level accept response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxResponse {
    /// Whether the message was accepted for later dispatch.
    pub accepted: bool,

    /// True when the id was already pending or done; the earlier delivery
    /// attempt won and this one is a no-op.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl InboxResponse {
    /// A plain accept.
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            duplicate: false,
        }
    }

    /// Accepted-as-duplicate: the remote retry already succeeded once.
    #[must_use]
    pub fn duplicate() -> Self {
        Self {
            accepted: true,
            duplicate: true,
        }
    }
}

/// Content of an ask reply message.
///
/// Serialized externally tagged: `{"result": ...}` or `{"error": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyContent {
    /// The handler's output payload.
    Result(Value),

    /// Terminal failure description surfaced to the asker.
    Error(String),
}

impl ReplyContent {
    /// Encodes the reply into a message content value.
    pub fn into_value(self) -> Value {
        // ReplyContent only contains Value and String, serialization cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decodes a reply message's content.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
