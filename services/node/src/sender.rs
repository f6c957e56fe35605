//! Outbound message transport.
//!
//! The sender resolves the destination node through the registry and POSTs
//! the wire envelope, walking the node's endpoints in preference order on
//! connection failure. Rejections by the peer are terminal for the attempt;
//! backpressure (503) is surfaced as retryable for the caller's policy.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use hornet_wire::{ActorMessage, Envelope, InboxResponse};

use crate::registry::ActorRegistry;

/// Errors from outbound delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The registry has no endpoints for the destination node.
    #[error("no known route to node '{0}'")]
    NoRoute(String),

    /// Every endpoint in preference order failed at the transport level.
    #[error("node '{node}' unreachable at all endpoints: {detail}")]
    Unreachable { node: String, detail: String },

    /// The peer rejected the message (auth, addressing, malformed body).
    #[error("message rejected by '{node}' ({status}): {detail}")]
    Rejected {
        node: String,
        status: u16,
        detail: String,
    },

    /// The peer's pending set is full; retryable by caller policy.
    #[error("backpressure from '{0}': pending queue full")]
    Backpressure(String),
}

/// Outbound HTTP transport for one node.
pub struct MessageSender {
    http: reqwest::Client,
    registry: Arc<ActorRegistry>,
    token: Option<String>,
}

impl MessageSender {
    pub fn new(registry: Arc<ActorRegistry>, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            registry,
            token,
        }
    }

    /// Deliver one message to its destination node.
    ///
    /// `is_reply` marks ask replies so the peer routes them to its
    /// pending-ask table instead of the queue.
    pub async fn send(&self, msg: &ActorMessage, is_reply: bool) -> Result<(), DeliveryError> {
        let node = msg.dst_node.clone();
        let endpoints = self
            .registry
            .resolve_network(&node)
            .map_err(|_| DeliveryError::NoRoute(node.clone()))?;

        let envelope = Envelope {
            message: msg.clone(),
            token: self.token.clone(),
            is_reply,
        };

        let mut last_error = String::new();
        for base in &endpoints {
            let url = format!("{base}/api/v1/inbox");
            debug!(message_id = %msg.id, url = %url, "Delivering message");

            match self.http.post(&url).json(&envelope).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: InboxResponse = response.json().await.map_err(|e| {
                            DeliveryError::Rejected {
                                node: node.clone(),
                                status: status.as_u16(),
                                detail: format!("malformed accept response: {e}"),
                            }
                        })?;
                        if body.duplicate {
                            debug!(message_id = %msg.id, node = %node, "Accepted as duplicate");
                        }
                        return Ok(());
                    }
                    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                        return Err(DeliveryError::Backpressure(node));
                    }
                    let detail = response.text().await.unwrap_or_default();
                    return Err(DeliveryError::Rejected {
                        node,
                        status: status.as_u16(),
                        detail,
                    });
                }
                Err(e) => {
                    // transport failure: try the next preferred endpoint
                    warn!(
                        message_id = %msg.id,
                        endpoint = %base,
                        error = %e,
                        "Endpoint unreachable, trying next"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(DeliveryError::Unreachable {
            node,
            detail: last_error,
        })
    }
}
