//! Inbound HTTP transport.
//!
//! Every node exposes one message endpoint, `POST {subpath}/api/v1/inbox`.
//! Acceptance means durability: a 200 response is only sent after the message
//! has been appended to storage, so a peer that saw the ack can forget the
//! message. Replies to pending asks bypass the queue and resolve the waiting
//! caller directly.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use hornet_wire::{Envelope, InboxResponse};

use crate::client::AskRegistry;
use crate::queue::{ActorMessageQueue, QueueError};
use crate::registry::ActorRegistry;

/// RFC 9457 problem body for rejected envelopes.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://hornet.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::BAD_REQUEST;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::UNAUTHORIZED;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::SERVICE_UNAVAILABLE;
        let mut problem = Box::new(ProblemDetails::new(status, code, message));
        problem.retryable = true;
        Self { status, problem }
    }

    fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct ReceiverState {
    registry: Arc<ActorRegistry>,
    queue: Arc<ActorMessageQueue>,
    asks: Arc<AskRegistry>,
    // digests compare in uniform time regardless of where tokens differ
    token_digest: Option<[u8; 32]>,
}

impl ReceiverState {
    fn verify_token(&self, presented: Option<&str>) -> bool {
        let Some(expected) = &self.token_digest else {
            return true;
        };
        let Some(presented) = presented else {
            return false;
        };
        let digest = Sha256::digest(presented.as_bytes());
        digest[..] == expected[..]
    }
}

/// The inbound half of the transport: builds the router that peers (and the
/// local sender, for loopback networks) post envelopes to.
pub struct MessageReceiver {
    state: ReceiverState,
    subpath: String,
}

impl MessageReceiver {
    pub fn new(
        registry: Arc<ActorRegistry>,
        queue: Arc<ActorMessageQueue>,
        asks: Arc<AskRegistry>,
        token: Option<&str>,
        subpath: impl Into<String>,
    ) -> Self {
        let token_digest = token.map(|t| Sha256::digest(t.as_bytes()).into());
        Self {
            state: ReceiverState {
                registry,
                queue,
                asks,
                token_digest,
            },
            subpath: subpath.into(),
        }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&format!("{}/api/v1/inbox", self.subpath), post(inbox))
            .route(&format!("{}/healthz", self.subpath), get(healthz))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status, currently always "ok".
    pub status: String,

    /// Node name.
    pub node: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,
}

/// Liveness probe: 200 whenever the server is up.
async fn healthz(State(state): State<ReceiverState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node: state.registry.current_node().name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Accept one envelope.
///
/// Replies to asks are resolved against the pending-ask table; everything
/// else is enqueued. A message already seen (pending or done) is acked as a
/// duplicate so the peer's retry converges instead of looping.
async fn inbox(
    State(state): State<ReceiverState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<InboxResponse>, ApiError> {
    if !state.verify_token(envelope.token.as_deref()) {
        warn!(message_id = %envelope.message.id, "Rejected envelope with bad token");
        return Err(ApiError::unauthorized(
            "invalid_token",
            "Missing or invalid delivery token",
        ));
    }

    let msg = envelope.message;

    if !state.registry.is_local(&msg.dst_node) {
        return Err(ApiError::bad_request(
            "wrong_node",
            format!(
                "message addressed to node '{}', this is '{}'",
                msg.dst_node,
                state.registry.current_node().name
            ),
        ));
    }

    if envelope.is_reply {
        let id = msg.id;
        if !state.asks.resolve(&id, msg) {
            // ask already timed out; the reply is acked and dropped
            debug!(message_id = %id, "Reply arrived after ask expired");
        }
        return Ok(Json(InboxResponse::accepted()));
    }

    match state.queue.enqueue(msg) {
        Ok(()) => Ok(Json(InboxResponse::accepted())),
        Err(QueueError::Duplicate(id)) => {
            debug!(message_id = %id, "Duplicate envelope acked");
            Ok(Json(InboxResponse::duplicate()))
        }
        Err(QueueError::Full) => Err(ApiError::unavailable(
            "queue_full",
            "pending queue is at capacity, retry later",
        )),
        Err(QueueError::Storage(e)) => {
            warn!(error = %e, "Failed to persist inbound message");
            Err(ApiError::internal("storage", "failed to persist message"))
        }
    }
}
