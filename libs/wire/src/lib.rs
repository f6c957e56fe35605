//! # hornet-wire
//!
//! Message types and the wire envelope shared by every hornet component.
//!
//! ## Design Principles
//!
//! - Messages are immutable after creation except for the retry counter,
//!   which only the executor touches
//! - Message ids are system-generated, time-ordered, and roundtrip through
//!   their canonical string form (parse → format → parse)
//! - The wire envelope is the only type that crosses the network boundary;
//!   everything it carries is plain JSON
//!
//! ## Id Format
//!
//! Message ids use a prefixed ULID: `msg_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! The prefix gives type safety, the ULID gives sortability and uniqueness.

mod envelope;
mod id;
mod message;

pub use envelope::{Envelope, InboxResponse, ReplyContent};
pub use id::{IdError, MessageId};
pub use message::{actor_module, ActorMessage, Priority};

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
