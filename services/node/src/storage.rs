//! SQLite-backed durable message storage.
//!
//! The storage is a bounded log of message records in two sets:
//!
//! - `pending`: accepted but not yet successfully handled, capacity
//!   `storage_max_pending_size` — at capacity, append is a backpressure
//!   signal, never a silent drop
//! - `done`: completed records (handled or permanently failed) retained for
//!   duplicate detection and audit, capacity `storage_max_done_size`,
//!   oldest evicted first by compaction
//!
//! Opening in memory gives the non-durable configuration of the same core.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use hornet_wire::{ActorMessage, MessageId};

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("pending set is at capacity")]
    PendingFull,

    #[error("message {0} already recorded")]
    Duplicate(MessageId),

    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Completion status of a message in the done set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneStatus {
    /// Handled successfully.
    Done,
    /// Permanently failed (terminal error or exhausted retry budget).
    Failed,
}

impl DoneStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Result of a compaction pass.
#[derive(Debug, Default)]
pub struct CompactStats {
    /// Done entries evicted (oldest first).
    pub evicted_done: usize,

    /// Pending messages moved to done-as-failed because their retry count
    /// reached the budget.
    pub failed_pending: Vec<MessageId>,
}

/// Durable, size-bounded message storage.
pub struct ActorStorage {
    conn: Connection,
    max_pending: usize,
    max_done: usize,
}

impl ActorStorage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_pending: usize,
        max_done: usize,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let storage = Self {
            conn,
            max_pending,
            max_done,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Open an in-memory store (non-durable mode, and tests).
    pub fn open_in_memory(max_pending: usize, max_done: usize) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn,
            max_pending,
            max_done,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pending (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT UNIQUE NOT NULL,
                priority INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS done (
                message_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                completed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_done_completed_at ON done(completed_at);
            "#,
        )?;

        debug!("Message storage schema initialized");
        Ok(())
    }

    /// Append a message to the pending set.
    ///
    /// Fails with [`StorageError::PendingFull`] at capacity and
    /// [`StorageError::Duplicate`] when the id is already pending or done.
    pub fn append(&self, msg: &ActorMessage) -> Result<(), StorageError> {
        if self.contains(&msg.id)? {
            return Err(StorageError::Duplicate(msg.id));
        }
        if self.pending_len()? >= self.max_pending {
            return Err(StorageError::PendingFull);
        }

        let body = serde_json::to_string(msg)?;
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO pending (message_id, priority, retry_count, body, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                msg.id.to_string(),
                msg.priority.0,
                msg.retry_count,
                body,
                now
            ],
        )?;
        Ok(())
    }

    /// Move a message from pending to done.
    ///
    /// Idempotent: an id already in done is a no-op (retried completions).
    /// Returns whether the state actually changed.
    pub fn mark_done(&self, id: &MessageId, status: DoneStatus) -> Result<bool, StorageError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM done WHERE message_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }

        let now = chrono::Utc::now().timestamp();
        // The delete and insert must land together, or a crash in between
        // loses the done record the dedupe relies on.
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM pending WHERE message_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO done (message_id, status, completed_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), status.as_str(), now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Record a failed attempt on a pending message.
    pub fn set_retry_count(&self, id: &MessageId, retry_count: u32) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE pending SET retry_count = ?1 WHERE message_id = ?2",
            params![retry_count, id.to_string()],
        )?;
        Ok(())
    }

    /// Whether the id is recorded in either set.
    pub fn contains(&self, id: &MessageId) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM pending WHERE message_id = ?1)
                  + (SELECT COUNT(*) FROM done WHERE message_id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Completion status of a message, if it reached the done set.
    pub fn done_status(&self, id: &MessageId) -> Result<Option<DoneStatus>, StorageError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM done WHERE message_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(DoneStatus::from_str))
    }

    /// All pending messages in enqueue order, for crash recovery.
    pub fn load_pending(&self) -> Result<Vec<ActorMessage>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT body, retry_count FROM pending ORDER BY seq")?;

        let rows = stmt
            .query_map([], |row| {
                let body: String = row.get(0)?;
                let retry_count: u32 = row.get(1)?;
                Ok((body, retry_count))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (body, retry_count) in rows {
            let mut msg: ActorMessage = serde_json::from_str(&body)?;
            msg.retry_count = retry_count;
            messages.push(msg);
        }
        Ok(messages)
    }

    /// Number of pending messages.
    pub fn pending_len(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Number of completed messages retained.
    pub fn done_len(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM done", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Evict stale state to bound storage size.
    ///
    /// Pending messages whose retry count reached the budget are moved to
    /// done-as-failed (logged, never dropped silently); done entries beyond
    /// the cap are evicted oldest first.
    pub fn compact(&self, max_retry_count: u32) -> Result<CompactStats, StorageError> {
        let mut stats = CompactStats::default();

        let mut stmt = self
            .conn
            .prepare("SELECT message_id FROM pending WHERE retry_count >= ?1")?;
        let exhausted = stmt
            .query_map(params![max_retry_count], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for raw in exhausted {
            let Ok(id) = MessageId::parse(&raw) else {
                continue;
            };
            warn!(message_id = %id, "Retry budget exhausted, marking permanently failed");
            self.mark_done(&id, DoneStatus::Failed)?;
            stats.failed_pending.push(id);
        }

        let excess = self.done_len()?.saturating_sub(self.max_done);
        if excess > 0 {
            stats.evicted_done = self.conn.execute(
                "DELETE FROM done WHERE message_id IN (
                     SELECT message_id FROM done
                     ORDER BY completed_at ASC, message_id ASC
                     LIMIT ?1
                 )",
                params![excess as i64],
            )?;
        }

        Ok(stats)
    }
}
