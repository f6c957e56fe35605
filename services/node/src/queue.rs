//! In-memory work queue fronting durable storage.
//!
//! Enqueue records the message durably before making it visible to workers:
//! a crash between the two steps may cause a redelivery, never the loss of a
//! message already acknowledged to a remote sender.
//!
//! Ordering: strict priority (lower value first), FIFO within a priority
//! class. No starvation guarantee is made for low-priority messages under
//! sustained high-priority load.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

use hornet_wire::{ActorMessage, MessageId};

use crate::storage::{ActorStorage, CompactStats, DoneStatus, StorageError};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Pending set at capacity; a retryable backpressure signal.
    #[error("message queue is full")]
    Full,

    /// The id is already pending or done; the earlier delivery won.
    #[error("message {0} already enqueued")]
    Duplicate(MessageId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Default)]
struct QueueInner {
    /// Ready messages keyed by (priority, admission sequence): BTreeMap
    /// iteration order gives strict priority with FIFO tie-break.
    ready: BTreeMap<(u8, u64), ActorMessage>,
    seq: u64,
}

impl QueueInner {
    fn push(&mut self, msg: ActorMessage) {
        let key = (msg.priority.0, self.seq);
        self.seq += 1;
        self.ready.insert(key, msg);
    }
}

/// The node's mailbox: a priority queue whose contents are always backed by
/// [`ActorStorage`].
pub struct ActorMessageQueue {
    storage: Mutex<ActorStorage>,
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_retry_count: u32,
}

impl ActorMessageQueue {
    pub fn new(storage: ActorStorage, max_retry_count: u32) -> Self {
        Self {
            storage: Mutex::new(storage),
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            max_retry_count,
        }
    }

    /// Durably record a message, then make it visible to workers.
    pub fn enqueue(&self, msg: ActorMessage) -> Result<(), QueueError> {
        {
            let storage = self.storage.lock().expect("storage lock poisoned");
            storage.append(&msg).map_err(|e| match e {
                StorageError::PendingFull => QueueError::Full,
                StorageError::Duplicate(id) => QueueError::Duplicate(id),
                other => QueueError::Storage(other),
            })?;
        }

        self.inner.lock().expect("queue lock poisoned").push(msg);
        self.notify.notify_one();
        Ok(())
    }

    /// Take the highest-priority ready message, suspending when empty.
    pub async fn dequeue(&self) -> ActorMessage {
        loop {
            // arm before checking so an enqueue between the miss and the
            // await still wakes us
            let notified = self.notify.notified();
            if let Some(msg) = self.try_dequeue() {
                return msg;
            }
            notified.await;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<ActorMessage> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.ready.pop_first().map(|(_, msg)| msg)
    }

    /// Re-admit a retried message at the back of its priority class.
    ///
    /// The message is already recorded in pending; only its retry count is
    /// persisted before it becomes visible again.
    pub fn requeue(&self, msg: ActorMessage) -> Result<(), QueueError> {
        {
            let storage = self.storage.lock().expect("storage lock poisoned");
            storage.set_retry_count(&msg.id, msg.retry_count)?;
        }
        self.inner.lock().expect("queue lock poisoned").push(msg);
        self.notify.notify_one();
        Ok(())
    }

    /// Move a message to the done set. Idempotent; returns whether the
    /// state changed.
    pub fn mark_done(&self, id: &MessageId, status: DoneStatus) -> Result<bool, QueueError> {
        let storage = self.storage.lock().expect("storage lock poisoned");
        Ok(storage.mark_done(id, status)?)
    }

    /// Completion status of a message, if it reached the done set.
    pub fn done_status(&self, id: &MessageId) -> Result<Option<DoneStatus>, QueueError> {
        let storage = self.storage.lock().expect("storage lock poisoned");
        Ok(storage.done_status(id)?)
    }

    /// Run a compaction pass; messages the storage declared permanently
    /// failed are also withdrawn from the in-memory queue.
    pub fn compact(&self) -> Result<CompactStats, QueueError> {
        let stats = {
            let storage = self.storage.lock().expect("storage lock poisoned");
            storage.compact(self.max_retry_count)?
        };

        if !stats.failed_pending.is_empty() {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner
                .ready
                .retain(|_, msg| !stats.failed_pending.contains(&msg.id));
        }

        debug!(
            evicted_done = stats.evicted_done,
            failed_pending = stats.failed_pending.len(),
            "Compaction pass finished"
        );
        Ok(stats)
    }

    /// Republish storage's pending rows after a restart.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let pending = {
            let storage = self.storage.lock().expect("storage lock poisoned");
            storage.load_pending()?
        };

        let count = pending.len();
        if count > 0 {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            for msg in pending {
                inner.push(msg);
            }
            self.notify.notify_waiters();
            info!(count, "Recovered pending messages from storage");
        }
        Ok(count)
    }

    /// Number of messages pending (durable view).
    pub fn pending_len(&self) -> Result<usize, QueueError> {
        let storage = self.storage.lock().expect("storage lock poisoned");
        Ok(storage.pending_len()?)
    }

    /// Number of completed messages retained.
    pub fn done_len(&self) -> Result<usize, QueueError> {
        let storage = self.storage.lock().expect("storage lock poisoned");
        Ok(storage.done_len()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hornet_wire::Priority;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue(max_pending: usize) -> ActorMessageQueue {
        let storage = ActorStorage::open_in_memory(max_pending, 100).unwrap();
        ActorMessageQueue::new(storage, 3)
    }

    fn message(priority: u8) -> ActorMessage {
        ActorMessage {
            id: MessageId::new(),
            src: "system.init".to_string(),
            src_node: "node-a".to_string(),
            dst: "feed.sync".to_string(),
            dst_node: "node-a".to_string(),
            content: serde_json::Value::Null,
            priority: Priority(priority),
            is_ask: false,
            require_ack: false,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_fifo_within_priority_class() {
        let queue = queue(16);
        let messages: Vec<_> = (0..8).map(|_| message(100)).collect();
        for msg in &messages {
            queue.enqueue(msg.clone()).unwrap();
        }

        for expected in &messages {
            let got = queue.dequeue().await;
            assert_eq!(got.id, expected.id);
        }
    }

    #[tokio::test]
    async fn test_strict_priority_across_classes() {
        let queue = queue(16);
        let low = message(200);
        let high = message(0);
        let mid = message(100);
        queue.enqueue(low.clone()).unwrap();
        queue.enqueue(high.clone()).unwrap();
        queue.enqueue(mid.clone()).unwrap();

        assert_eq!(queue.dequeue().await.id, high.id);
        assert_eq!(queue.dequeue().await.id, mid.id);
        assert_eq!(queue.dequeue().await.id, low.id);
    }

    #[test]
    fn test_enqueue_full_is_backpressure() {
        let queue = queue(1);
        queue.enqueue(message(100)).unwrap();

        let err = queue.enqueue(message(100)).unwrap_err();
        assert!(matches!(err, QueueError::Full));
        assert_eq!(queue.pending_len().unwrap(), 1);
    }

    #[test]
    fn test_enqueue_duplicate_id() {
        let queue = queue(16);
        let msg = message(100);
        queue.enqueue(msg.clone()).unwrap();

        let err = queue.enqueue(msg.clone()).unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id == msg.id));
        assert_eq!(queue.pending_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = Arc::new(queue(16));
        let msg = message(100);
        let expected = msg.id;

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.dequeue().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.enqueue(msg).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, expected);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_back_of_class() {
        let queue = queue(16);
        let first = message(100);
        let second = message(100);
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        let mut retried = queue.dequeue().await;
        assert_eq!(retried.id, first.id);
        retried.retry_count += 1;
        queue.requeue(retried).unwrap();

        assert_eq!(queue.dequeue().await.id, second.id);
        let recycled = queue.dequeue().await;
        assert_eq!(recycled.id, first.id);
        assert_eq!(recycled.retry_count, 1);
    }

    #[tokio::test]
    async fn test_mark_done_idempotent_through_queue() {
        let queue = queue(16);
        let msg = message(100);
        queue.enqueue(msg.clone()).unwrap();
        let _ = queue.dequeue().await;

        assert!(queue.mark_done(&msg.id, DoneStatus::Done).unwrap());
        assert!(!queue.mark_done(&msg.id, DoneStatus::Done).unwrap());
        assert_eq!(queue.done_len().unwrap(), 1);
        assert_eq!(queue.pending_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_republishes_pending() {
        let storage = ActorStorage::open_in_memory(16, 100).unwrap();
        let a = message(100);
        let b = message(0);
        storage.append(&a).unwrap();
        storage.append(&b).unwrap();

        let queue = ActorMessageQueue::new(storage, 3);
        assert_eq!(queue.recover().unwrap(), 2);

        // priority order applies to recovered messages too
        assert_eq!(queue.dequeue().await.id, b.id);
        assert_eq!(queue.dequeue().await.id, a.id);
    }

    #[test]
    fn test_compact_withdraws_exhausted_messages() {
        let queue = queue(16);
        let mut msg = message(100);
        msg.retry_count = 4;
        queue.enqueue(msg.clone()).unwrap();

        let stats = queue.compact().unwrap();
        assert_eq!(stats.failed_pending, vec![msg.id]);
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.done_status(&msg.id).unwrap(), Some(DoneStatus::Failed));
    }
}
