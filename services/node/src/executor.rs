//! Concurrent message dispatch.
//!
//! A fixed pool of workers drains the queue and drives each message through
//! the state machine:
//!
//! ```text
//! PENDING → DISPATCHED → { DONE
//!                        | FAILED(retryable) → PENDING
//!                        | FAILED(terminal) }
//! ```
//!
//! Handler errors and panics never crash a worker: each handler call runs
//! on its own task, and the outcome is classified retryable vs terminal and
//! routed through the machine. For messages requiring acknowledgment (asks,
//! or tells flagged `require_ack`) a dispatch that produces no ack within
//! `ack_timeout` counts as a retryable failure; plain tells run to
//! completion.
//! Timer actors are re-enqueued as self-addressed messages on a fixed
//! schedule, so periodic background work (gossip, compaction) flows through
//! the same pipeline as external traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use hornet_wire::{ActorMessage, Priority, ReplyContent};

use crate::actor::{ActorDescriptor, ActorSet};
use crate::client::AskRegistry;
use crate::queue::ActorMessageQueue;
use crate::registry::{ActorRegistry, NewMessage};
use crate::sender::MessageSender;
use crate::storage::DoneStatus;

/// How long shutdown waits for a worker to finish its in-flight message
/// before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Everything a worker needs to dispatch one message.
struct DispatchContext {
    actors: Arc<ActorSet>,
    queue: Arc<ActorMessageQueue>,
    registry: Arc<ActorRegistry>,
    sender: Arc<MessageSender>,
    asks: Arc<AskRegistry>,
    ack_timeout: Duration,
    max_retry_count: u32,
}

/// Fixed-size worker pool plus the timer schedulers.
pub struct ActorExecutor {
    ctx: Arc<DispatchContext>,
    concurrency: usize,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ActorExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actors: Arc<ActorSet>,
        queue: Arc<ActorMessageQueue>,
        registry: Arc<ActorRegistry>,
        sender: Arc<MessageSender>,
        asks: Arc<AskRegistry>,
        concurrency: usize,
        ack_timeout: Duration,
        max_retry_count: u32,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx: Arc::new(DispatchContext {
                actors,
                queue,
                registry,
                sender,
                asks,
                ack_timeout,
                max_retry_count,
            }),
            concurrency,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spin up the worker pool and timer schedulers. Calling twice is a
    /// logged no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Executor already started");
            return;
        }

        let mut tasks = self.tasks.lock().expect("executor lock poisoned");

        for worker_id in 0..self.concurrency {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(worker_loop(ctx, worker_id, shutdown)));
        }

        let timers = self.ctx.actors.timer_actors();
        let timer_count = timers.len();
        for actor in timers {
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(timer_loop(ctx, actor, shutdown)));
        }

        info!(
            workers = self.concurrency,
            timers = timer_count,
            "Executor started"
        );
    }

    /// Graceful drain: workers finish their in-flight message, start no new
    /// dequeues, and are joined (aborted after a grace period).
    pub async fn shutdown(&self) {
        info!("Executor shutting down");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("executor lock poisoned"));
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Worker did not stop within grace period, aborting");
                task.abort();
            }
        }
    }
}

async fn worker_loop(ctx: Arc<DispatchContext>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(worker_id, "Executor worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            msg = ctx.queue.dequeue() => {
                ctx.dispatch(msg).await;
            }
        }
    }
    debug!(worker_id, "Executor worker stopped");
}

async fn timer_loop(
    ctx: Arc<DispatchContext>,
    actor: Arc<ActorDescriptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(interval) = actor.timer_interval() else {
        return;
    };

    debug!(actor = %actor.name(), interval_ms = interval.as_millis(), "Timer scheduler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let current = ctx.registry.current_node().name.clone();
                let new = NewMessage::new(actor.name(), actor.name())
                    .to_node(current)
                    .priority(Priority::SYSTEM);
                match ctx.registry.create_message(new) {
                    Ok(msg) => {
                        if let Err(e) = ctx.queue.enqueue(msg) {
                            warn!(actor = %actor.name(), error = %e, "Timer tick rejected by queue, skipping");
                        }
                    }
                    Err(e) => {
                        warn!(actor = %actor.name(), error = %e, "Failed to create timer message");
                    }
                }
            }
        }
    }
    debug!(actor = %actor.name(), "Timer scheduler stopped");
}

impl DispatchContext {
    async fn dispatch(&self, msg: ActorMessage) {
        let Some(actor) = self.actors.get(&msg.dst) else {
            self.terminal_failure(msg, "no handler registered for actor".to_string())
                .await;
            return;
        };
        let actor = Arc::clone(actor);

        if let Some(schema) = actor.input_schema() {
            if let Err(e) = schema.validate(&msg.content) {
                let detail = format!("input schema violation: {e}");
                self.terminal_failure(msg, detail).await;
                return;
            }
        }

        debug!(
            message_id = %msg.id,
            dst = %msg.dst,
            retry_count = msg.retry_count,
            "Dispatching message"
        );

        // The handler runs on its own task so a panic is contained and
        // classified instead of unwinding through the worker.
        let handler = Arc::clone(actor.handler());
        let input = msg.clone();
        let mut call = tokio::spawn(async move { handler.handle(&input).await });

        let joined = if msg.needs_ack() {
            match tokio::time::timeout(self.ack_timeout, &mut call).await {
                Ok(joined) => joined,
                Err(_) => {
                    call.abort();
                    let detail = format!("no ack within {:?}", self.ack_timeout);
                    self.retryable_failure(msg, detail).await;
                    return;
                }
            }
        } else {
            (&mut call).await
        };

        match joined {
            Ok(Ok(output)) => {
                if let (Some(schema), Some(value)) = (actor.output_schema(), output.as_ref()) {
                    if let Err(e) = schema.validate(value) {
                        let detail = format!("output schema violation: {e}");
                        self.terminal_failure(msg, detail).await;
                        return;
                    }
                }
                self.complete(msg, output).await;
            }
            Ok(Err(e)) if e.is_terminal() => {
                self.terminal_failure(msg, e.to_string()).await;
            }
            Ok(Err(e)) => {
                self.retryable_failure(msg, e.to_string()).await;
            }
            Err(join) => {
                let detail = if join.is_panic() {
                    "handler panicked".to_string()
                } else {
                    "handler task cancelled".to_string()
                };
                self.retryable_failure(msg, detail).await;
            }
        }
    }

    async fn complete(&self, msg: ActorMessage, output: Option<Value>) {
        if msg.is_ask {
            let content = ReplyContent::Result(output.unwrap_or(Value::Null));
            self.deliver_reply(&msg, content).await;
        }
        if let Err(e) = self.queue.mark_done(&msg.id, DoneStatus::Done) {
            error!(message_id = %msg.id, error = %e, "Failed to record completion");
        }
    }

    async fn retryable_failure(&self, mut msg: ActorMessage, detail: String) {
        msg.retry_count += 1;
        if msg.retry_count < self.max_retry_count {
            warn!(
                message_id = %msg.id,
                dst = %msg.dst,
                retry_count = msg.retry_count,
                detail = %detail,
                "Handler failed, re-enqueueing"
            );
            if let Err(e) = self.queue.requeue(msg) {
                error!(error = %e, "Failed to requeue message");
            }
        } else {
            self.terminal_failure(msg, format!("retry budget exhausted: {detail}"))
                .await;
        }
    }

    async fn terminal_failure(&self, msg: ActorMessage, detail: String) {
        error!(
            message_id = %msg.id,
            dst = %msg.dst,
            retry_count = msg.retry_count,
            detail = %detail,
            "Message permanently failed"
        );
        if msg.is_ask {
            self.deliver_reply(&msg, ReplyContent::Error(detail)).await;
        }
        if let Err(e) = self.queue.mark_done(&msg.id, DoneStatus::Failed) {
            error!(message_id = %msg.id, error = %e, "Failed to record permanent failure");
        }
    }

    /// Replies share the ask's id; the receiver correlates by id. Local
    /// askers are resolved directly, remote ones through the sender.
    async fn deliver_reply(&self, msg: &ActorMessage, content: ReplyContent) {
        let reply = ActorMessage {
            id: msg.id,
            src: msg.dst.clone(),
            src_node: self.registry.current_node().name.clone(),
            dst: msg.src.clone(),
            dst_node: msg.src_node.clone(),
            content: content.into_value(),
            priority: Priority::SYSTEM,
            is_ask: false,
            require_ack: false,
            retry_count: 0,
        };

        if self.registry.is_local(&reply.dst_node) {
            let id = reply.id;
            self.asks.resolve(&id, reply);
        } else if let Err(e) = self.sender.send(&reply, true).await {
            warn!(message_id = %msg.id, error = %e, "Failed to deliver ask reply");
        }
    }
}
