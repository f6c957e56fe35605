//! Node assembly and lifecycle.
//!
//! [`ActorNode`] wires the registry, mailbox, executor, and both transport
//! halves together and owns the process lifecycle: recover the mailbox,
//! bind the receiver, start the workers, emit the startup message, run
//! until a shutdown signal, then tear down in reverse order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hornet_wire::Priority;

use crate::actor::{ActorDescriptor, ActorSet};
use crate::builtin::{builtin_actors, ACTOR_INIT, SYSTEM_MODULE};
use crate::client::{ActorClient, AskRegistry, ClientError};
use crate::config::Config;
use crate::executor::ActorExecutor;
use crate::queue::ActorMessageQueue;
use crate::receiver::MessageReceiver;
use crate::registry::{ActorRegistry, NewMessage, NodeSpec};
use crate::sender::MessageSender;
use crate::storage::ActorStorage;

/// User code run at node startup (after the pipeline is live) or shutdown
/// (after the executor has drained, before the server stops).
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn run(&self, client: &ActorClient) -> Result<()>;
}

/// Builder for [`ActorNode`].
pub struct NodeBuilder {
    config: Config,
    actors: Vec<ActorDescriptor>,
    startup_hooks: Vec<Box<dyn LifecycleHook>>,
    shutdown_hooks: Vec<Box<dyn LifecycleHook>>,
}

impl NodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            actors: Vec::new(),
            startup_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
        }
    }

    /// Register an actor on this node.
    #[must_use]
    pub fn actor(mut self, descriptor: ActorDescriptor) -> Self {
        self.actors.push(descriptor);
        self
    }

    /// Run after the node is fully started. A hook failure aborts startup.
    #[must_use]
    pub fn on_startup(mut self, hook: impl LifecycleHook + 'static) -> Self {
        self.startup_hooks.push(Box::new(hook));
        self
    }

    /// Run during teardown, after the executor has stopped. Failures are
    /// logged, never fatal.
    #[must_use]
    pub fn on_shutdown(mut self, hook: impl LifecycleHook + 'static) -> Self {
        self.shutdown_hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<ActorNode> {
        let config = self.config;
        let node_name = config.node_name();

        let mut modules: BTreeSet<String> = self
            .actors
            .iter()
            .map(|d| d.module().to_string())
            .collect();
        modules.insert(SYSTEM_MODULE.to_string());

        let mut networks = config.networks.clone();
        networks.push(config.localhost_network());

        let current = NodeSpec {
            name: node_name,
            modules,
            networks,
        };
        let registry = Arc::new(ActorRegistry::new(current, config.registry_seed.clone()));

        let storage = match &config.storage_path {
            Some(path) => ActorStorage::open(
                path,
                config.storage_max_pending_size,
                config.storage_max_done_size,
            )
            .with_context(|| format!("failed to open mailbox storage at {}", path.display()))?,
            None => ActorStorage::open_in_memory(
                config.storage_max_pending_size,
                config.storage_max_done_size,
            )
            .context("failed to open in-memory mailbox storage")?,
        };
        let queue = Arc::new(ActorMessageQueue::new(storage, config.max_retry_count));

        let asks = Arc::new(AskRegistry::new());
        let sender = Arc::new(MessageSender::new(
            Arc::clone(&registry),
            config.token.clone(),
        ));

        let mut actors = self.actors;
        actors.extend(builtin_actors(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&sender),
            config.gossip_interval,
            config.storage_compact_interval,
        ));
        let actors = Arc::new(ActorSet::new(actors).context("invalid actor set")?);

        let executor = ActorExecutor::new(
            Arc::clone(&actors),
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&sender),
            Arc::clone(&asks),
            config.concurrency,
            config.ack_timeout,
            config.max_retry_count,
        );
        let client = ActorClient::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&sender),
            Arc::clone(&asks),
            config.ack_timeout,
        );
        let receiver = MessageReceiver::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&asks),
            config.token.as_deref(),
            config.subpath.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(ActorNode {
            config,
            registry,
            queue,
            asks,
            client,
            executor,
            receiver,
            shutdown_tx,
            startup_hooks: self.startup_hooks,
            shutdown_hooks: self.shutdown_hooks,
        })
    }
}

/// One running actor host.
pub struct ActorNode {
    config: Config,
    registry: Arc<ActorRegistry>,
    queue: Arc<ActorMessageQueue>,
    asks: Arc<AskRegistry>,
    client: ActorClient,
    executor: ActorExecutor,
    receiver: MessageReceiver,
    shutdown_tx: watch::Sender<bool>,
    startup_hooks: Vec<Box<dyn LifecycleHook>>,
    shutdown_hooks: Vec<Box<dyn LifecycleHook>>,
}

impl ActorNode {
    pub fn builder(config: Config) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// This node's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.registry.current_node().name
    }

    #[must_use]
    pub fn client(&self) -> &ActorClient {
        &self.client
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<ActorMessageQueue> {
        &self.queue
    }

    /// Fire-and-forget send.
    pub async fn tell(&self, new: NewMessage) -> Result<(), ClientError> {
        let msg = self.registry.create_message(new)?;
        self.client.tell(msg).await
    }

    /// Send and block for the correlated reply.
    pub async fn ask(&self, new: NewMessage) -> Result<Value, ClientError> {
        let mut new = new;
        new.is_ask = true;
        let msg = self.registry.create_message(new)?;
        self.client.ask(msg).await
    }

    /// Request shutdown from another task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the node until a shutdown signal, then tear down: stop accepting
    /// dequeues, drain in-flight work, run shutdown hooks, fail outstanding
    /// asks, stop the server.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.queue.recover().context("mailbox recovery failed")?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(addr = %addr, node = %self.name(), "Receiver listening");

        let router = self.receiver.router();
        let mut server_shutdown = self.shutdown_tx.subscribe();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                    info!("HTTP server shutting down");
                })
                .await
        });

        self.executor.start();

        // the startup message is the first thing the pipeline processes
        let init = self.registry.create_message(
            NewMessage::new(ACTOR_INIT, ACTOR_INIT)
                .to_node(self.name().to_string())
                .priority(Priority::SYSTEM),
        )?;
        if let Err(e) = self.queue.enqueue(init) {
            warn!(error = %e, "Failed to enqueue startup message");
        }

        let mut startup_error: Option<anyhow::Error> = None;
        for hook in &self.startup_hooks {
            if let Err(e) = hook.run(&self.client).await {
                startup_error = Some(e.context("startup hook failed"));
                break;
            }
        }

        let mut server_done = false;
        if let Some(e) = &startup_error {
            error!(error = %e, "Startup aborted");
        } else {
            info!(node = %self.name(), "Actor node started");
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            if *shutdown_rx.borrow_and_update() {
                info!("Shutdown requested");
            } else {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Shutdown requested");
                    }
                    result = &mut server => {
                        server_done = true;
                        match result {
                            Ok(Ok(())) => info!("HTTP server exited"),
                            Ok(Err(e)) => error!(error = %e, "HTTP server error"),
                            Err(e) => error!(error = %e, "HTTP server task panicked"),
                        }
                    }
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        self.executor.shutdown().await;

        for hook in &self.shutdown_hooks {
            if let Err(e) = hook.run(&self.client).await {
                error!(error = %e, "Shutdown hook failed");
            }
        }

        self.asks.drain();

        if !server_done {
            match tokio::time::timeout(Duration::from_secs(5), &mut server).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
                Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
                Err(_) => {
                    warn!("HTTP server did not stop in time, aborting");
                    server.abort();
                }
            }
        }

        info!(node = %self.name(), "Actor node shutdown complete");
        match startup_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Handler, HandlerError};
    use crate::builtin::{ACTOR_COMPACT, ACTOR_GOSSIP};
    use crate::storage::DoneStatus;
    use hornet_wire::ActorMessage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
            Ok(Some(msg.content.clone()))
        }
    }

    struct CountingHook {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn run(&self, _client: &ActorClient) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quiet_config() -> Config {
        // port 0 binds an ephemeral port; these tests only exercise the
        // local pipeline
        Config {
            port: 0,
            concurrency: 2,
            gossip_interval: Duration::from_secs(3600),
            storage_compact_interval: Duration::from_secs(3600),
            ..Config::default()
        }
    }

    #[test]
    fn test_build_registers_builtin_actors() {
        let node = ActorNode::builder(quiet_config())
            .actor(ActorDescriptor::new("echo.echo", Echo))
            .build()
            .unwrap();

        let modules = &node.registry.current_node().modules;
        assert!(modules.contains("echo"));
        assert!(modules.contains(SYSTEM_MODULE));
        for name in [ACTOR_INIT, ACTOR_GOSSIP, ACTOR_COMPACT] {
            assert!(node.registry.current_node().hosts_actor(name));
        }
    }

    #[test]
    fn test_build_rejects_duplicate_actor() {
        let result = ActorNode::builder(quiet_config())
            .actor(ActorDescriptor::new("echo.echo", Echo))
            .actor(ActorDescriptor::new("echo.echo", Echo))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_default_name_derives_from_port() {
        let config = Config {
            port: 9123,
            ..quiet_config()
        };
        let node = ActorNode::builder(config).build().unwrap();
        assert_eq!(node.name(), "actor-9123");
    }

    #[tokio::test]
    async fn test_run_processes_local_messages_and_stops() {
        let node = Arc::new(
            ActorNode::builder(quiet_config())
                .actor(ActorDescriptor::new("echo.echo", Echo))
                .build()
                .unwrap(),
        );

        let runner = tokio::spawn(Arc::clone(&node).run());

        let value = loop {
            match node
                .ask(NewMessage::new("test.driver", "echo.echo").content(json!({"ping": 1})))
                .await
            {
                Ok(value) => break value,
                // the executor may not be up yet on the first attempts
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        assert_eq!(value, json!({"ping": 1}));

        node.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_emits_startup_message() {
        let node = Arc::new(ActorNode::builder(quiet_config()).build().unwrap());
        let runner = tokio::spawn(Arc::clone(&node).run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while node.queue.done_len().unwrap() == 0 {
            assert!(Instant::now() < deadline, "startup message never processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        node.shutdown();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hooks_run_in_lifecycle_order() {
        let startup_calls = Arc::new(AtomicUsize::new(0));
        let shutdown_calls = Arc::new(AtomicUsize::new(0));

        let node = Arc::new(
            ActorNode::builder(quiet_config())
                .on_startup(CountingHook {
                    calls: Arc::clone(&startup_calls),
                })
                .on_shutdown(CountingHook {
                    calls: Arc::clone(&shutdown_calls),
                })
                .build()
                .unwrap(),
        );

        let runner = tokio::spawn(Arc::clone(&node).run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while startup_calls.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "startup hook never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 0);

        node.shutdown();
        runner.await.unwrap().unwrap();
        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_startup_hook_aborts_run() {
        struct FailingHook;

        #[async_trait]
        impl LifecycleHook for FailingHook {
            async fn run(&self, _client: &ActorClient) -> Result<()> {
                anyhow::bail!("refusing to start")
            }
        }

        let node = Arc::new(
            ActorNode::builder(quiet_config())
                .on_startup(FailingHook)
                .build()
                .unwrap(),
        );
        let result = Arc::clone(&node).run().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tell_completes_fire_and_forget() {
        let node = Arc::new(
            ActorNode::builder(quiet_config())
                .actor(ActorDescriptor::new("echo.echo", Echo))
                .build()
                .unwrap(),
        );
        let runner = tokio::spawn(Arc::clone(&node).run());

        let msg = node
            .registry
            .create_message(NewMessage::new("test.driver", "echo.echo").content(json!({"n": 7})))
            .unwrap();
        let id = msg.id;
        node.client.tell(msg).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while node.queue.done_status(&id).unwrap() != Some(DoneStatus::Done) {
            assert!(Instant::now() < deadline, "message never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        node.shutdown();
        runner.await.unwrap().unwrap();
    }
}
