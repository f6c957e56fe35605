//! Test harness for multi-node integration tests.
//!
//! Spawns full nodes on pre-picked loopback ports and waits for their
//! receivers to come up before handing them to a test.

use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use hornet_node::{
    ActorDescriptor, ActorNode, Config, Handler, HandlerError, NodeSpec,
};
use hornet_wire::ActorMessage;

/// Reserve a loopback port. The listener is dropped before the node binds,
/// which is racy in principle but reliable on a loopback-only test host.
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// The registry entry a peer would advertise for a harness node.
pub fn spec(name: &str, port: u16, modules: &[&str]) -> NodeSpec {
    NodeSpec {
        name: name.to_string(),
        modules: modules.iter().map(|m| m.to_string()).collect(),
        networks: vec![format!("http://127.0.0.1:{port}")],
    }
}

/// A config with the periodic actors parked so tests control all traffic.
pub fn quiet_config(name: &str, port: u16) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port,
        name: Some(name.to_string()),
        concurrency: 4,
        ack_timeout: Duration::from_secs(5),
        gossip_interval: Duration::from_secs(3600),
        storage_compact_interval: Duration::from_secs(3600),
        ..Config::default()
    }
}

/// Echo handler that counts invocations.
pub struct CountingEcho {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for CountingEcho {
    async fn handle(&self, msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(msg.content.clone()))
    }
}

/// Handler that parks until the test ends, pinning its message as pending.
pub struct StuckHandler;

#[async_trait]
impl Handler for StuckHandler {
    async fn handle(&self, _msg: &ActorMessage) -> Result<Option<Value>, HandlerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }
}

#[allow(dead_code)]
pub struct TestNode {
    pub node: Arc<ActorNode>,
    pub port: u16,
    runner: JoinHandle<anyhow::Result<()>>,
}

impl TestNode {
    /// Build and run a node, returning once its receiver answers health
    /// checks.
    pub async fn spawn(config: Config, actors: Vec<ActorDescriptor>) -> Self {
        let port = config.port;
        let mut builder = ActorNode::builder(config);
        for descriptor in actors {
            builder = builder.actor(descriptor);
        }
        let node = Arc::new(builder.build().unwrap());
        let runner = tokio::spawn(Arc::clone(&node).run());

        let url = format!("http://127.0.0.1:{port}/healthz");
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(response) = reqwest::get(&url).await {
                if response.status().is_success() {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "node on port {port} never came up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Self { node, port, runner }
    }

    pub async fn stop(self) {
        self.node.shutdown();
        self.runner.await.unwrap().unwrap();
    }
}

/// Poll until `condition` holds or the budget elapses.
pub async fn wait_for<F: Fn() -> bool>(condition: F, budget: Duration) {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within {budget:?}");
}
