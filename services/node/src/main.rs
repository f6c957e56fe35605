//! Hornet node binary.
//!
//! Runs a bare node: the built-in system actors plus whatever the
//! configuration seeds it with. Embedders use [`hornet_node::ActorNode`]
//! directly to register their own actors.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hornet_node::{ActorNode, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node = %config.node_name(),
        port = config.port,
        concurrency = config.concurrency,
        storage = ?config.storage_path,
        peers = config.registry_seed.len(),
        "Starting hornet node"
    );

    let node = Arc::new(ActorNode::builder(config).build()?);
    node.run().await
}
