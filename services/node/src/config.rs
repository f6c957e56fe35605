//! Configuration for an actor node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::registry::NodeSpec;

/// Actor node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the receiver binds to.
    pub host: String,

    /// Port the receiver binds to.
    pub port: u16,

    /// Number of executor workers.
    pub concurrency: usize,

    /// Node identity; defaults to `actor-{port}` when unset.
    pub name: Option<String>,

    /// URL prefix for the receiver endpoint ("" or "/prefix").
    pub subpath: String,

    /// Extra reachable endpoints for this node, most-preferred first.
    /// The localhost endpoint is always appended at startup.
    pub networks: Vec<String>,

    /// Seed peer specs merged into the registry at construction.
    pub registry_seed: Vec<NodeSpec>,

    /// Storage location; `None` keeps the mailbox in memory (the
    /// non-durable configuration of the same core).
    pub storage_path: Option<PathBuf>,

    /// Capacity of the pending set; enqueue beyond this is backpressure.
    pub storage_max_pending_size: usize,

    /// Capacity of the done set retained for dedupe/audit.
    pub storage_max_done_size: usize,

    /// How often compaction evicts stale done entries.
    pub storage_compact_interval: Duration,

    /// How often topology gossip is broadcast to peers.
    pub gossip_interval: Duration,

    /// Budget for a dispatch to be acknowledged, and the default ask budget.
    pub ack_timeout: Duration,

    /// Retry budget before a message is marked permanently failed.
    pub max_retry_count: u32,

    /// Shared auth token; `None` disables the check (trusted networks only).
    pub token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            concurrency: 100,
            name: None,
            subpath: String::new(),
            networks: Vec::new(),
            registry_seed: Vec::new(),
            storage_path: None,
            storage_max_pending_size: 100,
            storage_max_done_size: 1000,
            storage_compact_interval: Duration::from_secs(60),
            gossip_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(180),
            max_retry_count: 3,
            token: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `HORNET_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let registry_seed = match std::env::var("HORNET_REGISTRY_SEED") {
            Ok(raw) => serde_json::from_str(&raw)
                .context("HORNET_REGISTRY_SEED is not a JSON array of node specs")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            host: env_or("HORNET_HOST", defaults.host),
            port: env_parse("HORNET_PORT", defaults.port),
            concurrency: env_parse("HORNET_CONCURRENCY", defaults.concurrency),
            name: std::env::var("HORNET_NAME").ok(),
            subpath: env_or("HORNET_SUBPATH", defaults.subpath),
            networks: std::env::var("HORNET_NETWORKS")
                .map(|s| {
                    s.split(',')
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            registry_seed,
            storage_path: std::env::var("HORNET_STORAGE_PATH").ok().map(PathBuf::from),
            storage_max_pending_size: env_parse(
                "HORNET_STORAGE_MAX_PENDING_SIZE",
                defaults.storage_max_pending_size,
            ),
            storage_max_done_size: env_parse(
                "HORNET_STORAGE_MAX_DONE_SIZE",
                defaults.storage_max_done_size,
            ),
            storage_compact_interval: Duration::from_secs(env_parse(
                "HORNET_STORAGE_COMPACT_INTERVAL",
                defaults.storage_compact_interval.as_secs(),
            )),
            gossip_interval: Duration::from_secs(env_parse(
                "HORNET_GOSSIP_INTERVAL",
                defaults.gossip_interval.as_secs(),
            )),
            ack_timeout: Duration::from_secs(env_parse(
                "HORNET_ACK_TIMEOUT",
                defaults.ack_timeout.as_secs(),
            )),
            max_retry_count: env_parse("HORNET_MAX_RETRY_COUNT", defaults.max_retry_count),
            token: std::env::var("HORNET_TOKEN").ok(),
            log_level: env_or("HORNET_LOG_LEVEL", defaults.log_level),
        })
    }

    /// The node's identity, defaulting to a port-derived name.
    #[must_use]
    pub fn node_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("actor-{}", self.port))
    }

    /// The node's own localhost endpoint, appended to its network list.
    #[must_use]
    pub fn localhost_network(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.subpath)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
