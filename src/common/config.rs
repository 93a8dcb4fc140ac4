//! Configuration for replikv components
//!
//! Loaded from an optional `replikv.toml` plus `REPLIKV__*` environment
//! variables; binaries override individual fields from their CLI flags.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::Result;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage node config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeConfig>,

    /// Control plane config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: None,
            control: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `replikv.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("replikv").required(false))
            .add_source(config::Environment::with_prefix("REPLIKV").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Outbox fsync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every append
    Always,
    /// flush to the OS after every append
    Interval,
    /// leave buffering to the writer
    Never,
}

/// What a failover repair does when replica creation fails mid-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Keep the record with a null role slot; the recovery pass repairs it later.
    LeaveDegraded,
    /// Remove the local record when a promotion cannot create its replicas.
    DropRecord,
}

/// Replication coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Attempts per synchronous replication before the write fails
    pub sync_attempts: u32,

    /// Fixed spacing between synchronous replication attempts
    pub sync_retry_interval_ms: u64,

    /// Per-call timeout for node-to-node RPCs
    pub rpc_timeout_ms: u64,

    pub failover_policy: FailoverPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sync_attempts: 4,
            sync_retry_interval_ms: 500,
            rpc_timeout_ms: 2_000,
            failover_policy: FailoverPolicy::LeaveDegraded,
        }
    }
}

impl ReplicationConfig {
    pub fn sync_retry_interval(&self) -> Duration {
        Duration::from_millis(self.sync_retry_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Advertised address; doubles as the node identity
    pub node_id: String,

    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Control plane base URL
    pub control_url: String,

    /// Durable async replication outbox
    pub outbox_path: PathBuf,

    pub outbox_sync: SyncPolicy,

    pub replication: ReplicationConfig,

    pub heartbeat_interval_ms: u64,

    /// Membership changes arriving within this window are coalesced into one pass
    pub reconcile_debounce_ms: u64,

    pub async_dispatch_interval_ms: u64,

    /// Delivery attempts per async entry before it is dropped
    pub async_max_attempts: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "http://127.0.0.1:7001".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7001)),
            control_url: "http://127.0.0.1:7000".to_string(),
            outbox_path: PathBuf::from("./node-data/outbox.log"),
            outbox_sync: SyncPolicy::Interval,
            replication: ReplicationConfig::default(),
            heartbeat_interval_ms: 2_000,
            reconcile_debounce_ms: 250,
            async_dispatch_interval_ms: 200,
            async_max_attempts: 8,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_ms)
    }

    pub fn async_dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.async_dispatch_interval_ms)
    }

    /// Reject settings that would make the retry budget meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.replication.sync_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "sync_attempts must be at least 1".into(),
            ));
        }
        if self.async_max_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "async_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Workers known at startup (their advertised URLs)
    pub workers: Vec<String>,

    /// Silence after which a worker is declared dead
    pub heartbeat_timeout_ms: u64,

    pub monitor_interval_ms: u64,

    pub rpc_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            workers: Vec::new(),
            heartbeat_timeout_ms: 10_000,
            monitor_interval_ms: 1_000,
            rpc_timeout_ms: 2_000,
        }
    }
}

impl ControlConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
