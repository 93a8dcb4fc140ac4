//! Common utilities and types shared across replikv

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod node_id;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    Config, ControlConfig, FailoverPolicy, NodeConfig, ReplicationConfig, SyncPolicy,
};
pub use error::{Error, Result};
pub use hash::{candidates_for, key_hash, placement_for, ring_after, Placement, REPLICA_SLOTS};
pub use metrics::{MetricsRegistry, METRICS};
pub use node_id::NodeId;
pub use utils::{
    crc32, retry_fixed, shutdown_signal, timestamp_now_millis, validate_key, NodeState,
};
