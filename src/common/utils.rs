//! Utility functions for replikv

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Worker liveness as tracked by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Registered, never heard from
    Unknown,
    Alive,
    Dead,
}

impl NodeState {
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeState::Alive)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Unknown => write!(f, "unknown"),
            NodeState::Alive => write!(f, "alive"),
            NodeState::Dead => write!(f, "dead"),
        }
    }
}

/// Retry with a fixed interval and a fixed attempt budget.
///
/// Non-retryable errors end the loop immediately.
pub async fn retry_fixed<F, Fut, T>(
    mut f: F,
    attempts: u32,
    interval: Duration,
) -> crate::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut last_err = None;

    for attempt in 1..=attempts {
        match f(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    "Attempt {}/{} failed: {}, retrying in {:?}",
                    attempt,
                    attempts,
                    e,
                    interval
                );
                last_err = Some(e);
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| crate::Error::Internal("retry budget is zero".into())))
}

/// Resolves on Ctrl-C; used for graceful server shutdown.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate key (must be non-empty, reasonable length)
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidRequest("key cannot be empty".into()));
    }

    if key.len() > 1024 {
        return Err(crate::Error::InvalidRequest(
            "key too long (max 1024 bytes)".into(),
        ));
    }

    if key.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidRequest(
            "key contains invalid characters".into(),
        ));
    }

    Ok(())
}
