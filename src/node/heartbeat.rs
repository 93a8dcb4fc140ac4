//! Periodic liveness report to the control plane

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::common::NodeId;
use crate::node::transport::ControlPlaneClient;

pub fn spawn_heartbeat(
    control: Arc<dyn ControlPlaneClient>,
    node: NodeId,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut failures = 0u32;
        loop {
            ticker.tick().await;
            match control.heartbeat(&node).await {
                Ok(()) => {
                    if failures > 0 {
                        debug!("Heartbeat restored after {} failures", failures);
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    // Log the first failure and then every tenth
                    if failures == 1 || failures % 10 == 0 {
                        warn!("Heartbeat to control plane failed ({}x): {}", failures, e);
                    }
                }
            }
        }
    })
}
