//! Control plane server

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::common::{shutdown_signal, ControlConfig, Error, NodeId, Result};
use crate::control::broadcast::MembershipBroadcaster;
use crate::control::http::{create_router, ControlState};
use crate::control::index::PrimaryIndex;
use crate::control::registry::WorkerRegistry;

/// Sweep for silent workers; broadcast on change, otherwise re-push the
/// current snapshot to workers that missed it.
pub fn spawn_monitor(
    registry: Arc<WorkerRegistry>,
    broadcaster: Arc<MembershipBroadcaster>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let report = match registry.sweep() {
                Some(snapshot) => broadcaster.broadcast(&snapshot).await,
                None => broadcaster.resync(&registry.snapshot()).await,
            };
            if report.failed > 0 {
                debug!("Membership push: {:?}", report);
            }
        }
    })
}

pub struct ControlPlane {
    config: ControlConfig,
}

impl ControlPlane {
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        info!("Starting control plane");
        info!("  HTTP API: {}", self.config.bind_addr);
        info!("  Configured workers: {:?}", self.config.workers);
        info!("  Heartbeat timeout: {:?}", self.config.heartbeat_timeout());

        let registry = Arc::new(WorkerRegistry::new(
            self.config.workers.iter().map(NodeId::new),
            self.config.heartbeat_timeout(),
        ));
        let broadcaster = Arc::new(MembershipBroadcaster::new(self.config.rpc_timeout())?);
        let client = Client::builder()
            .timeout(self.config.rpc_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        let monitor = spawn_monitor(
            registry.clone(),
            broadcaster.clone(),
            self.config.monitor_interval(),
        );

        let router = create_router(ControlState {
            registry,
            index: Arc::new(PrimaryIndex::new()),
            broadcaster,
            client,
        });

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("✓ Control plane ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        monitor.abort();
        served?;

        info!("Control plane stopped");
        Ok(())
    }
}
