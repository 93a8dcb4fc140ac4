//! Storage node server

use std::sync::Arc;
use tracing::{error, info};

use crate::common::{shutdown_signal, NodeConfig, NodeId, Result};
use crate::node::async_replicator::AsyncReplicator;
use crate::node::heartbeat::spawn_heartbeat;
use crate::node::http::{create_router, NodeHttpState};
use crate::node::membership::{MembershipDelta, MembershipSnapshot, MembershipView};
use crate::node::outbox::Outbox;
use crate::node::reconcile::{spawn_reconcile_worker, Reconciler};
use crate::node::replication::ReplicationCoordinator;
use crate::node::store::KeyStore;
use crate::node::transport::{
    ControlPlaneClient, HttpControlPlane, HttpPeerTransport, PeerTransport,
};

/// Everything one node owns, wired together but not yet running
pub struct NodeContext {
    self_id: NodeId,
    coordinator: Arc<ReplicationCoordinator>,
    replicator: Arc<AsyncReplicator>,
    reconciler: Arc<Reconciler>,
    control: Arc<dyn ControlPlaneClient>,
}

impl NodeContext {
    /// Node backed by HTTP transports
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let timeout = config.replication.rpc_timeout();
        let peers = Arc::new(HttpPeerTransport::new(timeout)?);
        let control = Arc::new(HttpControlPlane::new(config.control_url.clone(), timeout)?);
        Self::with_transports(config, peers, control)
    }

    pub fn with_transports(
        config: &NodeConfig,
        peers: Arc<dyn PeerTransport>,
        control: Arc<dyn ControlPlaneClient>,
    ) -> Result<Self> {
        config.validate()?;

        let self_id = NodeId::new(config.node_id.clone());
        let store = Arc::new(KeyStore::new());
        let membership = Arc::new(MembershipView::new(self_id.clone()));

        let outbox = Outbox::open(&config.outbox_path, config.outbox_sync)?;
        let replicator = Arc::new(AsyncReplicator::new(
            outbox,
            peers.clone(),
            membership.clone(),
            config.async_max_attempts,
        ));

        let coordinator = Arc::new(ReplicationCoordinator::new(
            self_id.clone(),
            store,
            membership,
            peers,
            replicator.clone(),
            control.clone(),
            config.replication.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(coordinator.clone()));

        Ok(Self {
            self_id,
            coordinator,
            replicator,
            reconciler,
            control,
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.coordinator
    }

    pub fn replicator(&self) -> &Arc<AsyncReplicator> {
        &self.replicator
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        self.coordinator.membership()
    }

    pub fn apply_membership(&self, snapshot: MembershipSnapshot) -> Result<MembershipDelta> {
        self.membership().update(snapshot)
    }
}

pub struct StorageNode {
    config: NodeConfig,
}

impl StorageNode {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        info!("Starting storage node: {}", self.config.node_id);
        info!("  HTTP API: {}", self.config.bind_addr);
        info!("  Control plane: {}", self.config.control_url);
        info!("  Outbox: {}", self.config.outbox_path.display());
        info!(
            "  Failover policy: {:?}",
            self.config.replication.failover_policy
        );

        let ctx = Arc::new(NodeContext::new(&self.config)?);

        let dispatcher = ctx
            .replicator()
            .clone()
            .spawn(self.config.async_dispatch_interval());
        let (reconcile, reconcile_task) =
            spawn_reconcile_worker(ctx.reconciler().clone(), self.config.reconcile_debounce());
        let heartbeat = spawn_heartbeat(
            ctx.control.clone(),
            ctx.self_id().clone(),
            self.config.heartbeat_interval(),
        );

        let router = create_router(NodeHttpState {
            ctx: ctx.clone(),
            reconcile: Some(reconcile),
        });

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("✓ Storage node ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        heartbeat.abort();
        reconcile_task.abort();
        dispatcher.abort();
        if let Err(e) = ctx.replicator().flush() {
            error!("Failed to flush outbox on shutdown: {}", e);
        }

        served?;
        info!("Storage node stopped");
        Ok(())
    }
}
