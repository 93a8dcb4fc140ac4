//! Storage node: local records, the replication engine and its HTTP surface

pub mod async_replicator;
pub mod failover;
pub mod heartbeat;
pub mod http;
pub mod membership;
pub mod outbox;
pub mod reconcile;
pub mod recovery;
pub mod replication;
pub mod server;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use async_replicator::{AsyncReplicator, DispatchReport, ReplicationChannel};
pub use failover::{FailoverReconciler, FailoverReport, Transition};
pub use membership::{MembershipDelta, MembershipSnapshot, MembershipView};
pub use outbox::{Outbox, OutboxEntry};
pub use reconcile::{spawn_reconcile_worker, ReconcileHandle, ReconcileReport, Reconciler};
pub use recovery::{RecoveryReconciler, RecoveryReport};
pub use replication::ReplicationCoordinator;
pub use server::{NodeContext, StorageNode};
pub use store::{KeyRecord, KeyStore, Role, Topology};
pub use transport::{
    AsyncPayload, ControlPlaneClient, HttpControlPlane, HttpPeerTransport, PeerTransport,
    ReplicateRequest,
};
