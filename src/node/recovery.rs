//! Recovery reconciliation
//!
//! Runs when membership grows. Only records this node is PRIMARY for are
//! touched: a missing sync is filled once 2+ nodes are alive, a missing
//! async once 3+ are. Failures leave the record as it was.

use std::sync::Arc;
use tracing::{info, warn};

use crate::common::METRICS;
use crate::node::replication::ReplicationCoordinator;
use crate::node::store::{KeyRecord, Role, Topology};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub examined: usize,
    pub sync_restored: usize,
    pub async_restored: usize,
    pub failed: usize,
}

pub struct RecoveryReconciler {
    coordinator: Arc<ReplicationCoordinator>,
}

impl RecoveryReconciler {
    pub fn new(coordinator: Arc<ReplicationCoordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let store = self.coordinator.store().clone();

        for key in store.keys() {
            let _guard = store.lock(&key).await;
            let Some(record) = store.get(&key) else {
                continue;
            };
            if record.role != Role::Primary {
                continue;
            }
            report.examined += 1;
            self.restore(record, &mut report).await;
        }

        if report.sync_restored + report.async_restored + report.failed > 0 {
            info!(
                "Recovery pass: {} sync restored, {} async restored, {} failed",
                report.sync_restored, report.async_restored, report.failed
            );
        }
        report
    }

    async fn restore(&self, record: KeyRecord, report: &mut RecoveryReport) {
        let live = self.coordinator.membership().live_count();
        let topology = &record.topology;

        let next: Topology = if topology.sync.is_none() && live >= 2 {
            let existing_async = topology.asynchronous.clone();
            match self
                .coordinator
                .create_replicas(&record.key, &record.value, existing_async.as_ref())
                .await
            {
                Ok(next) => {
                    self.coordinator.enqueue_async(&record.key, &record.value, &next);
                    report.sync_restored += 1;
                    if next.asynchronous.is_some() {
                        report.async_restored += 1;
                    }
                    next
                }
                Err(e) => {
                    warn!("{}: sync restore failed: {}", record.key, e);
                    report.failed += 1;
                    return;
                }
            }
        } else if topology.sync.is_some() && topology.asynchronous.is_none() && live >= 3 {
            match self
                .coordinator
                .add_async_replica(&record.key, &record.value, topology)
                .await
            {
                Ok(next) => {
                    report.async_restored += 1;
                    next
                }
                Err(e) => {
                    warn!("{}: async restore failed: {}", record.key, e);
                    report.failed += 1;
                    return;
                }
            }
        } else {
            return;
        };

        let updated = KeyRecord::new(record.key.clone(), record.value.clone(), Role::Primary, next);
        if self.coordinator.store().replace_if_unchanged(&record, updated) {
            METRICS.replication.recovery_repairs.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::{id, Harness};

    const N1: &str = "http://n1";
    const N2: &str = "http://n2";
    const N3: &str = "http://n3";

    #[tokio::test]
    async fn test_restores_missing_sync_when_node_joins() {
        let h = Harness::new(N1, &[N1]);
        h.coordinator.store().put(KeyRecord::new(
            "k",
            "v",
            Role::Primary,
            Topology::solo(id(N1)),
        ));

        h.set_alive(&[N1, N2], &[]);
        let report = RecoveryReconciler::new(h.coordinator.clone()).run().await;
        assert_eq!(report.sync_restored, 1);

        let rec = h.coordinator.read("k").unwrap();
        assert_eq!(rec.topology.sync, Some(id(N2)));
        let sent = h.peers.last_to(N2).unwrap();
        assert_eq!(sent.value, "v");
        assert_eq!(sent.primary, id(N1));
    }

    #[tokio::test]
    async fn test_restores_missing_async_with_three_nodes() {
        let h = Harness::new(N1, &[N1, N2, N3]);
        h.coordinator.store().put(KeyRecord::new(
            "k",
            "v",
            Role::Primary,
            Topology {
                primary: id(N1),
                sync: Some(id(N2)),
                asynchronous: None,
            },
        ));

        let report = RecoveryReconciler::new(h.coordinator.clone()).run().await;
        assert_eq!(report.async_restored, 1);
        assert_eq!(
            h.coordinator.read("k").unwrap().topology.asynchronous,
            Some(id(N3))
        );
        assert_eq!(h.channel.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ignores_replica_records() {
        let h = Harness::new(N2, &[N1, N2, N3]);
        h.coordinator.store().put(KeyRecord::new(
            "k",
            "v",
            Role::Sync,
            Topology {
                primary: id(N1),
                sync: Some(id(N2)),
                asynchronous: None,
            },
        ));

        let report = RecoveryReconciler::new(h.coordinator.clone()).run().await;
        assert_eq!(report.examined, 0);
        assert!(h.peers.targets().is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_record() {
        let h = Harness::new(N1, &[N1, N2]);
        let before = KeyRecord::new("k", "v", Role::Primary, Topology::solo(id(N1)));
        h.coordinator.store().put(before.clone());
        h.peers.cut(N2);

        let report = RecoveryReconciler::new(h.coordinator.clone()).run().await;
        assert_eq!(report.failed, 1);
        assert!(h.coordinator.read("k").unwrap().same_state(&before));
    }
}
