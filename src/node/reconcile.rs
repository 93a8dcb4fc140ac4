//! Reconciliation worker
//!
//! Membership deltas arrive on a channel; bursts inside the debounce window
//! collapse into one pass. A pass runs failover over every record, then
//! recovery if any node came (back) up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::common::METRICS;
use crate::node::failover::{FailoverReconciler, FailoverReport};
use crate::node::membership::MembershipDelta;
use crate::node::recovery::{RecoveryReconciler, RecoveryReport};
use crate::node::replication::ReplicationCoordinator;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub failover: FailoverReport,
    pub recovery: Option<RecoveryReport>,
}

pub struct Reconciler {
    failover: FailoverReconciler,
    recovery: RecoveryReconciler,
    passes: AtomicU64,
    last: Mutex<Option<ReconcileReport>>,
}

impl Reconciler {
    pub fn new(coordinator: Arc<ReplicationCoordinator>) -> Self {
        Self {
            failover: FailoverReconciler::new(coordinator.clone()),
            recovery: RecoveryReconciler::new(coordinator),
            passes: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    /// One full pass. `grew` enables the recovery step.
    pub async fn pass(&self, grew: bool) -> ReconcileReport {
        METRICS.replication.reconcile_passes.inc();
        let failover = self.failover.run().await;
        let recovery = if grew {
            Some(self.recovery.run().await)
        } else {
            None
        };
        let report = ReconcileReport { failover, recovery };
        self.passes.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(report);
        }
        report
    }

    /// Passes completed since startup
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last.lock().ok().and_then(|last| *last)
    }
}

/// Sender side of the worker's queue
#[derive(Clone)]
pub struct ReconcileHandle {
    tx: mpsc::UnboundedSender<MembershipDelta>,
}

impl ReconcileHandle {
    pub fn notify(&self, delta: MembershipDelta) {
        if self.tx.send(delta).is_err() {
            debug!("Reconcile worker has stopped; delta dropped");
        }
    }
}

pub fn spawn_reconcile_worker(
    reconciler: Arc<Reconciler>,
    debounce: Duration,
) -> (ReconcileHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MembershipDelta>();

    let task = tokio::spawn(async move {
        info!("Reconcile worker started (debounce {:?})", debounce);
        while let Some(first) = rx.recv().await {
            let mut grew = first.grew();
            let mut version = first.version;

            tokio::time::sleep(debounce).await;
            while let Ok(next) = rx.try_recv() {
                grew |= next.grew();
                version = version.max(next.version);
            }

            debug!("Reconciling after membership v{} (grew: {})", version, grew);
            reconciler.pass(grew).await;
        }
    });

    (ReconcileHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::store::{KeyRecord, Role, Topology};
    use crate::node::testing::{id, Harness};

    #[tokio::test]
    async fn test_worker_runs_pass_after_delta() {
        let h = Harness::new("http://n2", &["http://n1", "http://n2", "http://n3"]);
        h.coordinator.store().put(KeyRecord::new(
            "k",
            "v",
            Role::Sync,
            Topology {
                primary: id("http://n1"),
                sync: Some(id("http://n2")),
                asynchronous: Some(id("http://n3")),
            },
        ));

        let reconciler = Arc::new(Reconciler::new(h.coordinator.clone()));
        let (handle, task) = spawn_reconcile_worker(reconciler, Duration::from_millis(5));

        h.set_alive(&["http://n2", "http://n3"], &["http://n1"]);
        handle.notify(MembershipDelta {
            version: 2,
            newly_alive: vec![],
            newly_dead: vec![id("http://n1")],
        });

        let mut promoted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if h.coordinator.read("k").map(|r| r.role) == Some(Role::Primary) {
                promoted = true;
                break;
            }
        }
        assert!(promoted);
        task.abort();
    }

    #[tokio::test]
    async fn test_pass_runs_recovery_only_when_grown() {
        let h = Harness::new("http://n1", &["http://n1", "http://n2"]);
        let reconciler = Reconciler::new(h.coordinator.clone());
        assert!(reconciler.pass(false).await.recovery.is_none());
        assert!(reconciler.pass(true).await.recovery.is_some());
    }

    #[tokio::test]
    async fn test_burst_inside_window_runs_one_pass() {
        let h = Harness::new("http://n1", &["http://n1", "http://n2", "http://n3"]);
        let reconciler = Arc::new(Reconciler::new(h.coordinator.clone()));
        let (handle, task) =
            spawn_reconcile_worker(reconciler.clone(), Duration::from_millis(100));

        handle.notify(MembershipDelta {
            version: 2,
            newly_alive: vec![],
            newly_dead: vec![id("http://n3")],
        });
        handle.notify(MembershipDelta {
            version: 3,
            newly_alive: vec![id("http://n3")],
            newly_dead: vec![],
        });
        handle.notify(MembershipDelta {
            version: 4,
            newly_alive: vec![],
            newly_dead: vec![id("http://n2")],
        });

        let mut waited = 0;
        while reconciler.passes() == 0 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        // Give a second pass time to show up if the burst was split
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(reconciler.passes(), 1);
        let report = reconciler.last_report().unwrap();
        assert!(report.recovery.is_some(), "grew was lost in the burst");
        task.abort();
    }
}
