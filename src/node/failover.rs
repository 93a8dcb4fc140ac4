//! Failover reconciliation
//!
//! After a membership change every local record is re-examined against the
//! new view. The decision for one record is a pure function of its role,
//! its topology and the view (`plan`); executing it may promote this node,
//! create replacement replicas, or drop/degrade the record according to the
//! configured [`FailoverPolicy`].
//!
//! | local role | condition                                  | transition          |
//! |------------|--------------------------------------------|---------------------|
//! | any        | no other node alive                        | collapse to primary |
//! | SYNC       | primary dead                               | promote             |
//! | ASYNC      | primary dead, sync dead or missing         | promote             |
//! | PRIMARY    | sync dead or missing, async alive          | async becomes sync  |
//! | PRIMARY    | sync alive, async dead (or missing, 3+ up) | new async           |
//! | PRIMARY    | sync and async both dead or missing        | fresh replicas      |

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::common::{FailoverPolicy, NodeId, METRICS};
use crate::node::membership::MembershipView;
use crate::node::replication::ReplicationCoordinator;
use crate::node::store::{KeyRecord, Role, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    CollapseSoleSurvivor,
    PromoteFromSync,
    PromoteFromAsync,
    /// Sync slot lost, live async holder takes it over
    ReplaceSync,
    /// Async slot lost or never filled
    ReplaceAsync,
    /// Both replica slots lost
    ReplaceBoth,
}

/// Decide what a record needs under the given view.
pub fn plan(record: &KeyRecord, view: &MembershipView) -> Transition {
    let me = view.self_id();
    let topo = &record.topology;

    if view.live_peers().is_empty() {
        let collapsed = record.role == Role::Primary
            && topo.primary == *me
            && topo.sync.is_none()
            && topo.asynchronous.is_none();
        return if collapsed {
            Transition::None
        } else {
            Transition::CollapseSoleSurvivor
        };
    }

    let lost = |slot: &Option<NodeId>| slot.as_ref().map_or(true, |n| view.is_dead(n));
    let primary_dead = topo.primary != *me && view.is_dead(&topo.primary);

    match record.role {
        Role::Sync if primary_dead => Transition::PromoteFromSync,
        Role::Async if primary_dead && lost(&topo.sync) => Transition::PromoteFromAsync,
        Role::Primary => {
            let sync_lost = lost(&topo.sync);
            let async_lost = lost(&topo.asynchronous);
            match (sync_lost, async_lost) {
                (true, false) => Transition::ReplaceSync,
                (true, true) => Transition::ReplaceBoth,
                (false, true) => {
                    let async_dead = topo.asynchronous.is_some();
                    if async_dead || view.live_count() >= 3 {
                        Transition::ReplaceAsync
                    } else {
                        Transition::None
                    }
                }
                (false, false) => Transition::None,
            }
        }
        _ => Transition::None,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailoverReport {
    pub examined: usize,
    pub promoted: usize,
    pub repaired: usize,
    pub degraded: usize,
    pub dropped: usize,
    /// Record changed underneath the pass; left for the next one
    pub skipped: usize,
}

enum Outcome {
    Unchanged,
    Promoted { degraded: bool },
    Repaired,
    Degraded,
    Dropped,
    Skipped,
}

pub struct FailoverReconciler {
    coordinator: Arc<ReplicationCoordinator>,
}

impl FailoverReconciler {
    pub fn new(coordinator: Arc<ReplicationCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Re-examine every local record once.
    pub async fn run(&self) -> FailoverReport {
        let mut report = FailoverReport::default();
        let store = self.coordinator.store().clone();

        for key in store.keys() {
            let _guard = store.lock(&key).await;
            let Some(record) = store.get(&key) else {
                continue;
            };
            report.examined += 1;

            match self.reconcile(record).await {
                Outcome::Unchanged => {}
                Outcome::Promoted { degraded } => {
                    report.promoted += 1;
                    if degraded {
                        report.degraded += 1;
                    }
                }
                Outcome::Repaired => report.repaired += 1,
                Outcome::Degraded => report.degraded += 1,
                Outcome::Dropped => report.dropped += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }

        if report.examined > 0 {
            info!(
                "Failover pass: {} examined, {} promoted, {} repaired, {} degraded, {} dropped",
                report.examined, report.promoted, report.repaired, report.degraded, report.dropped
            );
        }
        report
    }

    async fn reconcile(&self, record: KeyRecord) -> Outcome {
        let transition = plan(&record, self.coordinator.membership());
        if transition != Transition::None {
            debug!("{} ({}) -> {:?}", record.key, record.role, transition);
        }

        match transition {
            Transition::None => Outcome::Unchanged,
            Transition::CollapseSoleSurvivor => self.collapse(record),
            Transition::PromoteFromSync => {
                // The old async holder already has a copy; reuse it if alive
                let preferred = record.topology.asynchronous.clone();
                self.promote(record, preferred).await
            }
            Transition::PromoteFromAsync => self.promote(record, None).await,
            Transition::ReplaceSync => self.replace_sync(record).await,
            Transition::ReplaceAsync => self.replace_async(record).await,
            Transition::ReplaceBoth => self.replace_both(record).await,
        }
    }

    fn me(&self) -> NodeId {
        self.coordinator.self_id().clone()
    }

    fn policy(&self) -> FailoverPolicy {
        self.coordinator.config().failover_policy
    }

    fn commit(&self, before: &KeyRecord, topology: Topology) -> bool {
        let next = KeyRecord::new(
            before.key.clone(),
            before.value.clone(),
            Role::Primary,
            topology,
        );
        let ok = self.coordinator.store().replace_if_unchanged(before, next);
        if !ok {
            debug!("{} changed during failover, leaving it for the next pass", before.key);
        }
        ok
    }

    fn collapse(&self, record: KeyRecord) -> Outcome {
        let was_primary = record.role == Role::Primary && record.topology.primary == self.me();
        if !self.commit(&record, Topology::solo(self.me())) {
            return Outcome::Skipped;
        }
        info!("{}: sole survivor, holding as PRIMARY with no replicas", record.key);
        if was_primary {
            METRICS.replication.failover_degraded.inc();
            Outcome::Degraded
        } else {
            self.coordinator.notify_primary(&record.key);
            METRICS.replication.failover_promotions.inc();
            Outcome::Promoted { degraded: true }
        }
    }

    async fn promote(&self, record: KeyRecord, preferred: Option<NodeId>) -> Outcome {
        let key = record.key.clone();
        let created = self
            .coordinator
            .create_replicas(&key, &record.value, preferred.as_ref())
            .await;

        match created {
            Ok(topology) => {
                if !self.commit(&record, topology.clone()) {
                    return Outcome::Skipped;
                }
                self.coordinator.enqueue_async(&key, &record.value, &topology);
                self.coordinator.notify_primary(&key);
                METRICS.replication.failover_promotions.inc();
                info!(
                    "{}: promoted from {} with sync {:?} async {:?}",
                    key, record.role, topology.sync, topology.asynchronous
                );
                Outcome::Promoted { degraded: false }
            }
            Err(e) => match self.policy() {
                FailoverPolicy::LeaveDegraded => {
                    if !self.commit(&record, Topology::solo(self.me())) {
                        return Outcome::Skipped;
                    }
                    self.coordinator.notify_primary(&key);
                    METRICS.replication.failover_promotions.inc();
                    METRICS.replication.failover_degraded.inc();
                    warn!("{}: promoted without replicas: {}", key, e);
                    Outcome::Promoted { degraded: true }
                }
                FailoverPolicy::DropRecord => self.drop_record(&record, &e.to_string()),
            },
        }
    }

    async fn replace_sync(&self, record: KeyRecord) -> Outcome {
        let key = record.key.clone();
        let old_async = record.topology.asynchronous.clone();
        let created = self
            .coordinator
            .create_replicas(&key, &record.value, old_async.as_ref())
            .await;

        match created {
            Ok(topology) => {
                if !self.commit(&record, topology.clone()) {
                    return Outcome::Skipped;
                }
                self.coordinator.enqueue_async(&key, &record.value, &topology);
                METRICS.replication.failover_repairs.inc();
                info!("{}: sync replaced by {:?}", key, topology.sync);
                Outcome::Repaired
            }
            Err(e) => {
                let topology = Topology {
                    sync: None,
                    ..record.topology.clone()
                };
                if !self.commit(&record, topology) {
                    return Outcome::Skipped;
                }
                METRICS.replication.failover_degraded.inc();
                warn!("{}: no replacement sync, left degraded: {}", key, e);
                Outcome::Degraded
            }
        }
    }

    async fn replace_async(&self, record: KeyRecord) -> Outcome {
        let key = record.key.clone();
        let cleared = Topology {
            asynchronous: None,
            ..record.topology.clone()
        };

        let result = if self.coordinator.membership().live_count() < 3 {
            // Not enough nodes for a third copy; tell the sync it is gone
            if let Some(sync) = cleared.sync.clone() {
                if let Err(e) = self
                    .coordinator
                    .sync_update(&key, &record.value, &sync, &cleared)
                    .await
                {
                    debug!("{}: could not push cleared topology to {}: {}", key, sync, e);
                }
            }
            Err(None)
        } else {
            self.coordinator
                .add_async_replica(&key, &record.value, &cleared)
                .await
                .map_err(Some)
        };

        match result {
            Ok(topology) => {
                if !self.commit(&record, topology.clone()) {
                    return Outcome::Skipped;
                }
                METRICS.replication.failover_repairs.inc();
                info!("{}: async replaced by {:?}", key, topology.asynchronous);
                Outcome::Repaired
            }
            Err(e) => {
                if !self.commit(&record, cleared) {
                    return Outcome::Skipped;
                }
                METRICS.replication.failover_degraded.inc();
                match e {
                    Some(e) => warn!("{}: no replacement async, left degraded: {}", key, e),
                    None => debug!("{}: async slot cleared, too few nodes", key),
                }
                Outcome::Degraded
            }
        }
    }

    async fn replace_both(&self, record: KeyRecord) -> Outcome {
        let key = record.key.clone();
        match self.coordinator.create_replicas(&key, &record.value, None).await {
            Ok(topology) => {
                if !self.commit(&record, topology.clone()) {
                    return Outcome::Skipped;
                }
                self.coordinator.enqueue_async(&key, &record.value, &topology);
                METRICS.replication.failover_repairs.inc();
                info!("{}: both replicas replaced, sync {:?}", key, topology.sync);
                Outcome::Repaired
            }
            Err(e) => match self.policy() {
                FailoverPolicy::LeaveDegraded => {
                    if !self.commit(&record, Topology::solo(self.me())) {
                        return Outcome::Skipped;
                    }
                    METRICS.replication.failover_degraded.inc();
                    warn!("{}: replicas lost, left without any: {}", key, e);
                    Outcome::Degraded
                }
                FailoverPolicy::DropRecord => self.drop_record(&record, &e.to_string()),
            },
        }
    }

    fn drop_record(&self, record: &KeyRecord, reason: &str) -> Outcome {
        if !self.coordinator.store().remove_if_unchanged(record) {
            return Outcome::Skipped;
        }
        METRICS.replication.failover_dropped.inc();
        warn!("{}: dropped after failed repair: {}", record.key, reason);
        Outcome::Dropped
    }
}
