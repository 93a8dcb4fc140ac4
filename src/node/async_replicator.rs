//! Async replication channel
//!
//! The write path enqueues payloads into the durable outbox and returns.
//! A dispatcher task drains the outbox: one ordered stream per target, a
//! failed delivery parks the rest of that target's stream until the next
//! round. Payloads for a target the membership view reports dead, or that
//! exhausted their attempt budget, are dropped; failover repairs the slot.

use futures_util::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{NodeId, Result, METRICS};
use crate::node::membership::MembershipView;
use crate::node::outbox::{Outbox, OutboxEntry};
use crate::node::transport::{AsyncPayload, PeerTransport};

/// Where the write path hands off async payloads
pub trait ReplicationChannel: Send + Sync {
    /// Accept a payload for eventual delivery. Must not block on the target.
    fn enqueue(&self, payload: AsyncPayload) -> Result<u64>;

    /// Drop queued payloads for `key` bound for `target`; returns how many.
    fn discard(&self, key: &str, target: &NodeId) -> Result<usize>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
    pub deferred: usize,
}

pub struct AsyncReplicator {
    outbox: Mutex<Outbox>,
    peers: Arc<dyn PeerTransport>,
    membership: Arc<MembershipView>,
    max_attempts: u32,
    wakeup: Notify,
}

impl AsyncReplicator {
    pub fn new(
        outbox: Outbox,
        peers: Arc<dyn PeerTransport>,
        membership: Arc<MembershipView>,
        max_attempts: u32,
    ) -> Self {
        METRICS.replication.async_pending.set(outbox.len() as u64);
        Self {
            outbox: Mutex::new(outbox),
            peers,
            membership,
            max_attempts: max_attempts.max(1),
            wakeup: Notify::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Force pending outbox writes to disk
    pub fn flush(&self) -> Result<()> {
        self.lock().sync()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ack(&self, sequence: u64) {
        let mut outbox = self.lock();
        if let Err(e) = outbox.ack(sequence) {
            warn!("Failed to ack outbox entry {}: {}", sequence, e);
        }
        METRICS.replication.async_pending.set(outbox.len() as u64);
    }

    /// One delivery round over everything pending.
    pub async fn dispatch_once(&self) -> DispatchReport {
        let groups = self.lock().pending_by_target();
        if groups.is_empty() {
            return DispatchReport::default();
        }

        let rounds = groups
            .into_iter()
            .map(|(target, entries)| self.drain_target(target, entries));
        let reports = join_all(rounds).await;

        reports.into_iter().fold(DispatchReport::default(), |acc, r| DispatchReport {
            delivered: acc.delivered + r.delivered,
            dropped: acc.dropped + r.dropped,
            deferred: acc.deferred + r.deferred,
        })
    }

    async fn drain_target(&self, target: NodeId, entries: Vec<OutboxEntry>) -> DispatchReport {
        let mut report = DispatchReport::default();

        if self.membership.is_dead(&target) {
            info!(
                "Dropping {} async payloads for dead target {}",
                entries.len(),
                target
            );
            for entry in &entries {
                self.ack(entry.sequence);
            }
            METRICS.replication.async_dropped.add(entries.len() as u64);
            report.dropped = entries.len();
            return report;
        }

        let total = entries.len();
        for (i, entry) in entries.into_iter().enumerate() {
            // Discarded since the round started
            if !self.lock().contains(entry.sequence) {
                continue;
            }
            match self.peers.deliver_async(&target, &entry.payload).await {
                Ok(()) => {
                    debug!("Delivered {} to {}", entry.payload.key, target);
                    self.ack(entry.sequence);
                    METRICS.replication.async_delivered.inc();
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempts = self.lock().record_failure(entry.sequence);
                    if attempts >= self.max_attempts {
                        warn!(
                            "Giving up on async {} -> {} after {} attempts: {}",
                            entry.payload.key, target, attempts, e
                        );
                        self.ack(entry.sequence);
                        METRICS.replication.async_dropped.inc();
                        report.dropped += 1;
                        continue;
                    }
                    debug!(
                        "Async {} -> {} failed (attempt {}): {}",
                        entry.payload.key, target, attempts, e
                    );
                    // Later payloads for this target wait behind this one
                    report.deferred += total - i;
                    break;
                }
            }
        }

        report
    }

    /// Run the dispatcher until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Async dispatcher started (interval {:?})", interval);
            loop {
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                let report = self.dispatch_once().await;
                if report.deferred > 0 {
                    // Back off instead of spinning on an unreachable target
                    tokio::time::sleep(interval).await;
                }
            }
        })
    }
}

impl ReplicationChannel for AsyncReplicator {
    fn enqueue(&self, payload: AsyncPayload) -> Result<u64> {
        let sequence = {
            let mut outbox = self.lock();
            let sequence = outbox.append(payload)?;
            METRICS.replication.async_pending.set(outbox.len() as u64);
            sequence
        };
        METRICS.replication.async_enqueued.inc();
        self.wakeup.notify_one();
        Ok(sequence)
    }

    fn discard(&self, key: &str, target: &NodeId) -> Result<usize> {
        let mut outbox = self.lock();
        let discarded = outbox.discard(key, target)?;
        METRICS.replication.async_pending.set(outbox.len() as u64);
        if discarded > 0 {
            debug!("Discarded {} queued payloads for {} -> {}", discarded, key, target);
        }
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, SyncPolicy};
    use crate::node::membership::MembershipSnapshot;
    use crate::node::transport::ReplicateRequest;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingPeers {
        delivered: Mutex<Vec<(NodeId, String)>>,
        failing: Mutex<HashSet<NodeId>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingPeers {
        async fn replicate(&self, _target: &NodeId, _request: &ReplicateRequest) -> Result<()> {
            Ok(())
        }

        async fn deliver_async(&self, target: &NodeId, payload: &AsyncPayload) -> Result<()> {
            if self.failing.lock().unwrap().contains(target) {
                return Err(Error::transport(target, "connection refused"));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((target.clone(), payload.key.clone()));
            Ok(())
        }
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn payload(key: &str, target: &str) -> AsyncPayload {
        AsyncPayload {
            key: key.into(),
            value: "v".into(),
            target: id(target),
            primary: id("http://n1"),
            sync: Some(id("http://n2")),
        }
    }

    fn setup(dir: &std::path::Path, max_attempts: u32) -> (Arc<RecordingPeers>, AsyncReplicator) {
        let membership = Arc::new(MembershipView::new(id("http://n1")));
        membership
            .update(MembershipSnapshot::new(
                [id("http://n1"), id("http://n2"), id("http://n3"), id("http://n4")],
                [],
                1,
            ))
            .unwrap();
        let peers = Arc::new(RecordingPeers::default());
        let outbox = Outbox::open(dir.join("outbox.log"), SyncPolicy::Never).unwrap();
        let replicator = AsyncReplicator::new(outbox, peers.clone(), membership, max_attempts);
        (peers, replicator)
    }

    #[tokio::test]
    async fn test_delivers_in_order_per_target() {
        let dir = tempdir().unwrap();
        let (peers, replicator) = setup(dir.path(), 3);

        replicator.enqueue(payload("a", "http://n3")).unwrap();
        replicator.enqueue(payload("b", "http://n4")).unwrap();
        replicator.enqueue(payload("c", "http://n3")).unwrap();

        let report = replicator.dispatch_once().await;
        assert_eq!(report.delivered, 3);
        assert_eq!(replicator.pending(), 0);

        let delivered = peers.delivered.lock().unwrap().clone();
        let to_n3: Vec<&str> = delivered
            .iter()
            .filter(|(t, _)| *t == id("http://n3"))
            .map(|(_, k)| k.as_str())
            .collect();
        assert_eq!(to_n3, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_failure_parks_only_that_target() {
        let dir = tempdir().unwrap();
        let (peers, replicator) = setup(dir.path(), 5);
        peers.failing.lock().unwrap().insert(id("http://n3"));

        replicator.enqueue(payload("a", "http://n3")).unwrap();
        replicator.enqueue(payload("b", "http://n3")).unwrap();
        replicator.enqueue(payload("c", "http://n4")).unwrap();

        let report = replicator.dispatch_once().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(replicator.pending(), 2);

        // Target recovers; the parked stream goes out in order
        peers.failing.lock().unwrap().clear();
        let report = replicator.dispatch_once().await;
        assert_eq!(report.delivered, 2);
        let delivered = peers.delivered.lock().unwrap().clone();
        let keys: Vec<&str> = delivered.iter().map(|(_, k)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_drops_after_max_attempts() {
        let dir = tempdir().unwrap();
        let (peers, replicator) = setup(dir.path(), 2);
        peers.failing.lock().unwrap().insert(id("http://n3"));

        replicator.enqueue(payload("a", "http://n3")).unwrap();

        assert_eq!(replicator.dispatch_once().await.deferred, 1);
        let report = replicator.dispatch_once().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(replicator.pending(), 0);
    }

    #[tokio::test]
    async fn test_drops_payloads_for_dead_target() {
        let dir = tempdir().unwrap();
        let (peers, replicator) = setup(dir.path(), 5);

        replicator.enqueue(payload("a", "http://n9")).unwrap();
        let report = replicator.dispatch_once().await;
        assert_eq!(report.dropped, 1);
        assert!(peers.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discarded_payloads_are_not_delivered() {
        let dir = tempdir().unwrap();
        let (peers, replicator) = setup(dir.path(), 5);

        replicator.enqueue(payload("a", "http://n3")).unwrap();
        replicator.enqueue(payload("b", "http://n3")).unwrap();
        assert_eq!(replicator.discard("a", &id("http://n3")).unwrap(), 1);
        assert_eq!(replicator.pending(), 1);

        let report = replicator.dispatch_once().await;
        assert_eq!(report.delivered, 1);
        let delivered = peers.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec![(id("http://n3"), "b".to_string())]);
    }
}
