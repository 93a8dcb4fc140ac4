//! Membership fan-out
//!
//! Snapshots are pushed to every known worker concurrently, dead ones
//! included: a worker that was only cut off learns it was declared dead.
//! The last version each alive worker acknowledged is remembered so the
//! monitor can re-push to workers that missed a broadcast.

use dashmap::DashMap;
use futures_util::future::join_all;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::{Error, NodeId, Result};
use crate::node::membership::MembershipSnapshot;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Worker already held this version or newer
    pub stale: usize,
    pub failed: usize,
}

enum PushOutcome {
    Delivered,
    Stale,
    Failed,
}

pub struct MembershipBroadcaster {
    client: Client,
    acked: DashMap<NodeId, u64>,
}

impl MembershipBroadcaster {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            acked: DashMap::new(),
        })
    }

    /// Push `snapshot` to every worker it names.
    pub async fn broadcast(&self, snapshot: &MembershipSnapshot) -> BroadcastReport {
        let targets: Vec<&NodeId> = snapshot.alive.iter().chain(snapshot.dead.iter()).collect();
        self.push_all(snapshot, targets).await
    }

    /// Push `snapshot` only to alive workers that have not acknowledged it.
    pub async fn resync(&self, snapshot: &MembershipSnapshot) -> BroadcastReport {
        let targets: Vec<&NodeId> = snapshot
            .alive
            .iter()
            .filter(|n| self.acked.get(*n).map_or(true, |v| *v < snapshot.version))
            .collect();
        if targets.is_empty() {
            return BroadcastReport::default();
        }
        debug!("Re-pushing membership v{} to {:?}", snapshot.version, targets);
        self.push_all(snapshot, targets).await
    }

    async fn push_all(&self, snapshot: &MembershipSnapshot, targets: Vec<&NodeId>) -> BroadcastReport {
        let outcomes = join_all(targets.into_iter().map(|t| self.push(t, snapshot))).await;

        let mut report = BroadcastReport::default();
        for outcome in outcomes {
            match outcome {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::Stale => report.stale += 1,
                PushOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    async fn push(&self, target: &NodeId, snapshot: &MembershipSnapshot) -> PushOutcome {
        let result = self
            .client
            .post(target.url("/cluster/membership"))
            .json(snapshot)
            .send()
            .await;

        let outcome = match result {
            Ok(resp) if resp.status().is_success() => PushOutcome::Delivered,
            Ok(resp) if resp.status() == StatusCode::CONFLICT => PushOutcome::Stale,
            Ok(resp) => {
                warn!("Membership push to {} returned {}", target, resp.status());
                PushOutcome::Failed
            }
            Err(e) => {
                warn!("Membership push to {} failed: {}", target, e);
                PushOutcome::Failed
            }
        };

        if !matches!(outcome, PushOutcome::Failed) {
            self.acked.insert(target.clone(), snapshot.version);
        }
        outcome
    }
}
