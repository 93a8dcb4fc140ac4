//! Node-local view of cluster membership
//!
//! The control plane pushes versioned snapshots. A snapshot replaces the view
//! only when its version is strictly greater than the one held; anything
//! else is stale and dropped so a delayed broadcast cannot undo a newer one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::common::{ring_after, Error, NodeId, Result, METRICS};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub alive: BTreeSet<NodeId>,
    #[serde(default)]
    pub dead: BTreeSet<NodeId>,
    pub version: u64,
}

impl MembershipSnapshot {
    pub fn new(
        alive: impl IntoIterator<Item = NodeId>,
        dead: impl IntoIterator<Item = NodeId>,
        version: u64,
    ) -> Self {
        let alive: BTreeSet<NodeId> = alive.into_iter().collect();
        // A node listed in both sets counts as alive
        let dead = dead.into_iter().filter(|n| !alive.contains(n)).collect();
        Self {
            alive,
            dead,
            version,
        }
    }
}

/// What changed between two applied snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDelta {
    pub version: u64,
    pub newly_alive: Vec<NodeId>,
    pub newly_dead: Vec<NodeId>,
}

impl MembershipDelta {
    /// A node joined or came back
    pub fn grew(&self) -> bool {
        !self.newly_alive.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.newly_alive.is_empty() && self.newly_dead.is_empty()
    }
}

#[derive(Debug)]
pub struct MembershipView {
    self_id: NodeId,
    current: RwLock<MembershipSnapshot>,
}

impl MembershipView {
    /// Before the first broadcast a node only knows about itself.
    pub fn new(self_id: NodeId) -> Self {
        let initial = MembershipSnapshot::new([self_id.clone()], [], 0);
        Self {
            self_id,
            current: RwLock::new(initial),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Apply a snapshot if it is newer than the held one.
    pub fn update(&self, snapshot: MembershipSnapshot) -> Result<MembershipDelta> {
        let snapshot = MembershipSnapshot::new(snapshot.alive, snapshot.dead, snapshot.version);
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());

        if snapshot.version <= current.version {
            METRICS.replication.membership_stale.inc();
            return Err(Error::StaleMembership {
                received: snapshot.version,
                held: current.version,
            });
        }

        let newly_alive: Vec<NodeId> = snapshot.alive.difference(&current.alive).cloned().collect();
        let newly_dead: Vec<NodeId> = current.alive.difference(&snapshot.alive).cloned().collect();

        if !snapshot.alive.contains(&self.self_id) {
            warn!(
                "Membership v{} does not list this node ({}) as alive",
                snapshot.version, self.self_id
            );
        }

        info!(
            "Membership v{} -> v{}: {} alive, +{:?} -{:?}",
            current.version,
            snapshot.version,
            snapshot.alive.len(),
            newly_alive,
            newly_dead
        );

        let delta = MembershipDelta {
            version: snapshot.version,
            newly_alive,
            newly_dead,
        };
        *current = snapshot;
        METRICS.replication.membership_applied.inc();
        Ok(delta)
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.read().alive.contains(node)
    }

    /// Anything not reported alive is treated as dead
    pub fn is_dead(&self, node: &NodeId) -> bool {
        !self.is_alive(node)
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        self.read().clone()
    }

    /// Alive nodes in ring order
    pub fn alive_nodes(&self) -> Vec<NodeId> {
        self.read().alive.iter().cloned().collect()
    }

    /// Alive nodes other than this one
    pub fn live_peers(&self) -> Vec<NodeId> {
        self.read()
            .alive
            .iter()
            .filter(|n| **n != self.self_id)
            .cloned()
            .collect()
    }

    /// Cluster size as seen from here, this node included
    pub fn live_count(&self) -> usize {
        self.live_peers().len() + 1
    }

    /// Alive peers in ring order starting after this node, minus `exclude`.
    pub fn candidates_excluding(&self, exclude: &[&NodeId]) -> Vec<NodeId> {
        let alive = self.alive_nodes();
        ring_after(&self.self_id, &alive)
            .into_iter()
            .filter(|n| !exclude.contains(&n))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MembershipSnapshot> {
        self.current.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn snap(alive: &[&str], dead: &[&str], version: u64) -> MembershipSnapshot {
        MembershipSnapshot::new(
            alive.iter().map(|s| id(s)),
            dead.iter().map(|s| id(s)),
            version,
        )
    }

    #[test]
    fn test_initial_view_knows_only_self() {
        let view = MembershipView::new(id("http://n1"));
        assert_eq!(view.version(), 0);
        assert!(view.is_alive(&id("http://n1")));
        assert!(view.live_peers().is_empty());
        assert_eq!(view.live_count(), 1);
    }

    #[test]
    fn test_update_reports_delta() {
        let view = MembershipView::new(id("http://n1"));
        let delta = view
            .update(snap(&["http://n1", "http://n2", "http://n3"], &[], 1))
            .unwrap();
        assert!(delta.grew());
        assert_eq!(delta.newly_alive, vec![id("http://n2"), id("http://n3")]);

        let delta = view
            .update(snap(&["http://n1", "http://n3"], &["http://n2"], 2))
            .unwrap();
        assert!(!delta.grew());
        assert_eq!(delta.newly_dead, vec![id("http://n2")]);
        assert!(view.is_dead(&id("http://n2")));
    }

    #[test]
    fn test_stale_snapshot_is_discarded() {
        let view = MembershipView::new(id("http://n1"));
        view.update(snap(&["http://n1", "http://n2"], &[], 5)).unwrap();

        let err = view
            .update(snap(&["http://n1"], &["http://n2"], 5))
            .unwrap_err();
        assert!(matches!(err, Error::StaleMembership { received: 5, held: 5 }));

        assert!(view.update(snap(&["http://n1"], &["http://n2"], 4)).is_err());
        // Unchanged after both rejections
        assert!(view.is_alive(&id("http://n2")));
        assert_eq!(view.version(), 5);
    }

    #[test]
    fn test_unknown_node_is_dead() {
        let view = MembershipView::new(id("http://n1"));
        view.update(snap(&["http://n1", "http://n2"], &[], 1)).unwrap();
        assert!(view.is_dead(&id("http://n9")));
    }

    #[test]
    fn test_node_in_both_sets_counts_as_alive() {
        let s = snap(&["http://n1", "http://n2"], &["http://n2"], 1);
        assert!(s.dead.is_empty());
    }

    #[test]
    fn test_candidates_follow_ring_after_self() {
        let view = MembershipView::new(id("http://n2"));
        view.update(snap(&["http://n1", "http://n2", "http://n3", "http://n4"], &[], 1))
            .unwrap();
        assert_eq!(
            view.candidates_excluding(&[]),
            vec![id("http://n3"), id("http://n4"), id("http://n1")]
        );
        assert_eq!(
            view.candidates_excluding(&[&id("http://n3")]),
            vec![id("http://n4"), id("http://n1")]
        );
    }
}
