//! Worker registry and liveness tracking
//!
//! Workers report in with heartbeats; the monitor sweeps for silent ones.
//! Every change to the alive set bumps the membership version. The version
//! is seeded from the wall clock so a restarted control plane still issues
//! versions newer than anything the workers hold.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::common::{timestamp_now_millis, NodeId, NodeState};
use crate::node::membership::MembershipSnapshot;

#[derive(Debug, Clone)]
struct WorkerEntry {
    state: NodeState,
    last_heartbeat: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    workers: BTreeMap<NodeId, WorkerEntry>,
    version: u64,
}

impl Inner {
    fn snapshot(&self) -> MembershipSnapshot {
        let alive = self
            .workers
            .iter()
            .filter(|(_, w)| w.state.is_alive())
            .map(|(n, _)| n.clone());
        let dead = self
            .workers
            .iter()
            .filter(|(_, w)| !w.state.is_alive())
            .map(|(n, _)| n.clone());
        MembershipSnapshot::new(alive, dead, self.version)
    }
}

/// Row of the `/cluster` listing
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub node: NodeId,
    pub state: NodeState,
    pub last_heartbeat_ms_ago: Option<u64>,
}

#[derive(Debug)]
pub struct WorkerRegistry {
    inner: RwLock<Inner>,
    timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(workers: impl IntoIterator<Item = NodeId>, timeout: Duration) -> Self {
        let workers = workers
            .into_iter()
            .map(|n| {
                (
                    n,
                    WorkerEntry {
                        state: NodeState::Unknown,
                        last_heartbeat: None,
                    },
                )
            })
            .collect();
        Self {
            inner: RwLock::new(Inner {
                workers,
                version: timestamp_now_millis(),
            }),
            timeout,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn heartbeat(&self, node: &NodeId) -> Option<MembershipSnapshot> {
        self.heartbeat_at(node, Instant::now())
    }

    /// Record a heartbeat. Returns the new snapshot if the alive set changed.
    pub fn heartbeat_at(&self, node: &NodeId, now: Instant) -> Option<MembershipSnapshot> {
        let mut inner = self.write();
        let entry = inner.workers.entry(node.clone()).or_insert_with(|| {
            info!("Registered new worker {}", node);
            WorkerEntry {
                state: NodeState::Unknown,
                last_heartbeat: None,
            }
        });

        entry.last_heartbeat = Some(now);
        if entry.state.is_alive() {
            return None;
        }

        let previous = entry.state;
        entry.state = NodeState::Alive;
        inner.version += 1;
        info!("Worker {} is alive (was {}), membership v{}", node, previous, inner.version);
        Some(inner.snapshot())
    }

    pub fn sweep(&self) -> Option<MembershipSnapshot> {
        self.sweep_at(Instant::now())
    }

    /// Declare silent workers dead. Returns the new snapshot on change.
    pub fn sweep_at(&self, now: Instant) -> Option<MembershipSnapshot> {
        let mut inner = self.write();
        let timeout = self.timeout;
        let mut expired = Vec::new();

        for (node, entry) in inner.workers.iter_mut() {
            let silent = entry
                .last_heartbeat
                .map_or(true, |t| now.saturating_duration_since(t) > timeout);
            if entry.state.is_alive() && silent {
                entry.state = NodeState::Dead;
                expired.push(node.clone());
            }
        }

        if expired.is_empty() {
            return None;
        }

        inner.version += 1;
        warn!("Workers {:?} missed heartbeats, membership v{}", expired, inner.version);
        Some(inner.snapshot())
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        self.read().snapshot()
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Alive workers in ring order
    pub fn alive_nodes(&self) -> Vec<NodeId> {
        self.read().snapshot().alive.into_iter().collect()
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.read()
            .workers
            .get(node)
            .map_or(false, |w| w.state.is_alive())
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        let now = Instant::now();
        self.read()
            .workers
            .iter()
            .map(|(node, w)| WorkerStatus {
                node: node.clone(),
                state: w.state,
                last_heartbeat_ms_ago: w
                    .last_heartbeat
                    .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn test_configured_workers_start_unknown() {
        let registry = WorkerRegistry::new([id("http://n1"), id("http://n2")], Duration::from_secs(5));
        let snap = registry.snapshot();
        assert!(snap.alive.is_empty());
        assert_eq!(snap.dead.len(), 2);
        assert!(!registry.is_alive(&id("http://n1")));
    }

    #[test]
    fn test_heartbeat_bumps_version_once() {
        let registry = WorkerRegistry::new([id("http://n1")], Duration::from_secs(5));
        let v0 = registry.version();

        let snap = registry.heartbeat(&id("http://n1")).unwrap();
        assert_eq!(snap.version, v0 + 1);
        assert!(snap.alive.contains(&id("http://n1")));

        // Steady heartbeats change nothing
        assert!(registry.heartbeat(&id("http://n1")).is_none());
        assert_eq!(registry.version(), v0 + 1);
    }

    #[test]
    fn test_unknown_worker_registers_on_heartbeat() {
        let registry = WorkerRegistry::new([], Duration::from_secs(5));
        assert!(registry.heartbeat(&id("http://n7")).is_some());
        assert_eq!(registry.alive_nodes(), vec![id("http://n7")]);
    }

    #[test]
    fn test_sweep_declares_silent_workers_dead() {
        let registry = WorkerRegistry::new([], Duration::from_secs(5));
        let start = Instant::now();
        registry.heartbeat_at(&id("http://n1"), start);
        registry.heartbeat_at(&id("http://n2"), start);
        let v = registry.version();

        assert!(registry.sweep_at(start + Duration::from_secs(3)).is_none());

        registry.heartbeat_at(&id("http://n2"), start + Duration::from_secs(4));
        let snap = registry.sweep_at(start + Duration::from_secs(6)).unwrap();
        assert_eq!(snap.version, v + 1);
        assert!(snap.dead.contains(&id("http://n1")));
        assert!(snap.alive.contains(&id("http://n2")));

        // Coming back is another change
        let snap = registry
            .heartbeat_at(&id("http://n1"), start + Duration::from_secs(7))
            .unwrap();
        assert_eq!(snap.version, v + 2);
        assert_eq!(snap.alive.len(), 2);
    }
}
