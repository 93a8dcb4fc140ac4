//! In-memory doubles for node unit tests

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::{Error, NodeId, ReplicationConfig, Result};
use crate::node::async_replicator::ReplicationChannel;
use crate::node::membership::{MembershipSnapshot, MembershipView};
use crate::node::replication::ReplicationCoordinator;
use crate::node::store::KeyStore;
use crate::node::transport::{AsyncPayload, ControlPlaneClient, PeerTransport, ReplicateRequest};

pub fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

/// Records replicate calls; nodes in `unreachable` fail with a transport error.
#[derive(Default)]
pub struct ScriptedPeers {
    pub replicated: Mutex<Vec<(NodeId, ReplicateRequest)>>,
    pub unreachable: Mutex<HashSet<NodeId>>,
    latency_ms: AtomicU64,
}

impl ScriptedPeers {
    /// Every replicate call takes at least `latency` before answering
    pub fn slow_down(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn cut(&self, node: &str) {
        self.unreachable.lock().unwrap().insert(id(node));
    }

    pub fn targets(&self) -> Vec<NodeId> {
        self.replicated
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn last_to(&self, node: &str) -> Option<ReplicateRequest> {
        self.replicated
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| *t == id(node))
            .map(|(_, r)| r.clone())
    }
}

#[async_trait]
impl PeerTransport for ScriptedPeers {
    async fn replicate(&self, target: &NodeId, request: &ReplicateRequest) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unreachable.lock().unwrap().contains(target) {
            return Err(Error::transport(target, "connection refused"));
        }
        self.replicated
            .lock()
            .unwrap()
            .push((target.clone(), request.clone()));
        Ok(())
    }

    async fn deliver_async(&self, target: &NodeId, _payload: &AsyncPayload) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(target) {
            return Err(Error::transport(target, "connection refused"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    pub payloads: Mutex<Vec<AsyncPayload>>,
    pub discarded: Mutex<Vec<(String, NodeId)>>,
    pub broken: AtomicBool,
}

impl ReplicationChannel for RecordingChannel {
    fn enqueue(&self, payload: AsyncPayload) -> Result<u64> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Outbox("channel unavailable".into()));
        }
        let mut payloads = self.payloads.lock().unwrap();
        payloads.push(payload);
        Ok(payloads.len() as u64 - 1)
    }

    fn discard(&self, key: &str, target: &NodeId) -> Result<usize> {
        self.discarded
            .lock()
            .unwrap()
            .push((key.to_string(), target.clone()));
        Ok(0)
    }
}

#[derive(Default)]
pub struct RecordingControl {
    pub notifications: Mutex<Vec<(String, NodeId)>>,
}

#[async_trait]
impl ControlPlaneClient for RecordingControl {
    async fn primary_changed(&self, key: &str, primary: &NodeId) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((key.to_string(), primary.clone()));
        Ok(())
    }

    async fn heartbeat(&self, _node: &NodeId) -> Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub coordinator: Arc<ReplicationCoordinator>,
    pub peers: Arc<ScriptedPeers>,
    pub channel: Arc<RecordingChannel>,
    pub control: Arc<RecordingControl>,
}

impl Harness {
    pub fn new(self_id: &str, alive: &[&str]) -> Self {
        Self::with_config(self_id, alive, fast_config())
    }

    pub fn with_config(self_id: &str, alive: &[&str], config: ReplicationConfig) -> Self {
        let membership = Arc::new(MembershipView::new(id(self_id)));
        membership
            .update(MembershipSnapshot::new(alive.iter().map(|n| id(n)), [], 1))
            .unwrap();

        let peers = Arc::new(ScriptedPeers::default());
        let channel = Arc::new(RecordingChannel::default());
        let control = Arc::new(RecordingControl::default());
        let coordinator = Arc::new(ReplicationCoordinator::new(
            id(self_id),
            Arc::new(KeyStore::new()),
            membership,
            peers.clone(),
            channel.clone(),
            control.clone(),
            config,
        ));

        Self {
            coordinator,
            peers,
            channel,
            control,
        }
    }

    /// Push a membership snapshot with the next version
    pub fn set_alive(&self, alive: &[&str], dead: &[&str]) {
        let view = self.coordinator.membership();
        view.update(MembershipSnapshot::new(
            alive.iter().map(|n| id(n)),
            dead.iter().map(|n| id(n)),
            view.version() + 1,
        ))
        .unwrap();
    }

    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        sync_attempts: 2,
        sync_retry_interval_ms: 1,
        ..ReplicationConfig::default()
    }
}
