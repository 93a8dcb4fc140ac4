//! Replication coordinator
//!
//! Drives a client write on the primary:
//!
//! 1. tentative local write under the key lock
//! 2. synchronous replicate to the sync replica, retried for a bounded window
//! 3. on failure, roll back (remove a new key, restore an updated one)
//! 4. on success, enqueue the async payload and acknowledge
//!
//! Step 4 never fails the write: a lost async copy only leaves the key
//! degraded until failover or recovery notices.
//!
//! The same coordinator is the callee side of `/replicate` and
//! `/replicate/async`. Callees never take the key lock; the caller already
//! holds its own and two primaries locking each other would deadlock.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::common::{
    retry_fixed, validate_key, Error, NodeId, ReplicationConfig, Result, METRICS,
};
use crate::node::async_replicator::ReplicationChannel;
use crate::node::membership::MembershipView;
use crate::node::store::{KeyRecord, KeyStore, Role, Topology};
use crate::node::transport::{AsyncPayload, ControlPlaneClient, PeerTransport, ReplicateRequest};

pub struct ReplicationCoordinator {
    self_id: NodeId,
    store: Arc<KeyStore>,
    membership: Arc<MembershipView>,
    peers: Arc<dyn PeerTransport>,
    channel: Arc<dyn ReplicationChannel>,
    control: Arc<dyn ControlPlaneClient>,
    config: ReplicationConfig,
}

impl ReplicationCoordinator {
    pub fn new(
        self_id: NodeId,
        store: Arc<KeyStore>,
        membership: Arc<MembershipView>,
        peers: Arc<dyn PeerTransport>,
        channel: Arc<dyn ReplicationChannel>,
        control: Arc<dyn ControlPlaneClient>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            self_id,
            store,
            membership,
            peers,
            channel,
            control,
            config,
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.membership
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn read(&self, key: &str) -> Option<KeyRecord> {
        self.store.get(key)
    }

    /// Client write. Acknowledged only once the sync replica holds the value.
    pub async fn write(&self, key: &str, value: String) -> Result<Topology> {
        validate_key(key)?;
        let _guard = self.store.lock(key).await;

        match self.store.get(key) {
            None => self.write_new(key, value).await,
            Some(prev) if prev.role == Role::Primary => self.write_update(key, value, prev).await,
            Some(prev) => {
                let primary = prev.topology.primary.clone();
                if self.membership.is_alive(&primary) {
                    return Err(Error::NotPrimary {
                        key: key.to_string(),
                        primary: primary.to_string(),
                    });
                }
                // Failover has not promoted anyone yet
                METRICS.replication.writes_rejected.inc();
                Err(Error::UpdateRejected {
                    key: key.to_string(),
                    reason: format!("primary {} is dead, failover pending", primary),
                })
            }
        }
    }

    async fn write_new(&self, key: &str, value: String) -> Result<Topology> {
        self.store.put(KeyRecord::new(
            key,
            value.clone(),
            Role::Primary,
            Topology::solo(self.self_id.clone()),
        ));

        match self.create_replicas(key, &value, None).await {
            Ok(topology) => {
                self.store.put(KeyRecord::new(
                    key,
                    value.clone(),
                    Role::Primary,
                    topology.clone(),
                ));
                self.enqueue_async(key, &value, &topology);
                self.notify_primary(key);
                METRICS.replication.writes_accepted.inc();
                info!("Created {} with sync {:?}", key, topology.sync);
                Ok(topology)
            }
            Err(e) => {
                self.store.remove(key);
                METRICS.replication.writes_rolled_back.inc();
                METRICS.replication.writes_rejected.inc();
                warn!("Write of new key {} rejected: {}", key, e);
                Err(Error::WriteRejected {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn write_update(&self, key: &str, value: String, prev: KeyRecord) -> Result<Topology> {
        let topology = Topology {
            primary: self.self_id.clone(),
            ..prev.topology.clone()
        };
        self.store.put(KeyRecord::new(
            key,
            value.clone(),
            Role::Primary,
            topology.clone(),
        ));

        let result = match topology.sync.clone() {
            Some(sync) => self
                .sync_update(key, &value, &sync, &topology)
                .await
                .map(|_| topology),
            // Degraded key: rebuild replicas, reusing the async holder if any
            None => {
                self.create_replicas(key, &value, topology.asynchronous.as_ref())
                    .await
            }
        };

        match result {
            Ok(topology) => {
                self.store.put(KeyRecord::new(
                    key,
                    value.clone(),
                    Role::Primary,
                    topology.clone(),
                ));
                self.enqueue_async(key, &value, &topology);
                METRICS.replication.writes_accepted.inc();
                debug!("Updated {}", key);
                Ok(topology)
            }
            Err(e) => {
                self.store.put(prev);
                METRICS.replication.writes_rolled_back.inc();
                METRICS.replication.writes_rejected.inc();
                warn!("Update of {} rejected: {}", key, e);
                Err(Error::UpdateRejected {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Find a sync replica (and an async one when 3+ nodes are alive) for a
    /// key this node is primary for, and replicate `value` to it.
    ///
    /// `preferred` is tried first when alive; it lets an existing async
    /// holder be promoted in place. Retries the whole candidate walk for the
    /// configured window, re-reading membership each round.
    pub(crate) async fn create_replicas(
        &self,
        key: &str,
        value: &str,
        preferred: Option<&NodeId>,
    ) -> Result<Topology> {
        let attempts = self.config.sync_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let mut candidates = self.membership.candidates_excluding(&[]);
            candidates.retain(|c| self.membership.is_alive(c));
            if candidates.is_empty() {
                return Err(Error::NoReplicaCandidate(key.to_string()));
            }
            if let Some(p) = preferred.filter(|p| candidates.contains(p)) {
                candidates.retain(|c| c != p);
                candidates.insert(0, p.clone());
            }

            for sync in candidates {
                // Older async payloads must not land after the sync copy
                if let Err(e) = self.channel.discard(key, &sync) {
                    debug!("Could not discard queued payloads for {} -> {}: {}", key, sync, e);
                }
                let topology = Topology {
                    primary: self.self_id.clone(),
                    sync: Some(sync.clone()),
                    asynchronous: self.pick_async(&sync),
                };
                let request = ReplicateRequest::new(key, value, &topology);
                match self.send_replicate(&sync, &request).await {
                    Ok(()) => return Ok(topology),
                    Err(e) => {
                        warn!(
                            "Sync replica candidate {} for {} failed (round {}/{}): {}",
                            sync, key, attempt, attempts, e
                        );
                        last_err = Some(e);
                    }
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.sync_retry_interval()).await;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::NoReplicaCandidate(key.to_string())))
    }

    /// Push `value` with `topology` to the existing sync replica.
    ///
    /// Fails fast once the membership view reports the sync dead.
    pub(crate) async fn sync_update(
        &self,
        key: &str,
        value: &str,
        sync: &NodeId,
        topology: &Topology,
    ) -> Result<()> {
        let request = ReplicateRequest::new(key, value, topology);
        let request = &request;
        retry_fixed(
            |_| async move {
                if self.membership.is_dead(sync) {
                    return Err(Error::NodeDead(sync.to_string()));
                }
                self.send_replicate(sync, request).await
            },
            self.config.sync_attempts.max(1),
            self.config.sync_retry_interval(),
        )
        .await
    }

    /// Choose a new async holder and wire it in: the sync learns the new
    /// topology first, then the payload is enqueued.
    pub(crate) async fn add_async_replica(
        &self,
        key: &str,
        value: &str,
        topology: &Topology,
    ) -> Result<Topology> {
        let sync = topology
            .sync
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} has no sync replica", key)))?;
        let target = self
            .pick_async(&sync)
            .ok_or_else(|| Error::NoReplicaCandidate(key.to_string()))?;

        let next = Topology {
            asynchronous: Some(target),
            ..topology.clone()
        };
        self.sync_update(key, value, &sync, &next).await?;

        if !self.enqueue_async(key, value, &next) {
            return Err(Error::Outbox(format!("async enqueue for {} failed", key)));
        }
        Ok(next)
    }

    /// Async holder for a topology whose sync is `sync`; none below 3 nodes.
    pub(crate) fn pick_async(&self, sync: &NodeId) -> Option<NodeId> {
        if self.membership.live_count() < 3 {
            return None;
        }
        self.membership.candidates_excluding(&[sync]).into_iter().next()
    }

    async fn send_replicate(&self, target: &NodeId, request: &ReplicateRequest) -> Result<()> {
        METRICS.replication.sync_attempts.inc();
        self.peers.replicate(target, request).await.map_err(|e| {
            METRICS.replication.sync_failures.inc();
            e
        })
    }

    /// Hand the async copy to the channel. Returns false if it was refused.
    pub(crate) fn enqueue_async(&self, key: &str, value: &str, topology: &Topology) -> bool {
        let Some(target) = topology.asynchronous.clone() else {
            return false;
        };

        let payload = AsyncPayload {
            key: key.to_string(),
            value: value.to_string(),
            target,
            primary: topology.primary.clone(),
            sync: topology.sync.clone(),
        };

        match self.channel.enqueue(payload) {
            Ok(_) => true,
            Err(e) => {
                METRICS.replication.async_enqueue_failed.inc();
                warn!("Async enqueue for {} failed, copy left degraded: {}", key, e);
                false
            }
        }
    }

    /// Tell the control plane this node now owns `key`. Fire and forget.
    pub(crate) fn notify_primary(&self, key: &str) {
        let control = self.control.clone();
        let key = key.to_string();
        let primary = self.self_id.clone();
        tokio::spawn(async move {
            if let Err(e) = control.primary_changed(&key, &primary).await {
                debug!("Primary notification for {} failed: {}", key, e);
            }
        });
    }

    /// Callee side of `/replicate`. Unconditional overwrite.
    pub fn handle_replicate(&self, request: ReplicateRequest) -> Result<Role> {
        validate_key(&request.key)?;
        if request.primary == self.self_id {
            return Err(Error::InvalidRequest(format!(
                "replicate for {} names this node as primary",
                request.key
            )));
        }

        let role = if request.asynchronous.as_ref() == Some(&self.self_id)
            && request.sync.as_ref() != Some(&self.self_id)
        {
            Role::Async
        } else {
            Role::Sync
        };

        let topology = request.topology();
        let previous = self
            .store
            .put(KeyRecord::new(&request.key, request.value, role, topology));
        if let Some(prev) = previous.filter(|p| p.role == Role::Primary) {
            warn!(
                "{} demoted from PRIMARY to {} by {}",
                prev.key, role, request.primary
            );
        }

        METRICS.replication.replicate_received.inc();
        Ok(role)
    }

    /// Consumer side of the async channel.
    ///
    /// Payloads addressed to another node, or naming this node as sync, are
    /// ignored. Otherwise the payload overwrites whatever is held, a stale
    /// SYNC copy included, unless this node is PRIMARY for the key. A primary
    /// purges queued payloads for a node before making it the sync, so an
    /// old payload cannot demote a fresh sync replica.
    pub fn apply_async(&self, payload: AsyncPayload) -> bool {
        if payload.target != self.self_id || payload.sync.as_ref() == Some(&self.self_id) {
            METRICS.replication.async_filtered.inc();
            return false;
        }

        let me = self.self_id.clone();
        let record = KeyRecord::new(
            payload.key.clone(),
            payload.value,
            Role::Async,
            Topology {
                primary: payload.primary,
                sync: payload.sync,
                asynchronous: Some(me.clone()),
            },
        );

        let applied = self.store.put_if(record, |current| {
            current.map_or(true, |r| !(r.role == Role::Primary && r.topology.primary == me))
        });
        if applied {
            METRICS.replication.async_applied.inc();
        } else {
            METRICS.replication.async_filtered.inc();
            debug!("Ignored async payload for {}: this node is its primary", payload.key);
        }
        applied
    }
}
