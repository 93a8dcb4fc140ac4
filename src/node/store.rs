//! Local key record store
//!
//! Each node owns its records exclusively. Reads and single-record writes go
//! straight to a `DashMap`. Multi-step operations on one key (a client write
//! racing a reconciliation pass) serialize on a per-key async lock that is
//! held across the replication RPCs.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::common::{timestamp_now_millis, NodeId, METRICS};

/// This node's relationship to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Primary,
    Sync,
    Async,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Sync => write!(f, "SYNC"),
            Role::Async => write!(f, "ASYNC"),
        }
    }
}

/// Replica assignment as last known to this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub primary: NodeId,
    pub sync: Option<NodeId>,
    #[serde(rename = "async")]
    pub asynchronous: Option<NodeId>,
}

impl Topology {
    /// Primary only, no replicas
    pub fn solo(primary: NodeId) -> Self {
        Self {
            primary,
            sync: None,
            asynchronous: None,
        }
    }

    /// Number of copies this topology describes
    pub fn copies(&self) -> usize {
        1 + self.sync.is_some() as usize + self.asynchronous.is_some() as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    pub value: String,
    pub role: Role,
    pub topology: Topology,
    pub updated_at: u64,
}

impl KeyRecord {
    pub fn new(key: impl Into<String>, value: impl Into<String>, role: Role, topology: Topology) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            role,
            topology,
            updated_at: timestamp_now_millis(),
        }
    }

    /// Same logical state, ignoring the timestamp
    pub fn same_state(&self, other: &KeyRecord) -> bool {
        self.value == other.value && self.role == other.role && self.topology == other.topology
    }
}

pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyStore {
    records: DashMap<String, KeyRecord>,
    // Entries are never removed: dropping a lock another task still waits on
    // would let a fresh one race it.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to one key for the duration of the guard
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn get(&self, key: &str) -> Option<KeyRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Insert or overwrite, returning the previous record
    pub fn put(&self, record: KeyRecord) -> Option<KeyRecord> {
        let prev = self.records.insert(record.key.clone(), record);
        METRICS.replication.local_keys.set(self.records.len() as u64);
        prev
    }

    /// Insert only if `allow` accepts the current record (if any).
    pub fn put_if<F>(&self, record: KeyRecord, allow: F) -> bool
    where
        F: FnOnce(Option<&KeyRecord>) -> bool,
    {
        let stored = match self.records.entry(record.key.clone()) {
            Entry::Occupied(mut e) => {
                let ok = allow(Some(e.get()));
                if ok {
                    e.insert(record);
                }
                ok
            }
            Entry::Vacant(e) => {
                let ok = allow(None);
                if ok {
                    e.insert(record);
                }
                ok
            }
        };
        METRICS.replication.local_keys.set(self.records.len() as u64);
        stored
    }

    pub fn remove(&self, key: &str) -> Option<KeyRecord> {
        let prev = self.records.remove(key).map(|(_, r)| r);
        METRICS.replication.local_keys.set(self.records.len() as u64);
        prev
    }

    /// Replace the record only if it still matches `expected`.
    ///
    /// Reconciliation reads a record, talks to peers, then commits; an
    /// incoming replicate call may have rewritten the record meanwhile.
    pub fn replace_if_unchanged(&self, expected: &KeyRecord, next: KeyRecord) -> bool {
        let replaced = match self.records.get_mut(&expected.key) {
            Some(mut current) if current.same_state(expected) => {
                *current = next;
                true
            }
            _ => false,
        };
        // The shard guard is released here; len() takes every shard
        METRICS.replication.local_keys.set(self.records.len() as u64);
        replaced
    }

    /// Remove the record only if it still matches `expected`.
    pub fn remove_if_unchanged(&self, expected: &KeyRecord) -> bool {
        let removed = self
            .records
            .remove_if(&expected.key, |_, current| current.same_state(expected))
            .is_some();
        METRICS.replication.local_keys.set(self.records.len() as u64);
        removed
    }

    /// Keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// All records sorted by key
    pub fn snapshot(&self) -> Vec<KeyRecord> {
        let mut records: Vec<KeyRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
