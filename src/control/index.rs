//! Key -> primary index
//!
//! Filled from successful routed writes and from workers' primary-change
//! notifications. Entries are hints: a stale one only costs the read path
//! a wasted hop before it falls back to the computed candidates.

use dashmap::DashMap;

use crate::common::NodeId;

#[derive(Debug, Default)]
pub struct PrimaryIndex {
    primaries: DashMap<String, NodeId>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous primary if it changed
    pub fn record(&self, key: &str, primary: NodeId) -> Option<NodeId> {
        match self.primaries.insert(key.to_string(), primary.clone()) {
            Some(prev) if prev != primary => Some(prev),
            _ => None,
        }
    }

    pub fn primary_of(&self, key: &str) -> Option<NodeId> {
        self.primaries.get(key).map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.primaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primaries.is_empty()
    }
}
