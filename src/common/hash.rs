//! Key partitioning
//!
//! - BLAKE3 reduces a key to a non-negative integer
//! - modulo over the ordered alive list picks the primary index `i`
//! - sync and async candidates sit at `i+1` and `i+2` on the same ring
//!
//! Every node sorts its alive list the same way, so independent nodes agree
//! on the candidates without talking to each other.

use crate::common::NodeId;

/// Replication width: primary, sync, async
pub const REPLICA_SLOTS: usize = 3;

/// Hash a key to a non-negative integer
pub fn key_hash(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// Ordered candidate list for a key: `[primary, sync?, async?]`.
///
/// Empty when `alive` is empty. With fewer than three distinct nodes the
/// tail is simply shorter. Duplicate entries in `alive` are skipped.
pub fn candidates_for(key: &str, alive: &[NodeId]) -> Vec<NodeId> {
    if alive.is_empty() {
        return Vec::new();
    }

    let len = alive.len();
    let start = (key_hash(key) % len as u64) as usize;

    let mut out: Vec<NodeId> = Vec::with_capacity(REPLICA_SLOTS);
    for step in 0..len {
        if out.len() == REPLICA_SLOTS {
            break;
        }
        let node = &alive[(start + step) % len];
        if !out.contains(node) {
            out.push(node.clone());
        }
    }
    out
}

/// Named view over `candidates_for`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub primary: NodeId,
    pub sync: Option<NodeId>,
    pub asynchronous: Option<NodeId>,
}

pub fn placement_for(key: &str, alive: &[NodeId]) -> Option<Placement> {
    let mut candidates = candidates_for(key, alive).into_iter();
    let primary = candidates.next()?;
    Some(Placement {
        primary,
        sync: candidates.next(),
        asynchronous: candidates.next(),
    })
}

/// Walk the ring starting right after `origin`, excluding `origin`.
///
/// If `origin` is not in `alive` the walk starts at the first node that
/// sorts after it, which keeps the order stable while a node is dead.
pub fn ring_after(origin: &NodeId, alive: &[NodeId]) -> Vec<NodeId> {
    let len = alive.len();
    let start = match alive.iter().position(|n| n == origin) {
        Some(pos) => pos + 1,
        None => alive.iter().position(|n| n > origin).unwrap_or(0),
    };

    let mut out = Vec::with_capacity(len);
    for step in 0..len {
        let node = &alive[(start + step) % len];
        if node != origin && !out.contains(node) {
            out.push(node.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn test_key_hash_deterministic() {
        assert_eq!(key_hash("user:42"), key_hash("user:42"));
        assert_ne!(key_hash("user:42"), key_hash("user:43"));
    }

    #[test]
    fn test_candidates_deterministic() {
        let alive = nodes(&["n1", "n2", "n3", "n4"]);
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(candidates_for(&key, &alive), candidates_for(&key, &alive.clone()));
        }
    }

    #[test]
    fn test_candidates_are_consecutive_on_ring() {
        let alive = nodes(&["n1", "n2", "n3", "n4"]);
        let key = "user:42";
        let i = (key_hash(key) % 4) as usize;
        let got = candidates_for(key, &alive);
        assert_eq!(
            got,
            vec![
                alive[i].clone(),
                alive[(i + 1) % 4].clone(),
                alive[(i + 2) % 4].clone()
            ]
        );
    }

    #[test]
    fn test_empty_alive_list() {
        assert!(candidates_for("k", &[]).is_empty());
        assert!(placement_for("k", &[]).is_none());
    }

    #[test]
    fn test_degrades_with_small_clusters() {
        let one = nodes(&["n1"]);
        let p = placement_for("k", &one).unwrap();
        assert_eq!(p.primary, NodeId::new("n1"));
        assert!(p.sync.is_none());
        assert!(p.asynchronous.is_none());

        let two = nodes(&["n1", "n2"]);
        let p = placement_for("k", &two).unwrap();
        assert!(p.sync.is_some());
        assert_ne!(p.sync.as_ref(), Some(&p.primary));
        assert!(p.asynchronous.is_none());
    }

    #[test]
    fn test_duplicates_skipped() {
        let alive = nodes(&["n1", "n1", "n2"]);
        let got = candidates_for("anything", &alive);
        assert_eq!(got.len(), 2);
        assert_ne!(got[0], got[1]);
    }

    #[test]
    fn test_every_node_gets_some_keys() {
        let alive = nodes(&["n1", "n2", "n3"]);
        let mut seen = std::collections::HashSet::new();
        for i in 0..300 {
            seen.insert(candidates_for(&format!("k{}", i), &alive)[0].clone());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_ring_after() {
        let alive = nodes(&["n1", "n2", "n3"]);
        assert_eq!(ring_after(&NodeId::new("n1"), &alive), nodes(&["n2", "n3"]));
        assert_eq!(ring_after(&NodeId::new("n3"), &alive), nodes(&["n1", "n2"]));

        let survivors = nodes(&["n1", "n3"]);
        assert_eq!(ring_after(&NodeId::new("n2"), &survivors), nodes(&["n3", "n1"]));
    }
}
