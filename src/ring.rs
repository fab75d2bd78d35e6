//! Consistent hash ring
//!
//! Distributes cache keys across a set of upstream origins so that, as long
//! as the node set is stable, a given key always maps to the same origin.
//! Virtual nodes (replicas per origin) smooth the distribution.

use std::collections::HashMap;
use std::sync::RwLock;

/// A CRC32-based consistent hash ring over a set of named origins.
pub struct HashRing {
    inner: RwLock<RingState>,
    replicas: usize,
}

struct RingState {
    /// Sorted slot hashes.
    ring: Vec<u32>,
    /// Slot hash -> owning node name.
    node_by_slot: HashMap<u32, String>,
}

impl HashRing {
    /// `replicas <= 0` falls back to 100, matching the original edge binary.
    pub fn new(nodes: &[String], replicas: usize) -> Self {
        let replicas = if replicas == 0 { 100 } else { replicas };
        let this = Self {
            inner: RwLock::new(RingState {
                ring: Vec::new(),
                node_by_slot: HashMap::new(),
            }),
            replicas,
        };
        this.set_nodes(nodes);
        this
    }

    /// Fully rebuilds the ring from the given node set.
    pub fn set_nodes(&self, nodes: &[String]) {
        let mut ring = Vec::with_capacity(nodes.len() * self.replicas);
        let mut node_by_slot = HashMap::with_capacity(nodes.len() * self.replicas);

        for node in nodes {
            for i in 0..self.replicas {
                let slot_key = format!("{node}#{i}");
                let slot = crc32fast::hash(slot_key.as_bytes());
                ring.push(slot);
                node_by_slot.insert(slot, node.clone());
            }
        }
        ring.sort_unstable();

        let mut state = self.inner.write().unwrap();
        state.ring = ring;
        state.node_by_slot = node_by_slot;
    }

    /// Returns the node owning `key`, or an empty string if the ring has no
    /// nodes.
    pub fn get_node(&self, key: &str) -> String {
        let state = self.inner.read().unwrap();
        if state.ring.is_empty() {
            return String::new();
        }

        let hash = crc32fast::hash(key.as_bytes());
        let idx = state.ring.partition_point(|&slot| slot < hash);
        let idx = if idx == state.ring.len() { 0 } else { idx };
        state
            .node_by_slot
            .get(&state.ring[idx])
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_returns_empty_node() {
        let ring = HashRing::new(&[], 100);
        assert_eq!(ring.get_node("anything"), "");
    }

    #[test]
    fn stable_mapping_for_unchanged_node_set() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ring = HashRing::new(&nodes, 100);
        let first = ring.get_node("some/cache/key");
        let second = ring.get_node("some/cache/key");
        assert_eq!(first, second);
        assert!(nodes.contains(&first));
    }

    #[test]
    fn zero_replicas_falls_back_to_default() {
        let ring = HashRing::new(&["a".to_string()], 0);
        assert!(!ring.is_empty());
    }

    #[test]
    fn wraps_past_the_last_slot() {
        let nodes = vec!["only".to_string()];
        let ring = HashRing::new(&nodes, 4);
        for key in ["a", "b", "c", "zzz", ""] {
            assert_eq!(ring.get_node(key), "only");
        }
    }
}
