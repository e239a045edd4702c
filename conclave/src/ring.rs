//! Consistent-hash ring for queue partition placement.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::hash::Hasher;

use crate::NodeId;

/// Virtual nodes placed on the ring per physical node.
pub const VIRTUAL_NODES: u32 = 128;

/// A consistent-hash ring over node ids.
///
/// The primary for a key is the first virtual node clockwise from the key's
/// hash. Virtual nodes smooth the distribution so that losing a node spreads
/// its keys over the survivors instead of dumping them on one neighbor.
#[derive(Debug, Clone)]
pub struct HashRing {
    points: BTreeMap<u64, NodeId>,
    vnodes: u32,
}

impl HashRing {
    /// Build a ring over the given nodes with the default virtual node count.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self::with_vnodes(nodes, VIRTUAL_NODES)
    }

    /// Build a ring with an explicit virtual node count.
    pub fn with_vnodes(nodes: impl IntoIterator<Item = NodeId>, vnodes: u32) -> Self {
        let mut ring = Self {
            points: BTreeMap::new(),
            vnodes,
        };
        for node in nodes {
            ring.add_node(&node);
        }
        ring
    }

    fn add_node(&mut self, node: &NodeId) {
        for index in 0..self.vnodes {
            let point = hash_of(&(node, index));
            self.points.insert(point, node.clone());
        }
    }

    /// The node owning `key`: the first point clockwise from the key's hash.
    pub fn node_for(&self, key: &str) -> Option<&NodeId> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash_of(&key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Hash with explicitly keyless `DefaultHasher` state, so placement agrees
/// across processes.
fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
