//! The MESI-coherent cache store.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::command::CacheResponse;
use crate::NodeId;

/// The local MESI state of a valid cache line. An absent key is Invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineState {
    /// The only valid copy cluster-wide, dirty with respect to the sink.
    Modified,
    /// The only valid copy cluster-wide, clean.
    Exclusive,
    /// One of possibly several valid copies.
    Shared,
}

/// A locally held cache line.
#[derive(Clone, Debug)]
pub struct CacheLine {
    pub value: Vec<u8>,
    pub state: LineState,
    last_used: u64,
}

/// The per-node cache table.
///
/// Ownership transitions (put, exclusive claim, modified-line eviction) are
/// applied from the replicated log: the same command sequence reaches every
/// node and each node reacts according to whether it is the origin. Probe
/// demotions and LRU bookkeeping are node-local.
pub struct CacheStore {
    node_id: NodeId,
    capacity: usize,
    lines: HashMap<String, CacheLine>,
    /// Values fetched from the sink, parked until this node's exclusive
    /// claim commits.
    staged: HashMap<String, Vec<u8>>,
    clock: u64,
}

impl CacheStore {
    pub fn new(node_id: NodeId, capacity: usize) -> Self {
        Self {
            node_id,
            capacity,
            lines: HashMap::new(),
            staged: HashMap::new(),
            clock: 0,
        }
    }

    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Apply a committed `CachePut`: the origin becomes the sole (modified)
    /// holder, everyone else invalidates.
    pub fn apply_put(&mut self, key: &str, value: &[u8], origin: &NodeId) -> CacheResponse {
        if *origin == self.node_id {
            let last_used = self.touch();
            self.staged.remove(key);
            self.lines.insert(
                key.to_string(),
                CacheLine {
                    value: value.to_vec(),
                    state: LineState::Modified,
                    last_used,
                },
            );
        } else {
            self.lines.remove(key);
            self.staged.remove(key);
        }
        CacheResponse::Stored
    }

    /// Apply a committed `CacheInvalidate` (exclusive claim): the origin
    /// promotes its staged miss-fill to an exclusive clean line, everyone
    /// else invalidates.
    pub fn apply_claim(&mut self, key: &str, origin: &NodeId) -> CacheResponse {
        if *origin == self.node_id {
            if let Some(value) = self.staged.remove(key) {
                let last_used = self.touch();
                self.lines.insert(
                    key.to_string(),
                    CacheLine {
                        value,
                        state: LineState::Exclusive,
                        last_used,
                    },
                );
            }
        } else {
            self.lines.remove(key);
            self.staged.remove(key);
        }
        CacheResponse::Claimed
    }

    /// Apply a committed `CacheEvict`: the origin drops its written-back
    /// modified line. Other nodes hold no valid copy by invariant.
    pub fn apply_evict(&mut self, key: &str, origin: &NodeId) -> CacheResponse {
        if *origin == self.node_id {
            self.lines.remove(key);
        }
        CacheResponse::Evicted
    }

    /// Serve a local read, refreshing the LRU position.
    pub fn get_local(&mut self, key: &str) -> Option<Vec<u8>> {
        let last_used = self.touch();
        let line = self.lines.get_mut(key)?;
        line.last_used = last_used;
        Some(line.value.clone())
    }

    /// Serve a peer's read probe.
    ///
    /// A line held in M or E is demoted to S (the requester will enter S);
    /// the pre-probe state and the value are reported back.
    pub fn probe(&mut self, key: &str) -> Option<(LineState, Vec<u8>)> {
        let line = self.lines.get_mut(key)?;
        let before = line.state;
        if matches!(before, LineState::Modified | LineState::Exclusive) {
            line.state = LineState::Shared;
        }
        Some((before, line.value.clone()))
    }

    /// Install a value learned from a peer as a shared copy.
    pub fn insert_shared(&mut self, key: &str, value: Vec<u8>) {
        let last_used = self.touch();
        self.lines.insert(
            key.to_string(),
            CacheLine {
                value,
                state: LineState::Shared,
                last_used,
            },
        );
    }

    /// Park a value fetched from the sink until the exclusive claim commits.
    pub fn stage_fill(&mut self, key: &str, value: Vec<u8>) {
        self.staged.insert(key.to_string(), value);
    }

    /// The state of the local line for `key`, if valid.
    pub fn line_state(&self, key: &str) -> Option<LineState> {
        self.lines.get(key).map(|line| line.state)
    }

    /// True when the table exceeds its configured capacity.
    pub fn over_capacity(&self) -> bool {
        self.lines.len() > self.capacity
    }

    /// The least-recently-used line, candidate for eviction.
    pub fn lru_victim(&self) -> Option<(String, LineState, Vec<u8>)> {
        self.lines
            .iter()
            .min_by_key(|(key, line)| (line.last_used, (*key).clone()))
            .map(|(key, line)| (key.clone(), line.state, line.value.clone()))
    }

    /// Drop a local line without coordination (S/E/I eviction).
    pub fn remove_local(&mut self, key: &str) {
        self.lines.remove(key);
    }

    /// The number of valid local lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
