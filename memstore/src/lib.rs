//! An in-memory implementation of the `conclave` storage traits.
//!
//! `MemStore` keeps the Raft hard state and log in `RwLock`'d maps and
//! `MemSink` does the same for the durable key-value scratchpad. Both are
//! meant for the integration test harness and single-process embeddings;
//! production deployments supply fsync-backed implementations of the same
//! traits.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use conclave::raft::Entry;
use conclave::storage::HardState;
use conclave::storage::InitialState;
use conclave::KvSink;
use conclave::LogId;
use conclave::NodeId;
use conclave::RaftStorage;
use tokio::sync::RwLock;

/// An in-memory implementation of the `RaftStorage` trait.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry>>,
    hs: RwLock<Option<HardState>>,
}

impl MemStore {
    /// Create a new `MemStore` instance for the given node id.
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            log: RwLock::new(BTreeMap::new()),
            hs: RwLock::new(None),
        }
    }

    /// The node id this store was created for.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Read the current hard state, for test assertions.
    pub async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }

    /// The number of entries currently in the log, for test assertions.
    pub async fn log_len(&self) -> usize {
        self.log.read().await.len()
    }
}

#[async_trait]
impl RaftStorage for MemStore {
    async fn get_initial_state(&self) -> Result<InitialState> {
        let log = self.log.read().await;
        let hs = self.hs.read().await;
        let last_log_id = log.values().next_back().map(|entry| entry.log_id).unwrap_or_default();
        Ok(InitialState {
            last_log_id,
            hard_state: hs.clone().unwrap_or_default(),
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        tracing::trace!(id=%self.id, ?hs, "save_hard_state");
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let log = self.log.read().await;
        Ok(log.values().next_back().map(|entry| entry.log_id).unwrap_or_default())
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(key, _)| *key).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }
}

/// An in-memory implementation of the `KvSink` trait.
#[derive(Default)]
pub struct MemSink {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of records currently in the sink, for test assertions.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl KvSink for MemSink {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.data.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read().await;
        let start = Bound::Included(prefix.to_string());
        Ok(data
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use conclave::raft::EntryPayload;

    use super::*;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            log_id: LogId { term, index },
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn test_initial_state_of_pristine_store() {
        let store = MemStore::new("n1");
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.last_log_id, LogId::default());
        assert_eq!(state.hard_state, HardState::default());
    }

    #[tokio::test]
    async fn test_hard_state_roundtrip() {
        let store = MemStore::new("n1");
        let hs = HardState {
            current_term: 3,
            voted_for: Some("n2".to_string()),
        };
        store.save_hard_state(&hs).await.unwrap();
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.hard_state, hs);
    }

    #[tokio::test]
    async fn test_log_append_fetch_delete() {
        let store = MemStore::new("n1");
        let entries = vec![entry(1, 1), entry(1, 2), entry(2, 3)];
        let refs: Vec<&Entry> = entries.iter().collect();
        store.append_to_log(&refs).await.unwrap();

        assert_eq!(store.get_last_log_id().await.unwrap(), LogId { term: 2, index: 3 });
        let fetched = store.get_log_entries(2..).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(store.try_get_log_entry(2).await.unwrap().is_some());

        store.delete_logs_from(2..).await.unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId { term: 1, index: 1 });
        assert!(store.try_get_log_entry(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sink_scan_by_prefix() {
        let sink = MemSink::new();
        sink.put("queue/msg/a", b"1").await.unwrap();
        sink.put("queue/msg/b", b"2").await.unwrap();
        sink.put("cache/k", b"3").await.unwrap();

        let scanned = sink.scan("queue/msg/").await.unwrap();
        assert_eq!(scanned.len(), 2);

        sink.delete("queue/msg/a").await.unwrap();
        assert_eq!(sink.scan("queue/msg/").await.unwrap().len(), 1);
        assert_eq!(sink.get("cache/k").await.unwrap(), Some(b"3".to_vec()));
    }
}
