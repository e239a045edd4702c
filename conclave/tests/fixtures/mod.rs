//! Fixtures for testing conclave clusters in-process.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use conclave::async_trait::async_trait;
use conclave::metrics::RaftMetrics;
use conclave::network::CacheProbeRequest;
use conclave::network::CacheProbeResponse;
use conclave::network::ClusterNetwork;
use conclave::network::ProposeRequest;
use conclave::network::ProposeResponse;
use conclave::network::QueueForwardRequest;
use conclave::network::QueueForwardResponse;
use conclave::raft::AppendEntriesRequest;
use conclave::raft::AppendEntriesResponse;
use conclave::raft::VoteRequest;
use conclave::raft::VoteResponse;
use conclave::detector::NodeHealth;
use conclave::ClusterNode;
use conclave::Config;
use conclave::NodeId;
use conclave::State;
use memstore::MemSink;
use memstore::MemStore;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Instant;

/// A concrete node type used during testing.
pub type TestNode = ClusterNode<RouterHandle, MemStore, MemSink>;

/// Initialize the tracing system.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Build a config with the given node ids as roster, using in-process
/// addresses. Timeouts are the production defaults; tests which need seeded
/// elections build their own per-node configs.
pub fn cluster_config(cluster: &str, ids: &[&str]) -> Arc<Config> {
    let mut builder = Config::build(cluster.into());
    for id in ids {
        builder = builder.member(*id, format!("local://{}", id));
    }
    Arc::new(builder.validate().expect("failed to build config"))
}

struct NodeEntry {
    node: Arc<TestNode>,
    storage: Arc<MemStore>,
    sink: Arc<MemSink>,
    health_tx: watch::Sender<BTreeMap<NodeId, NodeHealth>>,
}

#[derive(Default)]
struct RouterInner {
    table: RwLock<BTreeMap<NodeId, NodeEntry>>,
    /// Nodes on the far side of a partition. Traffic is blocked iff exactly
    /// one endpoint is in this set, so isolated nodes can still talk to each
    /// other (a real two-sided partition).
    isolated: RwLock<HashSet<NodeId>>,
}

impl RouterInner {
    async fn blocked(&self, a: &NodeId, b: &NodeId) -> bool {
        let isolated = self.isolated.read().await;
        isolated.contains(a) != isolated.contains(b)
    }
}

/// A type which emulates a network transport by routing between in-process
/// nodes, with partition support.
#[derive(Default)]
pub struct ClusterRouter {
    inner: Arc<RouterInner>,
}

/// The per-node network handle; knows its owner so partitions cut both
/// request directions.
pub struct RouterHandle {
    id: NodeId,
    inner: Arc<RouterInner>,
}

impl ClusterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create and register a new node bearing the given ID.
    pub async fn new_node(self: &Arc<Self>, id: &str, config: Arc<Config>) -> Arc<TestNode> {
        let storage = Arc::new(MemStore::new(id));
        let sink = Arc::new(MemSink::new());
        self.new_node_with_parts(id, config, storage, sink).await
    }

    pub async fn new_node_with_parts(
        self: &Arc<Self>,
        id: &str,
        config: Arc<Config>,
        storage: Arc<MemStore>,
        sink: Arc<MemSink>,
    ) -> Arc<TestNode> {
        let handle = Arc::new(RouterHandle {
            id: id.to_string(),
            inner: self.inner.clone(),
        });
        // Every peer is reported alive for the lifetime of the test cluster;
        // detector-driven transitions are exercised at the transport level.
        let health: BTreeMap<NodeId, NodeHealth> = config
            .members
            .keys()
            .filter(|peer| peer.as_str() != id)
            .map(|peer| (peer.clone(), NodeHealth::Alive))
            .collect();
        let (health_tx, health_rx) = watch::channel(health);

        let node = ClusterNode::spawn(id.to_string(), config, handle, storage.clone(), sink.clone(), health_rx);
        let mut table = self.inner.table.write().await;
        table.insert(
            id.to_string(),
            NodeEntry {
                node: node.clone(),
                storage,
                sink,
                health_tx,
            },
        );
        node
    }

    /// Get a handle to a registered node.
    pub async fn node(&self, id: &str) -> Arc<TestNode> {
        let table = self.inner.table.read().await;
        table.get(id).map(|entry| entry.node.clone()).unwrap_or_else(|| panic!("node {} not registered", id))
    }

    /// Get a handle to the storage backend of the target node.
    pub async fn storage(&self, id: &str) -> Arc<MemStore> {
        let table = self.inner.table.read().await;
        table.get(id).map(|entry| entry.storage.clone()).unwrap_or_else(|| panic!("node {} not registered", id))
    }

    /// Get a handle to the persistent sink of the target node.
    pub async fn sink(&self, id: &str) -> Arc<MemSink> {
        let table = self.inner.table.read().await;
        table.get(id).map(|entry| entry.sink.clone()).unwrap_or_else(|| panic!("node {} not registered", id))
    }

    /// Move the given node to the far side of the partition.
    pub async fn isolate_node(&self, id: &str) {
        tracing::info!(node = id, "isolating node");
        self.inner.isolated.write().await.insert(id.to_string());
    }

    /// Restore the given node to the main partition.
    pub async fn restore_node(&self, id: &str) {
        tracing::info!(node = id, "restoring node");
        self.inner.isolated.write().await.remove(id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let table = self.inner.table.read().await;
        table.values().map(|entry| entry.node.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current leader, ignoring isolated nodes.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.inner.isolated.read().await.clone();
        self.latest_metrics().await.into_iter().find_map(|metrics| {
            if metrics.current_leader.as_ref() == Some(&metrics.id) && !isolated.contains(&metrics.id) {
                Some(metrics.id)
            } else {
                None
            }
        })
    }

    /// Wait until a leader is elected on the main partition.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("no leader elected within {:?}", timeout));
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait for a node's metrics to satisfy some condition.
    pub async fn wait_for_metrics<T>(
        &self,
        node_id: &str,
        func: T,
        timeout: Duration,
        msg: &str,
    ) -> Result<RaftMetrics>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let node = self.node(node_id).await;
        node.raft()
            .wait(Some(timeout))
            .metrics(func, msg)
            .await
            .with_context(|| format!("node {}", node_id))
    }

    /// Wait for the given nodes to reach the given state.
    pub async fn wait_for_state(&self, node_ids: &[&str], want: State, timeout: Duration, msg: &str) -> Result<()> {
        for id in node_ids {
            self.wait_for_metrics(id, |m| m.state == want, timeout, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to have applied at least `want` log entries.
    pub async fn wait_for_log(&self, node_ids: &[&str], want: u64, timeout: Duration, msg: &str) -> Result<()> {
        for id in node_ids {
            self.wait_for_metrics(id, |m| m.last_applied >= want && m.last_log_index >= want, timeout, msg)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterNetwork for RouterHandle {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        if self.inner.blocked(&self.id, &target).await {
            return Err(anyhow!("partitioned from {}", target));
        }
        let table = self.inner.table.read().await;
        let entry = table.get(&target).ok_or_else(|| anyhow!("target node {} not found", target))?;
        let node = entry.node.clone();
        drop(table);
        Ok(node.raft().append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        if self.inner.blocked(&self.id, &target).await {
            return Err(anyhow!("partitioned from {}", target));
        }
        let table = self.inner.table.read().await;
        let entry = table.get(&target).ok_or_else(|| anyhow!("target node {} not found", target))?;
        let node = entry.node.clone();
        drop(table);
        Ok(node.raft().vote(rpc).await?)
    }

    async fn send_propose(&self, target: NodeId, rpc: ProposeRequest) -> Result<ProposeResponse> {
        if self.inner.blocked(&self.id, &target).await {
            return Err(anyhow!("partitioned from {}", target));
        }
        let table = self.inner.table.read().await;
        let entry = table.get(&target).ok_or_else(|| anyhow!("target node {} not found", target))?;
        let node = entry.node.clone();
        drop(table);
        Ok(node.handle_propose(rpc).await)
    }

    async fn send_queue_forward(&self, target: NodeId, rpc: QueueForwardRequest) -> Result<QueueForwardResponse> {
        if self.inner.blocked(&self.id, &target).await {
            return Err(anyhow!("partitioned from {}", target));
        }
        let table = self.inner.table.read().await;
        let entry = table.get(&target).ok_or_else(|| anyhow!("target node {} not found", target))?;
        let node = entry.node.clone();
        drop(table);
        Ok(node.handle_queue_forward(rpc).await)
    }

    async fn send_cache_probe(&self, target: NodeId, rpc: CacheProbeRequest) -> Result<CacheProbeResponse> {
        if self.inner.blocked(&self.id, &target).await {
            return Err(anyhow!("partitioned from {}", target));
        }
        let table = self.inner.table.read().await;
        let entry = table.get(&target).ok_or_else(|| anyhow!("target node {} not found", target))?;
        let node = entry.node.clone();
        drop(table);
        Ok(node.handle_cache_probe(&rpc))
    }
}
