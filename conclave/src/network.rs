//! The cluster network interface.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::command::MessageId;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::ClientId;
use crate::NodeId;

/// A trait defining the interface for sending messages between cluster nodes.
///
/// Implementations deliver to the named peer with best-effort semantics:
/// errors returned here are treated as transient by every caller (the core
/// wraps sends in timeouts and retries; the node layer backs off and
/// re-routes). Network failures must never surface to clients as anything
/// other than timeouts or health transitions.
#[async_trait]
pub trait ClusterNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Forward a client command to the target node for proposal through its Raft handle.
    async fn send_propose(&self, target: NodeId, rpc: ProposeRequest) -> Result<ProposeResponse>;

    /// Forward a queue operation to the target node (the partition primary).
    async fn send_queue_forward(&self, target: NodeId, rpc: QueueForwardRequest) -> Result<QueueForwardResponse>;

    /// Probe the target node's local cache for a key.
    async fn send_cache_probe(&self, target: NodeId, rpc: CacheProbeRequest) -> Result<CacheProbeResponse>;
}

/// A client command forwarded to (what the sender believes is) the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub command: Command,
}

/// The reply to a forwarded proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProposeResponse {
    /// The command was committed and applied at the given log index.
    Applied { index: u64, response: CommandResponse },
    /// The receiving node is not the leader; retry against the hint.
    NotLeader { leader_hint: Option<NodeId> },
    /// The receiving node failed internally (e.g. it is shutting down).
    Failed { error: String },
}

/// A queue operation forwarded to the partition primary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueueForwardRequest {
    Enqueue {
        queue: String,
        payload: Vec<u8>,
    },
    Dequeue {
        queue: String,
        consumer: ClientId,
        visibility_ms: u64,
    },
}

/// The reply to a forwarded queue operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueueForwardResponse {
    Enqueued { message_id: MessageId },
    Delivery(Option<QueueDelivery>),
    /// The receiving node could not complete the operation.
    Failed(ForwardError),
}

/// The wire form of a [`crate::ClusterError`] surfaced by a forwarded
/// operation, preserving the kinds a caller reacts to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ForwardError {
    Timeout,
    LeaderUnknown,
    UnknownMessage(MessageId),
    Denied(String),
    Other(String),
}

impl From<&crate::ClusterError> for ForwardError {
    fn from(err: &crate::ClusterError) -> Self {
        use crate::ClusterError;
        match err {
            ClusterError::Timeout => ForwardError::Timeout,
            ClusterError::LeaderUnknown => ForwardError::LeaderUnknown,
            ClusterError::UnknownMessage(id) => ForwardError::UnknownMessage(*id),
            ClusterError::Denied(reason) => ForwardError::Denied(reason.clone()),
            other => ForwardError::Other(other.to_string()),
        }
    }
}

impl From<ForwardError> for crate::ClusterError {
    fn from(err: ForwardError) -> Self {
        use crate::ClusterError;
        match err {
            ForwardError::Timeout => ClusterError::Timeout,
            ForwardError::LeaderUnknown => ClusterError::LeaderUnknown,
            ForwardError::UnknownMessage(id) => ClusterError::UnknownMessage(id),
            ForwardError::Denied(reason) => ClusterError::Denied(reason),
            ForwardError::Other(reason) => ClusterError::Denied(reason),
        }
    }
}

/// A message delivered to a consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDelivery {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub attempts: u32,
}

/// A read probe for a peer's local cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheProbeRequest {
    pub key: String,
}

/// The reply to a cache probe.
///
/// A peer holding the key in M or E demotes itself to S before answering and
/// always supplies the value; a peer in S supplies the value without a state
/// change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheProbeResponse {
    pub found: Option<CacheProbeHit>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheProbeHit {
    /// The state the responding peer held the line in *before* the probe.
    pub state: ProbedState,
    pub value: Vec<u8>,
}

/// The pre-probe MESI state reported by a responding peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProbedState {
    Shared,
    Exclusive,
    Modified,
}
