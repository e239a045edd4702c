//! Public Raft interface and data types.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::ClusterNetwork;
use crate::sm::StateMachine;
use crate::storage::RaftStorage;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

struct RaftInner<N: ClusterNetwork, S: RaftStorage> {
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: tokio::sync::Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: tokio::sync::Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node: it hands RPCs and
/// client commands over to the spawned [`RaftCore`] task and exposes the
/// metrics channel. The node layer builds the client-facing coordination
/// services on top of this handle.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this
/// indicates that the Raft node is shutting down (potentially for data safety
/// reasons due to a storage error), and the `shutdown` method should be
/// called on this type to await the shutdown of the node.
pub struct Raft<N: ClusterNetwork, S: RaftStorage> {
    inner: Arc<RaftInner<N, S>>,
}

impl<N: ClusterNetwork, S: RaftStorage> Raft<N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within
    /// the cluster. Must be present in `config.members` and stable across
    /// restarts.
    ///
    /// ### `config`
    /// The cluster's runtime config, including the full static roster.
    ///
    /// ### `network`
    /// An implementation of the `ClusterNetwork` trait which will be used by
    /// Raft for sending RPCs to peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait used for the durable log
    /// and hard state.
    ///
    /// ### `fabric`
    /// The shared state machine to which committed entries are applied. The
    /// same handle is held by the node layer for local reads.
    #[tracing::instrument(level="trace", skip(config, network, storage, fabric), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        fabric: Arc<Mutex<StateMachine>>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let membership = config.members.keys().cloned().collect();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id.clone(), membership));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, fabric, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: tokio::sync::Mutex::new(Some(raft_handle)),
            tx_shutdown: tokio::sync::Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job
    /// at staying up-to-date, and is how the node layer decides where to
    /// route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader.clone()
    }

    /// Submit a mutating client command to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then
    /// applied to the shared state machine. The result of applying the
    /// command will be returned as the response from this method.
    ///
    /// If this node is not the leader, the command is handed back via
    /// `ClientWriteError::ForwardToLeader` along with the current leader
    /// hint, and the caller is responsible for forwarding.
    #[tracing::instrument(level = "debug", skip(self, command), fields(command=%command.summary()))]
    pub async fn client_write(&self, command: Command) -> Result<ClientWriteResponse, ClientWriteError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        let res = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { command, tx }, span));

        if let Err(e) = res {
            tracing::error!("error when Raft::client_write: send to tx_api: {}", e);
            return Err(ClientWriteError::RaftError(RaftError::ShuttingDown));
        }

        let res = rx.await;
        match res {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", e);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use conclave::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log-3").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: ClusterNetwork, S: RaftStorage> Clone for Raft<N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    ClientWriteRequest {
        command: Command,
        tx: ClientWriteResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,
    /// A value used to implement the _conflicting term_ optimization outlined in §5.3.
    ///
    /// This value will only be present, and should only be considered, when `success` is `false`.
    pub conflict_opt: Option<ConflictOpt>,
}

/// A struct used to implement the _conflicting term_ optimization outlined in §5.3 for log replication.
///
/// This value will only be present, and should only be considered, when an `AppendEntriesResponse`
/// object has a `success` value of `false`.
///
/// This implementation of Raft uses this value to more quickly synchronize a leader with its
/// followers which may be some distance behind in replication, may have conflicting entries, or
/// which may be new to the cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    /// The most recent entry which does not conflict with the received request.
    pub log_id: LogId,
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,

    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal log entry carrying a service command.
    Normal(Command),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(cmd) => cmd.summary(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The response to a client write request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// The outcome of applying the command to the state machine.
    pub response: CommandResponse,
}
