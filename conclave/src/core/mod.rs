//! The core logic of a Raft node.

mod append_entries;
mod client;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::client::ClientRequestEntry;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::network::ClusterNetwork;
use crate::quorum;
use crate::raft::RaftMsg;
use crate::raft::VoteResponse;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::sm::StateMachine;
use crate::storage::HardState;
use crate::storage::RaftStorage;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The core type implementing the Raft protocol.
pub struct RaftCore<N: ClusterNetwork, S: RaftStorage> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's static membership roster.
    membership: BTreeSet<NodeId>,
    /// The `ClusterNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,
    /// The shared state machine to which committed entries are applied.
    fabric: Arc<Mutex<StateMachine>>,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Is initialized to 0, and increases monotonically. The commit index
    /// must be determined by a leader after successfully committing a new log
    /// to the cluster; it is never persisted.
    commit_index: u64,

    /// The log id of the highest log entry which has been applied to the local state machine.
    last_applied: LogId,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically. This is normally based on
    /// the leader's term which is communicated to other members via the AppendEntries protocol,
    /// but this may also be incremented when a follower becomes a candidate.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    ///
    /// Each server will vote for at most one candidate in a given term, on a
    /// first-come-first-served basis. See §5.4.1 for additional restriction on votes.
    voted_for: Option<NodeId>,

    /// The last entry to be appended to the log.
    last_log_id: LogId,

    /// The stream of join handles from state machine replication tasks.
    ///
    /// This abstraction is needed to ensure that replicating to the state machine does not block
    /// the AppendEntries RPC flow.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<RaftResult<Option<LogId>>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: ClusterNetwork, S: RaftStorage> RaftCore<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        fabric: Arc<Mutex<StateMachine>>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let membership = config.members.keys().cloned().collect();
        let this = Self {
            id,
            config,
            membership,
            network,
            storage,
            fabric,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=%self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        // NOTE: it is unsafe to initialize the node's commit index to any
        // other value. The commit index must be determined by a leader after
        // successfully committing a new log to the cluster.
        self.commit_index = 0;
        self.last_applied = self.fabric.lock().expect("state machine mutex poisoned").last_applied();

        self.target_state = State::Follower;
        self.next_election_timeout =
            Some(Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout()));

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        // This is the central loop of the system. The Raft core assumes a few different roles based
        // on cluster state. The Raft core will delegate control to the different state
        // controllers and simply awaits the delegated loop to return, which will only take place
        // if some error has been encountered, or if a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id.clone(),
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader.clone(),
            membership: self.membership.clone(),
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=%self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();

        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!("update election timeout after: {:?}", t);

        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id.clone());
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such, the
    /// Raft node will be instructed to stop. If such behavior is not needed, then don't use this
    /// interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=%self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Schedule an apply of all committed-but-unapplied entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self))]
    fn replicate_to_state_machine_if_needed(&mut self) {
        if self.commit_index <= self.last_applied.index {
            return;
        }
        let start = self.last_applied.index + 1;
        let stop = self.commit_index + 1;
        let storage = self.storage.clone();
        let fabric = self.fabric.clone();
        let handle = tokio::spawn(
            async move {
                let entries = storage.get_log_entries(start..stop).await.map_err(RaftError::RaftStorage)?;
                let mut last_applied = None;
                {
                    let mut sm = fabric.lock().expect("state machine mutex poisoned");
                    for entry in &entries {
                        sm.apply(entry);
                        last_applied = Some(entry.log_id);
                    }
                }
                Ok(last_applied)
            }
            .instrument(tracing::debug_span!("apply-to-sm")),
        );
        self.replicate_to_sm_handle.push(handle);
        // Advance eagerly so overlapping schedules are not created; the state
        // machine itself skips replayed indexes.
        self.last_applied.index = self.commit_index;
    }

    /// Handle the output of an async task replicating entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(self) fn handle_replicate_to_sm_result(&mut self, res: RaftResult<Option<LogId>>) -> RaftResult<()> {
        let last_applied_opt = res?;

        tracing::debug!("last_applied: {:?}", last_applied_opt);

        if let Some(last_applied) = last_applied_opt {
            self.last_applied = last_applied;
        }

        self.report_metrics();
        Ok(())
    }

    /// Reject a client write request when this node is not the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_write_request(
        &self,
        command: crate::command::Command,
        tx: crate::raft::ClientWriteResponseTx,
    ) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(command, self.current_leader.clone())));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, N: ClusterNetwork, S: RaftStorage> {
    pub(super) core: &'a mut RaftCore<N, S>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,

    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// A buffer of client requests which have been appended locally and are awaiting to be committed to the cluster.
    pub(super) awaiting_committed: Vec<ClientRequestEntry>,
}

impl<'a, N: ClusterNetwork, S: RaftStorage> LeaderState<'a, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=%self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams.
        let targets = self
            .core
            .membership
            .iter()
            .filter(|elem| *elem != &self.core.id)
            .cloned()
            .collect::<Vec<_>>();

        for target in targets {
            let state = self.spawn_replication_stream(target.clone());
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        // Per §8, commit an initial entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);

                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            tracing::debug!("leader recv from rx_api: AppendEntries, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            tracing::debug!("leader recv from rx_api: RequestVote, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{command, tx} => {
                            tracing::debug!("leader recv from rx_api: ClientWriteRequest, {}", command.summary());
                            self.handle_client_write_request(command, tx).await;
                        }
                    }
                },
                Some((event, span)) = self.replication_rx.recv() => {
                    tracing::debug!("leader recv from replication_rx: {}", event.summary());
                    let _ent = span.enter();
                    self.handle_replica_event(event).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Spawn a replication stream for the target peer.
    fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id.clone(),
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            // We do not know what the follower holds until it confirms.
            matched: LogId::default(),
            replstream,
        }
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
struct ReplicationState {
    pub matched: LogId,
    pub replstream: ReplicationStream,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, N: ClusterNetwork, S: RaftStorage> {
    core: &'a mut RaftCore<N, S>,
    /// The set of peers which have granted a vote this term.
    votes_granted: HashSet<NodeId>,
    /// The number of votes needed in order to become the Raft leader.
    votes_needed: usize,
}

impl<'a, N: ClusterNetwork, S: RaftStorage> CandidateState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self {
            core,
            votes_granted: HashSet::new(),
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=%self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup initial state per term. We must vote for ourselves per the Raft spec.
            self.votes_granted = std::iter::once(self.core.id.clone()).collect();
            self.votes_needed = quorum::majority_of(self.core.membership.len());

            // Setup new term.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id.clone());
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();

            // A single-member roster elects itself without sending a thing.
            if self.votes_granted.len() >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                continue;
            }

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    _ = timeout_fut => break, // This election has timed-out. Break to outer loop, which starts a new term.
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::ClientWriteRequest{command, tx} => {
                                self.core.forward_client_write_request(command, tx);
                            }
                        }
                    },
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }

    /// Record a granted vote, becoming leader on reaching a majority.
    fn register_vote(&mut self, peer: NodeId) {
        self.votes_granted.insert(peer);
        if self.votes_granted.len() >= self.votes_needed {
            tracing::debug!("node {} has won election in term {}", self.core.id, self.core.current_term);
            self.core.set_target_state(State::Leader);
        }
    }

    /// Handle a vote response from a peer.
    #[tracing::instrument(level = "trace", skip(self, res))]
    async fn handle_vote_response(&mut self, res: VoteResponse, peer: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        if res.vote_granted {
            self.register_vote(peer);
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, N: ClusterNetwork, S: RaftStorage> {
    core: &'a mut RaftCore<N, S>,
}

impl<'a, N: ClusterNetwork, S: RaftStorage> FollowerState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=%self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout()); // Value is updated as heartbeats are received.

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => self.core.set_target_state(State::Candidate),
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{command, tx} => {
                            self.core.forward_client_write_request(command, tx);
                        }
                    }
                },
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
