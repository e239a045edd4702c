//! The cluster node: the client-facing surface over consensus and the three
//! coordination services.
//!
//! A `ClusterNode` owns the Raft handle, the shared state machine and the
//! long-lived background tasks of a node: the apply-event loop resolving
//! parked lock waiters, the sink writer draining durable writes, the
//! leader-only deadlock scanner and the per-partition visibility sweeper.
//! Any node accepts any operation; mutating commands are proposed through
//! the current leader, queue operations are routed to their partition
//! primary first.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::command::LockMode;
use crate::command::LockResponse;
use crate::command::MessageId;
use crate::command::QueueResponse;
use crate::config::Config;
use crate::core::State;
use crate::detector::routable_nodes;
use crate::detector::NodeHealth;
use crate::error::ClientWriteError;
use crate::error::ClusterError;
use crate::metrics::RaftMetrics;
use crate::network::CacheProbeHit;
use crate::network::CacheProbeRequest;
use crate::network::CacheProbeResponse;
use crate::network::ClusterNetwork;
use crate::network::ProbedState;
use crate::network::ProposeRequest;
use crate::network::ProposeResponse;
use crate::network::QueueDelivery;
use crate::network::QueueForwardRequest;
use crate::network::QueueForwardResponse;
use crate::raft::ClientWriteResponse;
use crate::raft::Raft;
use crate::ring::HashRing;
use crate::sm::cache::LineState;
use crate::sm::lock::LockSnapshot;
use crate::sm::queue::is_dead_letter_queue;
use crate::sm::ApplyEvent;
use crate::sm::SinkOp;
use crate::sm::StateMachine;
use crate::storage::KvSink;
use crate::storage::RaftStorage;
use crate::transport::frame::FrameBody;
use crate::transport::InboundRequest;
use crate::ClientId;
use crate::NodeId;

/// The deadline applied to a single client operation, covering leader
/// discovery, forwarding and the consensus round trip.
const OP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between proposal routing retries while the leader is unknown.
const PROPOSE_RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Interval of the visibility-timeout sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
/// How many times a dequeue retries its head selection after losing a
/// reservation race.
const DEQUEUE_RETRY_LIMIT: usize = 8;

/// Namespace for cache write-back records in the persistent sink.
fn cache_sink_key(key: &str) -> String {
    format!("cache/{}", key)
}

/// Unix time in milliseconds.
fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The outcome delivered to a parked lock waiter.
#[derive(Clone, Copy, Debug)]
enum WaiterOutcome {
    Granted,
    Aborted,
}

type Waiters = Mutex<HashMap<(String, ClientId), oneshot::Sender<WaiterOutcome>>>;

/// A point-in-time view of the cluster as seen from one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub id: NodeId,
    pub state: State,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub peers: Vec<(NodeId, NodeHealth)>,
}

/// A running conclave node.
pub struct ClusterNode<N: ClusterNetwork, S: RaftStorage, K: KvSink> {
    id: NodeId,
    config: Arc<Config>,
    raft: Raft<N, S>,
    network: Arc<N>,
    sink: Arc<K>,
    fabric: Arc<Mutex<StateMachine>>,
    waiters: Arc<Waiters>,
    ring: Arc<Mutex<HashRing>>,
    health_rx: watch::Receiver<BTreeMap<NodeId, NodeHealth>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: ClusterNetwork, S: RaftStorage, K: KvSink> ClusterNode<N, S, K> {
    /// Create a node and spawn its background tasks.
    ///
    /// `health_rx` is the failure detector's watch channel — the bundled
    /// [`crate::transport::TcpTransport::health`] for TCP deployments, or a
    /// static all-alive table for in-process test clusters.
    pub fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        sink: Arc<K>,
        health_rx: watch::Receiver<BTreeMap<NodeId, NodeHealth>>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let fabric = Arc::new(Mutex::new(StateMachine::new(id.clone(), &config, events_tx, sink_tx)));
        let raft = Raft::new(id.clone(), config.clone(), network.clone(), storage, fabric.clone());
        let ring = Arc::new(Mutex::new(HashRing::new(config.members.keys().cloned())));

        let node = Arc::new(Self {
            id,
            config,
            raft,
            network,
            sink,
            fabric,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            ring,
            health_rx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            node.clone().run_event_loop(events_rx).instrument(tracing::debug_span!("event-loop", id=%node.id)),
        ));
        tasks.push(tokio::spawn(
            node.clone().run_sink_writer(sink_rx).instrument(tracing::debug_span!("sink-writer", id=%node.id)),
        ));
        tasks.push(tokio::spawn(
            node.clone().run_deadlock_scanner().instrument(tracing::debug_span!("deadlock-scanner", id=%node.id)),
        ));
        tasks.push(tokio::spawn(
            node.clone().run_visibility_sweeper().instrument(tracing::debug_span!("visibility-sweeper", id=%node.id)),
        ));
        tasks.push(tokio::spawn(
            node.clone().run_health_watcher().instrument(tracing::debug_span!("health-watcher", id=%node.id)),
        ));
        node.tasks.lock().expect("task list mutex poisoned").extend(tasks);
        node
    }

    /// This node's id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// A handle to the Raft metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.raft.metrics()
    }

    /// The raft handle, for embedders needing lower-level access.
    pub fn raft(&self) -> &Raft<N, S> {
        &self.raft
    }

    /// Stop the background tasks and shut the Raft core down.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().expect("task list mutex poisoned").drain(..) {
            task.abort();
        }
        if let Err(err) = self.raft.shutdown().await {
            tracing::error!(error=%err, "error during raft shutdown");
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Client surface //////////////////////////////////////////////////////

    /// Acquire `resource` for `client` in the given mode, waiting up to
    /// `wait_timeout` if the request has to queue.
    ///
    /// `Ok(())` means granted. A request killed by the deadlock detector
    /// surfaces as [`ClusterError::Aborted`]; one which outlives its timeout
    /// is cancelled cluster-wide and surfaces as [`ClusterError::Timeout`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn lock_acquire(
        &self,
        resource: &str,
        client: &str,
        mode: LockMode,
        wait_timeout: Duration,
    ) -> Result<(), ClusterError> {
        let key = (resource.to_string(), client.to_string());
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("waiter map mutex poisoned").insert(key.clone(), tx);

        let result = self.lock_acquire_inner(resource, client, mode, wait_timeout, rx).await;
        self.waiters.lock().expect("waiter map mutex poisoned").remove(&key);
        result
    }

    async fn lock_acquire_inner(
        &self,
        resource: &str,
        client: &str,
        mode: LockMode,
        wait_timeout: Duration,
        rx: oneshot::Receiver<WaiterOutcome>,
    ) -> Result<(), ClusterError> {
        let response = self
            .propose(Command::LockAcquire {
                resource: resource.to_string(),
                client: client.to_string(),
                mode,
            })
            .await?;

        match response.response {
            CommandResponse::Lock(LockResponse::Granted) => Ok(()),
            CommandResponse::Lock(LockResponse::Denied { reason }) => Err(ClusterError::Denied(reason)),
            CommandResponse::Lock(LockResponse::Queued) => match timeout(wait_timeout, rx).await {
                Ok(Ok(WaiterOutcome::Granted)) => Ok(()),
                Ok(Ok(WaiterOutcome::Aborted)) => Err(ClusterError::Aborted),
                Ok(Err(_)) => Err(ClusterError::Timeout),
                Err(_) => {
                    // The acquire timeout runs only here, on the originating
                    // node; on expiry the queued request is cancelled through
                    // the log (or released, if a grant won the race).
                    if let Err(err) = self
                        .propose(Command::LockRelease {
                            resource: resource.to_string(),
                            client: client.to_string(),
                        })
                        .await
                    {
                        tracing::warn!(error=%err, "failed to cancel timed-out lock request");
                    }
                    Err(ClusterError::Timeout)
                }
            },
            other => {
                tracing::error!(?other, "unexpected apply response to a lock acquire");
                Err(ClusterError::Denied("unexpected apply response".to_string()))
            }
        }
    }

    /// Release `resource` held (or waited on) by `client`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn lock_release(&self, resource: &str, client: &str) -> Result<(), ClusterError> {
        let response = self
            .propose(Command::LockRelease {
                resource: resource.to_string(),
                client: client.to_string(),
            })
            .await?;
        match response.response {
            CommandResponse::Lock(LockResponse::Released) => Ok(()),
            CommandResponse::Lock(LockResponse::NotHolder) => Err(ClusterError::NotHolder),
            other => {
                tracing::error!(?other, "unexpected apply response to a lock release");
                Err(ClusterError::Denied("unexpected apply response".to_string()))
            }
        }
    }

    /// A read-only snapshot of the local lock table (eventually consistent).
    pub fn lock_inspect(&self) -> Vec<LockSnapshot> {
        self.fabric.lock().expect("state machine mutex poisoned").locks.snapshot()
    }

    /// Enqueue a payload, routed through the queue's partition primary.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn queue_enqueue(&self, queue: &str, payload: Vec<u8>) -> Result<MessageId, ClusterError> {
        if is_dead_letter_queue(queue) {
            return Err(ClusterError::Denied("cannot enqueue directly to a dead-letter queue".to_string()));
        }
        let primary = self.primary_for(queue)?;
        if primary == self.id {
            return self.enqueue_as_primary(queue, payload).await;
        }
        match self
            .network
            .send_queue_forward(
                primary,
                QueueForwardRequest::Enqueue {
                    queue: queue.to_string(),
                    payload,
                },
            )
            .await
        {
            Ok(QueueForwardResponse::Enqueued { message_id }) => Ok(message_id),
            Ok(QueueForwardResponse::Failed(err)) => Err(err.into()),
            Ok(_) => Err(ClusterError::Denied("mismatched forward reply".to_string())),
            Err(err) => {
                tracing::warn!(error=%err, "enqueue forward failed");
                Err(ClusterError::Timeout)
            }
        }
    }

    /// Dequeue the next message of `queue` for `consumer`, hiding it for the
    /// visibility timeout (the configured default when `None`).
    ///
    /// Dequeuing a dead-letter queue name reads the oldest dead message
    /// without reservation semantics.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn queue_dequeue(
        &self,
        queue: &str,
        consumer: &str,
        visibility: Option<Duration>,
    ) -> Result<Option<QueueDelivery>, ClusterError> {
        let visibility_ms = visibility.map(|d| d.as_millis() as u64).unwrap_or(self.config.queue_default_visibility);
        let primary = self.primary_for(queue)?;
        if primary == self.id {
            return self.dequeue_as_primary(queue, consumer, visibility_ms).await;
        }
        match self
            .network
            .send_queue_forward(
                primary,
                QueueForwardRequest::Dequeue {
                    queue: queue.to_string(),
                    consumer: consumer.to_string(),
                    visibility_ms,
                },
            )
            .await
        {
            Ok(QueueForwardResponse::Delivery(delivery)) => Ok(delivery),
            Ok(QueueForwardResponse::Failed(err)) => Err(err.into()),
            Ok(_) => Err(ClusterError::Denied("mismatched forward reply".to_string())),
            Err(err) => {
                tracing::warn!(error=%err, "dequeue forward failed");
                Err(ClusterError::Timeout)
            }
        }
    }

    /// Acknowledge a delivered message, deleting it permanently.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn queue_ack(&self, message_id: MessageId) -> Result<(), ClusterError> {
        let response = self.propose(Command::QueueAck { message_id }).await?;
        match response.response {
            CommandResponse::Queue(QueueResponse::Acked) => Ok(()),
            CommandResponse::Queue(QueueResponse::Unknown) => Err(ClusterError::UnknownMessage(message_id)),
            other => {
                tracing::error!(?other, "unexpected apply response to an ack");
                Err(ClusterError::Denied("unexpected apply response".to_string()))
            }
        }
    }

    /// Read a key through the coherence fabric.
    ///
    /// Local M/E/S lines are served in place; otherwise peers are probed (an
    /// owner demotes to S and supplies the value), and as a last resort the
    /// persistent sink is consulted, entering the line in E via a replicated
    /// exclusive claim.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        if let Some(value) = self.fabric.lock().expect("state machine mutex poisoned").cache.get_local(key) {
            return Ok(Some(value));
        }

        if let Some(hit) = self.probe_peers(key).await {
            self.fabric
                .lock()
                .expect("state machine mutex poisoned")
                .cache
                .insert_shared(key, hit.value.clone());
            self.enforce_cache_capacity().await?;
            return Ok(Some(hit.value));
        }

        // Full miss: fall back to the backing sink and claim the key
        // exclusively through the log.
        match self.sink.get(&cache_sink_key(key)).await {
            Ok(Some(value)) => {
                self.fabric
                    .lock()
                    .expect("state machine mutex poisoned")
                    .cache
                    .stage_fill(key, value.clone());
                self.propose(Command::CacheInvalidate {
                    key: key.to_string(),
                    origin: self.id.clone(),
                })
                .await?;
                self.enforce_cache_capacity().await?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(ClusterError::Persistence(err)),
        }
    }

    /// Write a key through the coherence fabric. On commit the writing node
    /// holds the only valid (modified) copy; every other copy is invalidated.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub async fn cache_put(&self, key: &str, value: Vec<u8>) -> Result<(), ClusterError> {
        self.propose(Command::CachePut {
            key: key.to_string(),
            value,
            origin: self.id.clone(),
        })
        .await?;
        self.enforce_cache_capacity().await?;
        Ok(())
    }

    /// The local MESI state of a key, if the line is currently valid.
    /// A read-only inspection which does not touch LRU order.
    pub fn cache_line_state(&self, key: &str) -> Option<LineState> {
        self.fabric.lock().expect("state machine mutex poisoned").cache.line_state(key)
    }

    /// The cluster as seen from this node.
    pub fn status(&self) -> ClusterStatus {
        let metrics = self.raft.metrics().borrow().clone();
        let health = self.health_rx.borrow().clone();
        let peers = self
            .config
            .members
            .keys()
            .map(|peer| {
                let state = if peer == &self.id {
                    NodeHealth::Alive
                } else {
                    health.get(peer).copied().unwrap_or(NodeHealth::Alive)
                };
                (peer.clone(), state)
            })
            .collect();
        ClusterStatus {
            id: self.id.clone(),
            state: metrics.state,
            term: metrics.current_term,
            leader: metrics.current_leader,
            peers,
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Inbound dispatch ////////////////////////////////////////////////////

    /// Drain a transport's inbound request stream, dispatching each request
    /// to this node's handlers.
    pub fn serve_inbound(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<InboundRequest>) {
        let node = self.clone();
        let handle = tokio::spawn(
            async move {
                while let Some(request) = rx.recv().await {
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = node.dispatch_inbound(request.body).await {
                            let _ = request.reply.send(reply);
                        }
                    });
                }
            }
            .instrument(tracing::debug_span!("inbound-dispatch", id=%self.id)),
        );
        self.tasks.lock().expect("task list mutex poisoned").push(handle);
    }

    async fn dispatch_inbound(&self, body: FrameBody) -> Option<FrameBody> {
        match body {
            FrameBody::AppendEntries(rpc) => Some(FrameBody::AppendEntriesReply(
                self.raft.append_entries(rpc).await.map_err(|err| err.to_string()),
            )),
            FrameBody::RequestVote(rpc) => {
                Some(FrameBody::RequestVoteReply(self.raft.vote(rpc).await.map_err(|err| err.to_string())))
            }
            FrameBody::ClientPropose(request) => Some(FrameBody::ClientProposeReply(Ok(self.handle_propose(request).await))),
            FrameBody::QueueForward(request) => {
                Some(FrameBody::QueueForwardReply(Ok(self.handle_queue_forward(request).await)))
            }
            FrameBody::CacheProbe(request) => Some(FrameBody::CacheProbeReply(Ok(self.handle_cache_probe(&request)))),
            FrameBody::Heartbeat => None,
            other => {
                tracing::warn!(kind = other.kind(), "unexpected inbound frame, dropping");
                None
            }
        }
    }

    /// Handle a command forwarded by a peer which believes this node is the leader.
    pub async fn handle_propose(&self, request: ProposeRequest) -> ProposeResponse {
        match self.raft.client_write(request.command).await {
            Ok(response) => ProposeResponse::Applied {
                index: response.index,
                response: response.response,
            },
            Err(ClientWriteError::ForwardToLeader(_, leader_hint)) => ProposeResponse::NotLeader { leader_hint },
            Err(ClientWriteError::RaftError(err)) => ProposeResponse::Failed { error: err.to_string() },
        }
    }

    /// Handle a queue operation forwarded to this node as partition primary.
    pub async fn handle_queue_forward(&self, request: QueueForwardRequest) -> QueueForwardResponse {
        match request {
            QueueForwardRequest::Enqueue { queue, payload } => match self.enqueue_as_primary(&queue, payload).await {
                Ok(message_id) => QueueForwardResponse::Enqueued { message_id },
                Err(err) => QueueForwardResponse::Failed((&err).into()),
            },
            QueueForwardRequest::Dequeue {
                queue,
                consumer,
                visibility_ms,
            } => match self.dequeue_as_primary(&queue, &consumer, visibility_ms).await {
                Ok(delivery) => QueueForwardResponse::Delivery(delivery),
                Err(err) => QueueForwardResponse::Failed((&err).into()),
            },
        }
    }

    /// Handle a peer's cache read probe against the local table.
    pub fn handle_cache_probe(&self, request: &CacheProbeRequest) -> CacheProbeResponse {
        let mut sm = self.fabric.lock().expect("state machine mutex poisoned");
        let found = sm.cache.probe(&request.key).map(|(state, value)| CacheProbeHit {
            state: match state {
                LineState::Modified => ProbedState::Modified,
                LineState::Exclusive => ProbedState::Exclusive,
                LineState::Shared => ProbedState::Shared,
            },
            value,
        });
        CacheProbeResponse { found }
    }

    ////////////////////////////////////////////////////////////////////////
    // Internals ///////////////////////////////////////////////////////////

    /// Propose a command through the current leader, forwarding and retrying
    /// with backoff until the operation deadline.
    ///
    /// A leader which has lost its majority will append but never commit, so
    /// every attempt — local or forwarded — is bounded by the time remaining
    /// before the deadline. Before returning, the local apply is awaited up
    /// to the committed index, so callers observe their own writes in the
    /// local tables immediately.
    pub(crate) async fn propose(&self, command: Command) -> Result<ClientWriteResponse, ClusterError> {
        let response = self.propose_remote(command).await?;
        self.await_applied(response.index).await?;
        Ok(response)
    }

    /// Wait until this node's own state machine has applied up to `index`.
    /// Polls the table directly: the metrics channel may report an apply as
    /// scheduled slightly before the tables reflect it.
    async fn await_applied(&self, index: u64) -> Result<(), ClusterError> {
        let deadline = Instant::now() + OP_TIMEOUT;
        loop {
            let applied = self.fabric.lock().expect("state machine mutex poisoned").last_applied().index;
            if applied >= index {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout);
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn propose_remote(&self, command: Command) -> Result<ClientWriteResponse, ClusterError> {
        let deadline = Instant::now() + OP_TIMEOUT;
        let mut leader = self.raft.current_leader().await;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(match leader {
                    None => ClusterError::LeaderUnknown,
                    Some(_) => ClusterError::Timeout,
                });
            }

            let made_progress = match &leader {
                Some(target) if *target == self.id => {
                    match timeout(remaining, self.raft.client_write(command.clone())).await {
                        Ok(Ok(response)) => return Ok(response),
                        Ok(Err(ClientWriteError::ForwardToLeader(_, hint))) => {
                            leader = hint;
                            true
                        }
                        Ok(Err(ClientWriteError::RaftError(err))) => return Err(err.into()),
                        Err(_) => return Err(ClusterError::Timeout),
                    }
                }
                Some(target) => {
                    let request = ProposeRequest {
                        command: command.clone(),
                    };
                    match timeout(remaining, self.network.send_propose(target.clone(), request)).await {
                        Ok(Ok(ProposeResponse::Applied { index, response })) => {
                            return Ok(ClientWriteResponse { index, response })
                        }
                        Ok(Ok(ProposeResponse::NotLeader { leader_hint })) => {
                            leader = leader_hint;
                            true
                        }
                        Ok(Ok(ProposeResponse::Failed { error })) => {
                            tracing::warn!(error=%error, "forwarded proposal failed on remote node");
                            leader = None;
                            false
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(error=%err, "proposal forward failed");
                            leader = None;
                            false
                        }
                        Err(_) => return Err(ClusterError::Timeout),
                    }
                }
                None => {
                    leader = self.raft.current_leader().await;
                    leader.is_some()
                }
            };

            if !made_progress {
                sleep(PROPOSE_RETRY_INTERVAL).await;
            }
        }
    }

    async fn enqueue_as_primary(&self, queue: &str, payload: Vec<u8>) -> Result<MessageId, ClusterError> {
        let message_id = MessageId::new_v4();
        let response = self
            .propose(Command::QueueEnqueue {
                queue: queue.to_string(),
                message_id,
                payload,
            })
            .await?;
        match response.response {
            CommandResponse::Queue(QueueResponse::Enqueued { message_id }) => Ok(message_id),
            other => {
                tracing::error!(?other, "unexpected apply response to an enqueue");
                Err(ClusterError::Denied("unexpected apply response".to_string()))
            }
        }
    }

    async fn dequeue_as_primary(
        &self,
        queue: &str,
        consumer: &str,
        visibility_ms: u64,
    ) -> Result<Option<QueueDelivery>, ClusterError> {
        if is_dead_letter_queue(queue) {
            let delivery = {
                let sm = self.fabric.lock().expect("state machine mutex poisoned");
                sm.queues.peek_dead(queue).map(|message| QueueDelivery {
                    message_id: message.id,
                    payload: message.payload.clone(),
                    attempts: message.attempts,
                })
            };
            return Ok(delivery);
        }

        for _ in 0..DEQUEUE_RETRY_LIMIT {
            let head = {
                let sm = self.fabric.lock().expect("state machine mutex poisoned");
                sm.queues.peek_pending(queue)
            };
            let message_id = match head {
                Some(message_id) => message_id,
                None => return Ok(None),
            };
            let response = self
                .propose(Command::QueueReserve {
                    message_id,
                    consumer: consumer.to_string(),
                    visible_until_ms: now_ms() + visibility_ms,
                })
                .await?;
            match response.response {
                CommandResponse::Queue(QueueResponse::Reserved {
                    message_id,
                    payload,
                    attempts,
                }) => {
                    return Ok(Some(QueueDelivery {
                        message_id,
                        payload,
                        attempts,
                    }))
                }
                // Lost the race for this head; select again.
                CommandResponse::Queue(QueueResponse::NotPending) => continue,
                other => {
                    tracing::error!(?other, "unexpected apply response to a reserve");
                    return Err(ClusterError::Denied("unexpected apply response".to_string()));
                }
            }
        }
        Ok(None)
    }

    /// The partition primary for a queue: the ring owner among nodes the
    /// failure detector considers usable.
    fn primary_for(&self, queue: &str) -> Result<NodeId, ClusterError> {
        self.ring
            .lock()
            .expect("ring mutex poisoned")
            .node_for(queue)
            .cloned()
            .ok_or(ClusterError::LeaderUnknown)
    }

    /// Probe every routable peer for a key, preferring an owner's copy.
    async fn probe_peers(&self, key: &str) -> Option<CacheProbeHit> {
        let peers: Vec<NodeId> = {
            let health = self.health_rx.borrow().clone();
            routable_nodes(&health, &self.id).into_iter().filter(|peer| peer != &self.id).collect()
        };
        if peers.is_empty() {
            return None;
        }

        let probes = peers.into_iter().map(|peer| {
            let request = CacheProbeRequest { key: key.to_string() };
            let network = self.network.clone();
            async move { network.send_cache_probe(peer, request).await }
        });
        let responses = futures::future::join_all(probes).await;

        let mut best: Option<CacheProbeHit> = None;
        for response in responses {
            let hit = match response {
                Ok(CacheProbeResponse { found: Some(hit) }) => hit,
                Ok(CacheProbeResponse { found: None }) => continue,
                Err(err) => {
                    tracing::debug!(error=%err, "cache probe failed");
                    continue;
                }
            };
            if best.as_ref().map(|current| hit.state > current.state).unwrap_or(true) {
                best = Some(hit);
            }
        }
        best
    }

    /// Evict LRU lines until the local cache fits its capacity. Modified
    /// lines are written back to the sink before their eviction is announced
    /// through the log; clean lines are dropped in place.
    async fn enforce_cache_capacity(&self) -> Result<(), ClusterError> {
        loop {
            let victim = {
                let sm = self.fabric.lock().expect("state machine mutex poisoned");
                if !sm.cache.over_capacity() {
                    return Ok(());
                }
                sm.cache.lru_victim()
            };
            let (key, state, value) = match victim {
                Some(victim) => victim,
                None => return Ok(()),
            };
            match state {
                LineState::Modified => {
                    self.sink
                        .put(&cache_sink_key(&key), &value)
                        .await
                        .map_err(ClusterError::Persistence)?;
                    self.propose(Command::CacheEvict {
                        key,
                        origin: self.id.clone(),
                    })
                    .await?;
                }
                LineState::Exclusive | LineState::Shared => {
                    self.fabric.lock().expect("state machine mutex poisoned").cache.remove_local(&key);
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Background tasks ////////////////////////////////////////////////////

    /// Resolve parked lock waiters from apply events.
    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<ApplyEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                ApplyEvent::LockGranted { resource, client } => {
                    let waiter = self
                        .waiters
                        .lock()
                        .expect("waiter map mutex poisoned")
                        .remove(&(resource, client));
                    if let Some(tx) = waiter {
                        let _ = tx.send(WaiterOutcome::Granted);
                    }
                }
                ApplyEvent::LockAborted { client } => {
                    let aborted: Vec<_> = {
                        let mut waiters = self.waiters.lock().expect("waiter map mutex poisoned");
                        let keys: Vec<_> =
                            waiters.keys().filter(|(_, waiting)| waiting == &client).cloned().collect();
                        keys.into_iter().filter_map(|key| waiters.remove(&key)).collect()
                    };
                    for tx in aborted {
                        let _ = tx.send(WaiterOutcome::Aborted);
                    }
                }
            }
        }
    }

    /// Drain scheduled durable writes into the sink. A failed write is fatal:
    /// the safety argument depends on the sink reflecting acked state, so the
    /// node refuses to continue.
    async fn run_sink_writer(self: Arc<Self>, mut sink_rx: mpsc::UnboundedReceiver<SinkOp>) {
        while let Some(op) = sink_rx.recv().await {
            let result = match &op {
                SinkOp::Put { key, value } => self.sink.put(key, value).await,
                SinkOp::Delete { key } => self.sink.delete(key).await,
            };
            if let Err(err) = result {
                tracing::error!(error=%err, "durable sink write failed; shutting down");
                if let Err(err) = self.raft.shutdown().await {
                    tracing::error!(error=%err, "error during raft shutdown");
                }
                return;
            }
        }
    }

    /// Leader-only periodic deadlock scan over the wait-for graph.
    async fn run_deadlock_scanner(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.deadlock_scan_interval);
        loop {
            sleep(interval).await;
            if !self.raft.metrics().borrow().state.is_leader() {
                continue;
            }
            let victims = {
                let sm = self.fabric.lock().expect("state machine mutex poisoned");
                sm.locks.deadlock_victims()
            };
            for victim in victims {
                tracing::info!(client=%victim, "aborting deadlock victim");
                if let Err(err) = self.propose(Command::LockAbort { client: victim }).await {
                    tracing::warn!(error=%err, "failed to propose deadlock abort");
                }
            }
        }
    }

    /// Return or dead-letter expired reservations for partitions this node
    /// is primary of.
    async fn run_visibility_sweeper(self: Arc<Self>) {
        loop {
            sleep(SWEEP_INTERVAL).await;
            let now = now_ms();
            let expired = {
                let sm = self.fabric.lock().expect("state machine mutex poisoned");
                sm.queues.expired_inflight(now)
            };
            for message in expired {
                match self.primary_for(&message.queue) {
                    Ok(primary) if primary == self.id => {}
                    _ => continue,
                }
                let command = if message.attempts >= self.config.queue_max_retries {
                    Command::QueueDead { message_id: message.id }
                } else {
                    Command::QueueReturn { message_id: message.id }
                };
                if let Err(err) = self.propose(command).await {
                    tracing::warn!(error=%err, message_id=%message.id, "failed to propose visibility sweep");
                }
            }
        }
    }

    /// Rebuild the partition ring when the failure detector reports
    /// transitions.
    async fn run_health_watcher(self: Arc<Self>) {
        let mut health_rx = self.health_rx.clone();
        loop {
            if health_rx.changed().await.is_err() {
                return;
            }
            let health = health_rx.borrow().clone();
            let nodes = routable_nodes(&health, &self.id);
            tracing::debug!(?nodes, "rebuilding partition ring");
            *self.ring.lock().expect("ring mutex poisoned") = HashRing::new(nodes);
        }
    }
}
