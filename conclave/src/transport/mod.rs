//! Framed TCP transport between cluster nodes.
//!
//! Each node keeps one outbound connection per peer, dialed lazily with
//! backoff. Requests travel on the initiator's connection and their replies
//! come back on the same connection, matched by correlation id; inbound
//! connections carry the peer's requests, answered on that same socket.
//! Every socket half is owned by exactly one task. A heartbeat task per peer
//! feeds the φ-accrual failure detector, as does every inbound frame.
//!
//! Network failures never escape this module as anything other than `Err`
//! results on individual sends (surfaced to callers as timeouts) and health
//! transitions on the detector's watch channel.

pub mod frame;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::detector::FailureDetector;
use crate::detector::NodeHealth;
use crate::network::CacheProbeRequest;
use crate::network::CacheProbeResponse;
use crate::network::ClusterNetwork;
use crate::network::ProposeRequest;
use crate::network::ProposeResponse;
use crate::network::QueueForwardRequest;
use crate::network::QueueForwardResponse;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::transport::frame::Decoded;
use crate::transport::frame::Frame;
use crate::transport::frame::FrameBody;
use crate::NodeId;

/// Reconnect backoff for outbound peer connections.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// The timeout applied to forwarded client operations, which may span a full
/// consensus round trip.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// A request received from a peer, handed to the node layer for dispatch.
///
/// Dropping `reply` without sending is fine: the requester times out and the
/// transport cleans its correlation slot.
pub struct InboundRequest {
    pub sender: NodeId,
    pub body: FrameBody,
    pub reply: oneshot::Sender<FrameBody>,
}

/// The framed TCP transport. Implements [`ClusterNetwork`].
pub struct TcpTransport {
    id: NodeId,
    config: Arc<Config>,
    peers: BTreeMap<NodeId, mpsc::UnboundedSender<Frame>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<FrameBody>>>,
    next_correlation: AtomicU64,
    detector: Mutex<FailureDetector>,
    health_rx: watch::Receiver<BTreeMap<NodeId, NodeHealth>>,
    inbound_tx: mpsc::UnboundedSender<InboundRequest>,
}

impl TcpTransport {
    /// Bind this node's listen address from the roster and start the
    /// transport. Returns the transport and the stream of inbound requests,
    /// which the node layer must drain.
    pub async fn start(id: NodeId, config: Arc<Config>) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>)> {
        let addr =
            config.member_addr(&id).ok_or_else(|| anyhow!("node {} is not in the cluster roster", id))?.clone();
        let listener = TcpListener::bind(addr.as_str()).await.with_context(|| format!("binding listener on {}", addr))?;
        Self::start_with_listener(id, config, listener)
    }

    /// Start the transport on an already bound listener. This is how tests
    /// wire up clusters on ephemeral ports.
    pub fn start_with_listener(
        id: NodeId,
        config: Arc<Config>,
        listener: TcpListener,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>)> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let detector = FailureDetector::new(&config, &id);
        let health_rx = detector.subscribe();

        let mut peers = BTreeMap::new();
        let mut peer_rxs = Vec::new();
        for (peer, addr) in config.members.iter() {
            if peer == &id {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            peers.insert(peer.clone(), tx);
            peer_rxs.push((peer.clone(), addr.clone(), rx));
        }

        let this = Arc::new(Self {
            id,
            config,
            peers,
            pending: Mutex::new(HashMap::new()),
            next_correlation: AtomicU64::new(1),
            detector: Mutex::new(detector),
            health_rx,
            inbound_tx,
        });

        for (peer, addr, rx) in peer_rxs {
            let transport = this.clone();
            tokio::spawn(
                transport
                    .peer_loop(peer.clone(), addr, rx)
                    .instrument(tracing::debug_span!("peer-loop", peer=%peer)),
            );
        }
        tokio::spawn(this.clone().accept_loop(listener).instrument(tracing::debug_span!("accept-loop")));
        tokio::spawn(this.clone().heartbeat_loop().instrument(tracing::debug_span!("heartbeat-loop")));

        Ok((this, inbound_rx))
    }

    /// A subscription to the failure detector's health table.
    pub fn health(&self) -> watch::Receiver<BTreeMap<NodeId, NodeHealth>> {
        self.health_rx.clone()
    }

    /// Send a request frame to the target and await its reply, within `ttl`.
    async fn request(&self, target: &NodeId, body: FrameBody, ttl: Duration) -> Result<FrameBody> {
        let peer_tx = self.peers.get(target).ok_or_else(|| anyhow!("unknown peer {}", target))?;

        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map mutex poisoned").insert(correlation_id, tx);

        let frame = Frame {
            sender: self.id.clone(),
            correlation_id,
            body,
        };
        if peer_tx.send(frame).is_err() {
            self.pending.lock().expect("pending map mutex poisoned").remove(&correlation_id);
            bail!("connection task for peer {} has stopped", target);
        }

        match timeout(ttl, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().expect("pending map mutex poisoned").remove(&correlation_id);
                bail!("connection to peer {} dropped while awaiting reply", target)
            }
            Err(_) => {
                self.pending.lock().expect("pending map mutex poisoned").remove(&correlation_id);
                bail!("request to peer {} timed out after {:?}", target, ttl)
            }
        }
    }

    /// Record an inbound frame from a peer into the failure detector.
    fn observe_peer(&self, peer: &NodeId) {
        self.detector.lock().expect("detector mutex poisoned").observe(peer, Instant::now());
    }

    /// The outbound connection task for one peer: dial with backoff, then
    /// pump frames out and route replies coming back on the same socket.
    async fn peer_loop(self: Arc<Self>, peer: NodeId, addr: String, mut rx: mpsc::UnboundedReceiver<Frame>) {
        loop {
            let stream = match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(error=%err, peer=%peer, %addr, "failed to connect to peer, backing off");
                    // Drop whatever queued up while the peer was unreachable;
                    // requesters will have timed out by reconnect time anyway.
                    loop {
                        match rx.try_recv() {
                            Ok(_) => continue,
                            Err(mpsc::error::TryRecvError::Empty) => break,
                            Err(mpsc::error::TryRecvError::Disconnected) => return,
                        }
                    }
                    sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };
            tracing::debug!(peer=%peer, %addr, "connected to peer");
            let _ = stream.set_nodelay(true);
            let (read_half, mut write_half) = stream.into_split();

            let reader = tokio::spawn(
                self.clone()
                    .read_replies(peer.clone(), read_half)
                    .instrument(tracing::debug_span!("peer-read", peer=%peer)),
            );

            // This task owns the write half exclusively.
            loop {
                let frame = match rx.recv().await {
                    Some(frame) => frame,
                    None => {
                        reader.abort();
                        return;
                    }
                };
                let encoded = match frame::encode(&frame) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        tracing::error!(error=%err, kind=frame.body.kind(), "failed to encode outbound frame");
                        continue;
                    }
                };
                if let Err(err) = write_half.write_all(&encoded).await {
                    tracing::debug!(error=%err, peer=%peer, "peer connection lost while writing");
                    break;
                }
            }
            reader.abort();
        }
    }

    /// Read replies arriving on an outbound connection.
    async fn read_replies(self: Arc<Self>, peer: NodeId, mut read_half: OwnedReadHalf) {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match frame::decode(&mut buf) {
                Ok(Decoded::Frame(frame)) => {
                    self.observe_peer(&peer);
                    if frame.body.is_reply() {
                        let tx = self
                            .pending
                            .lock()
                            .expect("pending map mutex poisoned")
                            .remove(&frame.correlation_id);
                        match tx {
                            Some(tx) => {
                                let _ = tx.send(frame.body);
                            }
                            None => tracing::debug!(
                                correlation_id = frame.correlation_id,
                                "reply arrived for an expired request"
                            ),
                        }
                    } else {
                        tracing::warn!(kind = frame.body.kind(), "unexpected frame type on outbound connection, dropping");
                    }
                    continue;
                }
                Ok(Decoded::Skipped) => continue,
                Ok(Decoded::NeedMore) => {}
                Err(err) => {
                    tracing::warn!(error=%err, peer=%peer, "closing connection after framing violation");
                    return;
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(error=%err, peer=%peer, "peer connection lost while reading");
                    return;
                }
            }
        }
    }

    /// Accept inbound connections and spawn a serving task per connection.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "accepted inbound connection");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(
                        self.clone()
                            .serve_connection(stream)
                            .instrument(tracing::debug_span!("serve-conn", %remote)),
                    );
                }
                Err(err) => {
                    tracing::warn!(error=%err, "error accepting inbound connection");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve one inbound connection: requests come in, replies go back out on
    /// the same socket via a dedicated writer task.
    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let (mut read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(write_frames(write_half, reply_rx));

        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            match frame::decode(&mut buf) {
                Ok(Decoded::Frame(frame)) => {
                    self.handle_inbound_frame(frame, &reply_tx);
                    continue;
                }
                Ok(Decoded::Skipped) => continue,
                Ok(Decoded::NeedMore) => {}
                Err(err) => {
                    tracing::warn!(error=%err, "closing inbound connection after framing violation");
                    break;
                }
            }
            match read_half.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(error=%err, "inbound connection lost");
                    break;
                }
            }
        }
        writer.abort();
    }

    /// Route one inbound frame: heartbeats feed the detector, requests go to
    /// the node layer with a reply path back onto this connection.
    fn handle_inbound_frame(&self, frame: Frame, reply_tx: &mpsc::UnboundedSender<Frame>) {
        self.observe_peer(&frame.sender);
        match frame.body {
            FrameBody::Heartbeat => {}
            body if body.is_reply() => {
                tracing::warn!(kind = body.kind(), "unexpected reply frame on inbound connection, dropping");
            }
            body => {
                let (tx, rx) = oneshot::channel();
                let inbound = InboundRequest {
                    sender: frame.sender,
                    body,
                    reply: tx,
                };
                if self.inbound_tx.send(inbound).is_err() {
                    // Node layer is gone; the requester will time out.
                    return;
                }
                let id = self.id.clone();
                let correlation_id = frame.correlation_id;
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    if let Ok(body) = rx.await {
                        let _ = reply_tx.send(Frame {
                            sender: id,
                            correlation_id,
                            body,
                        });
                    }
                });
            }
        }
    }

    /// Periodically send heartbeats to every peer and re-evaluate φ.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval));
        loop {
            ticker.tick().await;
            for peer_tx in self.peers.values() {
                let _ = peer_tx.send(Frame {
                    sender: self.id.clone(),
                    correlation_id: 0,
                    body: FrameBody::Heartbeat,
                });
            }
            self.detector.lock().expect("detector mutex poisoned").evaluate(Instant::now());
        }
    }

    /// The default timeout for raft RPCs: a small multiple of the heartbeat
    /// interval, mirroring the replication stream's own send timeout.
    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval * 4)
    }
}

/// Drain `rx`, writing each frame to the owned write half.
async fn write_frames(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let encoded = match frame::encode(&frame) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error=%err, kind=frame.body.kind(), "failed to encode reply frame");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&encoded).await {
            tracing::debug!(error=%err, "connection lost while writing reply");
            return;
        }
    }
}

#[async_trait]
impl ClusterNetwork for TcpTransport {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let ttl = self.rpc_timeout();
        match self.request(&target, FrameBody::AppendEntries(rpc), ttl).await? {
            FrameBody::AppendEntriesReply(reply) => reply.map_err(|err| anyhow!(err)),
            other => bail!("mismatched reply of kind {}", other.kind()),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let ttl = self.rpc_timeout();
        match self.request(&target, FrameBody::RequestVote(rpc), ttl).await? {
            FrameBody::RequestVoteReply(reply) => reply.map_err(|err| anyhow!(err)),
            other => bail!("mismatched reply of kind {}", other.kind()),
        }
    }

    async fn send_propose(&self, target: NodeId, rpc: ProposeRequest) -> Result<ProposeResponse> {
        match self.request(&target, FrameBody::ClientPropose(rpc), FORWARD_TIMEOUT).await? {
            FrameBody::ClientProposeReply(reply) => reply.map_err(|err| anyhow!(err)),
            other => bail!("mismatched reply of kind {}", other.kind()),
        }
    }

    async fn send_queue_forward(&self, target: NodeId, rpc: QueueForwardRequest) -> Result<QueueForwardResponse> {
        match self.request(&target, FrameBody::QueueForward(rpc), FORWARD_TIMEOUT).await? {
            FrameBody::QueueForwardReply(reply) => reply.map_err(|err| anyhow!(err)),
            other => bail!("mismatched reply of kind {}", other.kind()),
        }
    }

    async fn send_cache_probe(&self, target: NodeId, rpc: CacheProbeRequest) -> Result<CacheProbeResponse> {
        let ttl = self.rpc_timeout();
        match self.request(&target, FrameBody::CacheProbe(rpc), ttl).await? {
            FrameBody::CacheProbeReply(reply) => reply.map_err(|err| anyhow!(err)),
            other => bail!("mismatched reply of kind {}", other.kind()),
        }
    }
}
