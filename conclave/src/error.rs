//! Error types exposed by this crate.

use crate::command::Command;
use crate::MessageId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internal Raft protocol.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `ClusterNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// The Raft node is shutting down.
    #[error("the raft node is shutting down")]
    ShuttingDown,
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader")]
    ForwardToLeader(Command, Option<NodeId>),
}

/// The error surface of the coordination services, as seen by clients.
///
/// Consensus-internal failures (lost RPCs, log conflicts, term stepdowns) are
/// recovered by retries and role changes inside the core and never surface
/// here; what remains is the closed set of outcomes a caller can meaningfully
/// react to.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The operation did not complete before its deadline.
    #[error("operation did not complete before its deadline")]
    Timeout,
    /// The request hit a non-leader node which could not forward it.
    #[error("this node is not the cluster leader")]
    NotLeader {
        /// The id of the current leader, if known.
        leader_hint: Option<NodeId>,
    },
    /// No leader is currently elected; callers should retry with backoff.
    #[error("no cluster leader is currently elected")]
    LeaderUnknown,
    /// The lock request was killed as a deadlock victim. Permanent for this attempt.
    #[error("lock request was aborted as a deadlock victim")]
    Aborted,
    /// A release was requested by a client which holds nothing. Permanent.
    #[error("client does not hold the lock")]
    NotHolder,
    /// The request was rejected outright.
    #[error("request denied: {0}")]
    Denied(String),
    /// An ack referenced a message this cluster does not know. Permanent.
    #[error("unknown message id {0}")]
    UnknownMessage(MessageId),
    /// A durable write failed. Fatal: the node refuses to continue.
    #[error("durable state write failed: {0}")]
    Persistence(anyhow::Error),
    /// An internal Raft error.
    #[error("{0}")]
    Raft(#[from] RaftError),
}
