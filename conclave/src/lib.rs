//! A small cluster coordination runtime.
//!
//! Conclave provides three coordination primitives — a replicated lock
//! manager, a partitioned message queue and a MESI-coherent cache — all
//! driven by a single replicated state machine on top of a Raft consensus
//! core. Clients may talk to any node; mutating operations are serialised
//! through the current leader, replicated to a majority and then applied
//! deterministically on every replica.
//!
//! The crate is a library: embedders construct a [`ClusterNode`] per process
//! from a [`Config`], a [`ClusterNetwork`] implementation (the bundled
//! [`transport::TcpTransport`] or an in-process router for tests), a
//! [`RaftStorage`] implementation for the durable log and a [`KvSink`] for
//! message durability.

pub mod command;
pub mod config;
mod core;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod network;
pub mod node;
mod quorum;
pub mod raft;
mod replication;
pub mod ring;
pub mod sm;
pub mod storage;
pub mod transport;

use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

pub use crate::command::Command;
pub use crate::command::CommandResponse;
pub use crate::command::LockMode;
pub use crate::command::MessageId;
pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::core::State;
pub use crate::error::ClusterError;
pub use crate::error::RaftError;
pub use crate::metrics::RaftMetrics;
pub use crate::network::ClusterNetwork;
pub use crate::node::ClusterNode;
pub use crate::raft::Raft;
pub use crate::storage::KvSink;
pub use crate::storage::RaftStorage;

pub use async_trait;
pub use uuid;

/// A Raft node's ID.
///
/// Node ids are stable strings chosen by the operator; the full roster is
/// fixed at start via [`Config`].
pub type NodeId = String;

/// The ID of a client of the coordination services (lock holders, queue
/// consumers).
pub type ClientId = String;

/// The identity of a log entry: its term and its 1-based position.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// A trait implemented by types which wish to emit a one-line summary of
/// themselves for logging, rather than a full Debug dump.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
