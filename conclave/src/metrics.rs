//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The use cases
//! range from simply logging the metrics, to being used by the node layer for
//! leader routing, to tests awaiting cluster conditions via [`Wait`].

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::State;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The full cluster roster.
    pub membership: BTreeSet<NodeId>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId, membership: BTreeSet<NodeId>) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership,
        }
    }
}

/// An error returned by a `Wait` when its timeout elapses before the
/// condition is satisfied.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft node is shutting down")]
    ShuttingDown,
}

/// A handle for awaiting the metrics of a Raft node to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for the metrics to satisfy the given predicate, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let timeout_at = sleep(self.timeout);
        tokio::pin!(timeout_at);

        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
                _ = &mut timeout_at => {
                    return Err(WaitError::Timeout(self.timeout, msg.to_string()));
                }
            }
        }
    }

    /// Wait for `current_leader` to become `Some(leader_id)` until timeout.
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader.as_ref() == Some(&leader_id),
            format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait until applied at least `want_log` logs, or timeout.
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index >= want_log && x.last_applied >= want_log,
            format!("{} .last_log_index and .last_applied -> {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for the node to enter the given state, or timeout.
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }
}
