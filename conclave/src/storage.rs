//! The storage interfaces and data types.

use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::Entry;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug, Default)]
pub struct InitialState {
    /// The id of the last entry in the log, `(0, 0)` for a pristine node.
    pub last_log_id: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
}

/// A trait defining the interface for the durable consensus storage of a node.
///
/// Implementations persist two artefacts: the hard state record (rewritten
/// whenever term or vote change, before the corresponding RPC reply goes out)
/// and the append-only log. Errors returned from any of these methods are
/// treated as fatal and will cause the Raft node to shut down, as the safety
/// argument depends on durable log & vote state.
#[async_trait]
pub trait RaftStorage: Send + Sync + 'static {
    /// Get the node's state from storage on startup.
    ///
    /// When no state exists due to this being the first time the node has
    /// come online, `InitialState::default()` should be returned.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save the node's hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive: `[start, stop)`.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>>;

    /// Try to get a single log entry, returning `None` if it is not present.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>>;

    /// Returns the id of the last entry in the log, `(0, 0)` when the log is empty.
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all logs in the given range.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log.
    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()>;
}

/// The persistent key-value sink used for message durability and cache write-back.
///
/// Atomicity requirements are per-key only. The sink is accessed exclusively
/// from the node's writer task, which drains the applier's outbound channel,
/// so implementations do not need to coordinate concurrent writers.
#[async_trait]
pub trait KvSink: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the value stored under `key`, if any.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all `(key, value)` pairs whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}
