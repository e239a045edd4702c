//! Runtime configuration for a conclave cluster.

use std::collections::BTreeMap;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default interval between deadlock scans on the leader, in milliseconds.
pub const DEFAULT_DEADLOCK_SCAN_INTERVAL: u64 = 500;
/// Default number of deliveries before a message is dead-lettered.
pub const DEFAULT_QUEUE_MAX_RETRIES: u32 = 5;
/// Default visibility timeout for dequeued messages, in milliseconds.
pub const DEFAULT_QUEUE_VISIBILITY: u64 = 30_000;
/// Default per-node cache capacity, in entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
/// Default φ threshold at which a peer is suspected.
pub const DEFAULT_PHI_SUSPECTED: f64 = 8.0;
/// Default φ threshold at which a peer is considered failed.
pub const DEFAULT_PHI_FAILED: f64 = 12.0;
/// Default size of the failure detector's inter-arrival sample window.
pub const DEFAULT_PHI_WINDOW: usize = 100;

/// Error variants related to the configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The cluster roster is empty.
    #[error("the cluster member roster must not be empty")]
    EmptyRoster,

    /// The min & max election timeout config invariant has been violated.
    #[error("given values for election timeout min & max are invalid, max must be greater than min")]
    InvalidElectionTimeoutMinMax,

    /// The heartbeat interval is too large relative to the election timeout.
    #[error("the heartbeat interval must be less than half of the election timeout minimum")]
    HeartbeatTooLong,

    /// The given value for max_payload_entries is too small, must be > 0.
    #[error("the given value for max_payload_entries is too small, must be > 0")]
    MaxPayloadEntriesTooSmall,

    /// The φ thresholds are inverted.
    #[error("the suspected φ threshold must be less than the failed φ threshold")]
    InvalidPhiThresholds,
}

/// The runtime configuration for a conclave node.
///
/// The config is cluster-wide: every node of a cluster must be started with
/// identical timeouts and an identical member roster, while the node's own
/// identity is passed separately when constructing the node.
///
/// When building the Raft configuration, the election timeout for any node is
/// randomized between the configured min & max, which helps to avoid split
/// votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this cluster.
    pub cluster_name: String,
    /// The full cluster roster: node id to network address, fixed at start.
    pub members: BTreeMap<NodeId, String>,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    ///
    /// Defaults to 50 milliseconds, and must be less than half of the minimum
    /// election timeout.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The distance behind in log replication before the lagging state is declared.
    pub replication_lag_threshold: u64,
    /// The interval in milliseconds at which the leader scans the wait-for graph for deadlocks.
    pub deadlock_scan_interval: u64,
    /// The number of deliveries a message may see before it is moved to the dead-letter queue.
    pub queue_max_retries: u32,
    /// The default visibility timeout in milliseconds for dequeued messages.
    pub queue_default_visibility: u64,
    /// The maximum number of cache entries held per node before LRU eviction kicks in.
    pub cache_capacity: usize,
    /// The φ value above which a peer transitions to suspected.
    pub phi_suspected_threshold: f64,
    /// The φ value above which a suspected peer transitions to failed.
    pub phi_failed_threshold: f64,
    /// The number of heartbeat inter-arrival samples kept per peer.
    pub phi_window: usize,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            members: BTreeMap::new(),
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            deadlock_scan_interval: None,
            queue_max_retries: None,
            queue_default_visibility: None,
            cache_capacity: None,
            phi_suspected_threshold: None,
            phi_failed_threshold: None,
            phi_window: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }

    /// The address of the given member, if it is part of the roster.
    pub fn member_addr(&self, id: &NodeId) -> Option<&String> {
        self.members.get(id)
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    members: BTreeMap<NodeId, String>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    deadlock_scan_interval: Option<u64>,
    queue_max_retries: Option<u32>,
    queue_default_visibility: Option<u64>,
    cache_capacity: Option<usize>,
    phi_suspected_threshold: Option<f64>,
    phi_failed_threshold: Option<f64>,
    phi_window: Option<usize>,
}

impl ConfigBuilder {
    /// Register a cluster member by id and address.
    pub fn member(mut self, id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        self.members.insert(id.into(), addr.into());
        self
    }

    /// Register the full member roster at once.
    pub fn members(mut self, members: BTreeMap<NodeId, String>) -> Self {
        self.members = members;
        self
    }

    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `replication_lag_threshold`.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the desired value for `deadlock_scan_interval`.
    pub fn deadlock_scan_interval(mut self, val: u64) -> Self {
        self.deadlock_scan_interval = Some(val);
        self
    }

    /// Set the desired value for `queue_max_retries`.
    pub fn queue_max_retries(mut self, val: u32) -> Self {
        self.queue_max_retries = Some(val);
        self
    }

    /// Set the desired value for `queue_default_visibility`.
    pub fn queue_default_visibility(mut self, val: u64) -> Self {
        self.queue_default_visibility = Some(val);
        self
    }

    /// Set the desired value for `cache_capacity`.
    pub fn cache_capacity(mut self, val: usize) -> Self {
        self.cache_capacity = Some(val);
        self
    }

    /// Set the desired value for `phi_suspected_threshold`.
    pub fn phi_suspected_threshold(mut self, val: f64) -> Self {
        self.phi_suspected_threshold = Some(val);
        self
    }

    /// Set the desired value for `phi_failed_threshold`.
    pub fn phi_failed_threshold(mut self, val: f64) -> Self {
        self.phi_failed_threshold = Some(val);
        self
    }

    /// Set the desired value for `phi_window`.
    pub fn phi_window(mut self, val: usize) -> Self {
        self.phi_window = Some(val);
        self
    }

    /// Validate the state of this builder, returning a new `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        // Roll a random election timeout for each node when they ask for one, but validate the
        // window itself up front.
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval >= election_timeout_min / 2 {
            return Err(ConfigError::HeartbeatTooLong);
        }
        if self.members.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(300);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let phi_suspected_threshold = self.phi_suspected_threshold.unwrap_or(DEFAULT_PHI_SUSPECTED);
        let phi_failed_threshold = self.phi_failed_threshold.unwrap_or(DEFAULT_PHI_FAILED);
        if phi_suspected_threshold >= phi_failed_threshold {
            return Err(ConfigError::InvalidPhiThresholds);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            members: self.members,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
            deadlock_scan_interval: self.deadlock_scan_interval.unwrap_or(DEFAULT_DEADLOCK_SCAN_INTERVAL),
            queue_max_retries: self.queue_max_retries.unwrap_or(DEFAULT_QUEUE_MAX_RETRIES),
            queue_default_visibility: self.queue_default_visibility.unwrap_or(DEFAULT_QUEUE_VISIBILITY),
            cache_capacity: self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
            phi_suspected_threshold,
            phi_failed_threshold,
            phi_window: self.phi_window.unwrap_or(DEFAULT_PHI_WINDOW),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConfigBuilder {
        Config::build("test".into()).member("n1", "127.0.0.1:7001")
    }

    #[test]
    fn test_config_defaults() {
        let cfg = base().validate().expect("valid config");
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.deadlock_scan_interval, DEFAULT_DEADLOCK_SCAN_INTERVAL);
        assert_eq!(cfg.queue_max_retries, DEFAULT_QUEUE_MAX_RETRIES);
        assert_eq!(cfg.queue_default_visibility, DEFAULT_QUEUE_VISIBILITY);
        assert_eq!(cfg.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_error() {
        let res = base().election_timeout_min(300).election_timeout_max(150).validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_half_min_election_timeout() {
        let res = base().election_timeout_min(100).election_timeout_max(200).heartbeat_interval(50).validate();
        assert!(matches!(res, Err(ConfigError::HeartbeatTooLong)));
    }

    #[test]
    fn test_empty_roster_produces_error() {
        let res = Config::build("test".into()).validate();
        assert!(matches!(res, Err(ConfigError::EmptyRoster)));
    }

    #[test]
    fn test_rand_election_timeout_is_within_window() {
        let cfg = base().validate().expect("valid config");
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min && t < cfg.election_timeout_max);
        }
    }
}
