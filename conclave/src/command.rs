//! The replicated command set and its apply responses.

use serde::Deserialize;
use serde::Serialize;

use crate::ClientId;
use crate::MessageSummary;
use crate::NodeId;

/// The id of a queued message.
pub type MessageId = uuid::Uuid;

/// The mode in which a lock is requested or held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Any number of clients may hold the lock concurrently.
    Shared,
    /// Exactly one client may hold the lock.
    Exclusive,
}

impl LockMode {
    /// Check if a holder in `self` mode is compatible with a request for `other`.
    pub fn compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// A command carried by the replicated log and applied to the state machine.
///
/// This is a closed set: the applier pattern-matches exactly once per
/// committed entry and dispatches to the owning service. Handlers must be
/// deterministic functions of the command and the current table state, which
/// is why anything time-like (visibility deadlines, enqueue stamps) is either
/// carried inside the command by its proposer or derived from the log index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Request a lock on `resource` for `client` in the given mode.
    LockAcquire {
        resource: String,
        client: ClientId,
        mode: LockMode,
    },
    /// Release (or cancel a queued request for) `resource` held by `client`.
    LockRelease { resource: String, client: ClientId },
    /// Remove `client` from every holder set and wait queue (deadlock victim).
    LockAbort { client: ClientId },
    /// Append a message to a queue. The message id is assigned by the
    /// partition primary before proposing.
    QueueEnqueue {
        queue: String,
        message_id: MessageId,
        payload: Vec<u8>,
    },
    /// Reserve the given pending message for a consumer until `visible_until_ms`
    /// (unix millis), counting one delivery.
    QueueReserve {
        message_id: MessageId,
        consumer: ClientId,
        visible_until_ms: u64,
    },
    /// Acknowledge and delete a message.
    QueueAck { message_id: MessageId },
    /// Return an expired in-flight message to the front of its queue.
    QueueReturn { message_id: MessageId },
    /// Move a message to its dead-letter queue. Terminal.
    QueueDead { message_id: MessageId },
    /// Store a value at `origin`, invalidating every other copy.
    CachePut {
        key: String,
        value: Vec<u8>,
        origin: NodeId,
    },
    /// Claim exclusive clean ownership of a key for `origin` (miss-fill from
    /// the backing sink), invalidating every other copy.
    CacheInvalidate { key: String, origin: NodeId },
    /// Drop the origin's modified line for a key after it has been written back.
    CacheEvict { key: String, origin: NodeId },
}

impl MessageSummary for Command {
    fn summary(&self) -> String {
        match self {
            Command::LockAcquire { resource, client, mode } => {
                format!("lock-acquire: {} by {} ({:?})", resource, client, mode)
            }
            Command::LockRelease { resource, client } => format!("lock-release: {} by {}", resource, client),
            Command::LockAbort { client } => format!("lock-abort: {}", client),
            Command::QueueEnqueue { queue, message_id, payload } => {
                format!("queue-enqueue: {} id={} {}B", queue, message_id, payload.len())
            }
            Command::QueueReserve {
                message_id,
                consumer,
                visible_until_ms,
            } => format!("queue-reserve: {} by {} until {}", message_id, consumer, visible_until_ms),
            Command::QueueAck { message_id } => format!("queue-ack: {}", message_id),
            Command::QueueReturn { message_id } => format!("queue-return: {}", message_id),
            Command::QueueDead { message_id } => format!("queue-dead: {}", message_id),
            Command::CachePut { key, value, origin } => {
                format!("cache-put: {} {}B at {}", key, value.len(), origin)
            }
            Command::CacheInvalidate { key, origin } => format!("cache-claim: {} by {}", key, origin),
            Command::CacheEvict { key, origin } => format!("cache-evict: {} at {}", key, origin),
        }
    }
}

/// The outcome of applying a single committed command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// The entry carried no command (a new leader's blank entry).
    Blank,
    Lock(LockResponse),
    Queue(QueueResponse),
    Cache(CacheResponse),
}

/// Apply outcomes of the lock service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LockResponse {
    /// The request was granted immediately.
    Granted,
    /// The request was queued behind incompatible holders or waiters.
    Queued,
    /// The request was denied outright.
    Denied { reason: String },
    /// The client was removed from the holder set (or its queued request cancelled).
    Released,
    /// The client neither held the lock nor had a request queued.
    NotHolder,
    /// The client was aborted as a deadlock victim.
    Aborted,
}

/// Apply outcomes of the queue service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueueResponse {
    /// The message is durably enqueued.
    Enqueued { message_id: MessageId },
    /// The message is reserved for the consumer; `attempts` counts this delivery.
    Reserved {
        message_id: MessageId,
        payload: Vec<u8>,
        attempts: u32,
    },
    /// The reservation raced: the message is no longer pending.
    NotPending,
    /// The message was acknowledged and deleted.
    Acked,
    /// The message id is not known to the cluster.
    Unknown,
    /// The message returned to pending.
    Returned,
    /// The message moved to its dead-letter queue.
    Dead,
}

/// Apply outcomes of the cache service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CacheResponse {
    /// The value is stored; the origin now holds the only valid (modified) copy.
    Stored,
    /// The origin's staged fill is promoted to an exclusive clean copy.
    Claimed,
    /// The origin's line was dropped.
    Evicted,
}
