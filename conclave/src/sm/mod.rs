//! The deterministic state machine shared by the three coordination services.

pub mod cache;
pub mod lock;
pub mod queue;

use tokio::sync::mpsc;

use crate::command::Command;
use crate::command::CommandResponse;
use crate::config::Config;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::sm::cache::CacheStore;
use crate::sm::lock::LockTable;
use crate::sm::queue::QueueStore;
use crate::ClientId;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// A side effect emitted while applying a committed entry, consumed by the
/// node layer to resolve parked client requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyEvent {
    /// A queued lock request was promoted.
    LockGranted { resource: String, client: ClientId },
    /// A client was removed everywhere as a deadlock victim.
    LockAborted { client: ClientId },
}

/// A durable write scheduled during apply and drained by the node's sink
/// writer task. Handlers perform no I/O themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// The state machine: a thin dispatcher over the lock, queue and cache
/// tables.
///
/// The whole struct sits behind a single mutex shared by the Raft applier
/// and the node layer, so each committed entry mutates all three services
/// atomically. Applies are strictly ordered by log index and idempotent
/// against replays.
pub struct StateMachine {
    node_id: NodeId,
    last_applied: LogId,
    pub locks: LockTable,
    pub queues: QueueStore,
    pub cache: CacheStore,
    events_tx: mpsc::UnboundedSender<ApplyEvent>,
    sink_tx: mpsc::UnboundedSender<SinkOp>,
}

impl StateMachine {
    pub fn new(
        node_id: NodeId,
        config: &Config,
        events_tx: mpsc::UnboundedSender<ApplyEvent>,
        sink_tx: mpsc::UnboundedSender<SinkOp>,
    ) -> Self {
        Self {
            cache: CacheStore::new(node_id.clone(), config.cache_capacity),
            node_id,
            last_applied: LogId::default(),
            locks: LockTable::default(),
            queues: QueueStore::default(),
            events_tx,
            sink_tx,
        }
    }

    /// The id of the last applied entry.
    pub fn last_applied(&self) -> LogId {
        self.last_applied
    }

    /// Apply a committed entry, dispatching on the command variant.
    pub fn apply(&mut self, entry: &Entry) -> CommandResponse {
        if entry.log_id.index <= self.last_applied.index {
            tracing::trace!(entry=%entry.log_id, last_applied=%self.last_applied, "skipping already applied entry");
            return CommandResponse::Blank;
        }
        self.last_applied = entry.log_id;

        let command = match &entry.payload {
            EntryPayload::Blank => return CommandResponse::Blank,
            EntryPayload::Normal(command) => command,
        };
        tracing::debug!(id=%self.node_id, index=entry.log_id.index, "applying {}", command.summary());

        match command {
            Command::LockAcquire { resource, client, mode } => {
                CommandResponse::Lock(self.locks.acquire(resource, client, *mode, entry.log_id.index))
            }
            Command::LockRelease { resource, client } => {
                let (response, granted) = self.locks.release(resource, client);
                for promoted in granted {
                    self.emit(ApplyEvent::LockGranted {
                        resource: resource.clone(),
                        client: promoted,
                    });
                }
                CommandResponse::Lock(response)
            }
            Command::LockAbort { client } => {
                let (response, granted) = self.locks.abort(client);
                self.emit(ApplyEvent::LockAborted { client: client.clone() });
                for (resource, promoted) in granted {
                    self.emit(ApplyEvent::LockGranted {
                        resource,
                        client: promoted,
                    });
                }
                CommandResponse::Lock(response)
            }
            Command::QueueEnqueue {
                queue,
                message_id,
                payload,
            } => {
                let (response, ops) = self.queues.enqueue(queue, *message_id, payload, entry.log_id.index);
                self.schedule(ops);
                CommandResponse::Queue(response)
            }
            Command::QueueReserve {
                message_id,
                consumer,
                visible_until_ms,
            } => {
                let (response, ops) = self.queues.reserve(message_id, consumer, *visible_until_ms);
                self.schedule(ops);
                CommandResponse::Queue(response)
            }
            Command::QueueAck { message_id } => {
                let (response, ops) = self.queues.ack(message_id);
                self.schedule(ops);
                CommandResponse::Queue(response)
            }
            Command::QueueReturn { message_id } => {
                let (response, ops) = self.queues.return_message(message_id);
                self.schedule(ops);
                CommandResponse::Queue(response)
            }
            Command::QueueDead { message_id } => {
                let (response, ops) = self.queues.dead(message_id);
                self.schedule(ops);
                CommandResponse::Queue(response)
            }
            Command::CachePut { key, value, origin } => CommandResponse::Cache(self.cache.apply_put(key, value, origin)),
            Command::CacheInvalidate { key, origin } => CommandResponse::Cache(self.cache.apply_claim(key, origin)),
            Command::CacheEvict { key, origin } => CommandResponse::Cache(self.cache.apply_evict(key, origin)),
        }
    }

    fn emit(&self, event: ApplyEvent) {
        // The receiver half lives in the node layer; a closed channel just
        // means the node is shutting down.
        let _ = self.events_tx.send(event);
    }

    fn schedule(&self, ops: Vec<SinkOp>) {
        for op in ops {
            let _ = self.sink_tx.send(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::LockMode;
    use crate::command::LockResponse;

    fn machine() -> (StateMachine, mpsc::UnboundedReceiver<ApplyEvent>, mpsc::UnboundedReceiver<SinkOp>) {
        let config = Config::build("test".into()).member("n1", "127.0.0.1:1").validate().unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        (StateMachine::new("n1".into(), &config, events_tx, sink_tx), events_rx, sink_rx)
    }

    fn entry(index: u64, command: Command) -> Entry {
        Entry {
            log_id: LogId::new(1, index),
            payload: EntryPayload::Normal(command),
        }
    }

    #[test]
    fn test_apply_is_idempotent_against_replays() {
        let (mut sm, _events, _sink) = machine();
        let acquire = entry(
            1,
            Command::LockAcquire {
                resource: "r".into(),
                client: "x".into(),
                mode: LockMode::Exclusive,
            },
        );
        assert_eq!(
            sm.apply(&acquire),
            CommandResponse::Lock(LockResponse::Granted)
        );
        // Replaying the same index is a no-op.
        assert_eq!(sm.apply(&acquire), CommandResponse::Blank);
        assert_eq!(sm.last_applied().index, 1);
    }

    #[test]
    fn test_promotion_emits_grant_event() {
        let (mut sm, mut events, _sink) = machine();
        sm.apply(&entry(
            1,
            Command::LockAcquire {
                resource: "r".into(),
                client: "x".into(),
                mode: LockMode::Exclusive,
            },
        ));
        sm.apply(&entry(
            2,
            Command::LockAcquire {
                resource: "r".into(),
                client: "y".into(),
                mode: LockMode::Exclusive,
            },
        ));
        sm.apply(&entry(
            3,
            Command::LockRelease {
                resource: "r".into(),
                client: "x".into(),
            },
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            ApplyEvent::LockGranted {
                resource: "r".into(),
                client: "y".into()
            }
        );
    }

    #[test]
    fn test_enqueue_schedules_durable_write() {
        let (mut sm, _events, mut sink) = machine();
        let message_id = crate::MessageId::new_v4();
        sm.apply(&entry(
            1,
            Command::QueueEnqueue {
                queue: "q".into(),
                message_id,
                payload: b"job".to_vec(),
            },
        ));
        match sink.try_recv().unwrap() {
            SinkOp::Put { key, .. } => assert!(key.contains(&message_id.to_string())),
            other => panic!("unexpected sink op: {:?}", other),
        }
    }
}
