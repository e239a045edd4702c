//! The replicated queue store.

use std::collections::HashMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::command::MessageId;
use crate::command::QueueResponse;
use crate::sm::SinkOp;
use crate::ClientId;

/// The suffix distinguishing a queue's dead-letter companion.
const DLQ_SUFFIX: &str = "::dlq";

/// The distinguished dead-letter queue name for `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DLQ_SUFFIX)
}

/// Check if the given name addresses a dead-letter queue.
pub fn is_dead_letter_queue(queue: &str) -> bool {
    queue.ends_with(DLQ_SUFFIX)
}

/// The delivery state of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    /// Waiting in its queue for a consumer.
    Pending,
    /// Reserved by a consumer until `visible_until_ms` (unix millis).
    Inflight {
        consumer: ClientId,
        visible_until_ms: u64,
    },
    /// Moved to the dead-letter queue. Terminal.
    Dead,
}

/// A message held by the queue service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub queue: String,
    pub payload: Vec<u8>,
    /// The log index of the enqueue command; the logical production stamp.
    pub produced_at: u64,
    /// Deliveries so far; incremented by each reservation.
    pub attempts: u32,
    pub state: MessageState,
}

impl Message {
    /// The key under which this message's durable record lives in the sink.
    pub fn sink_key(id: &MessageId) -> String {
        format!("queue/msg/{}", id)
    }

    fn durable_record(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message record serializes")
    }
}

/// An expired reservation reported by [`QueueStore::expired_inflight`].
pub struct ExpiredMessage {
    pub id: MessageId,
    pub queue: String,
    pub attempts: u32,
}

/// The message store behind the partitioned queue service.
///
/// Every replica holds every partition (all queue commands flow through the
/// log); partitioning governs only which node performs selection and
/// sweeping. Order within a queue is the FIFO order of committed enqueues,
/// with returned messages re-queued at the front to keep their position.
#[derive(Default)]
pub struct QueueStore {
    messages: HashMap<MessageId, Message>,
    pending: HashMap<String, VecDeque<MessageId>>,
    dead: HashMap<String, VecDeque<MessageId>>,
}

impl QueueStore {
    /// Apply a `QueueEnqueue` command.
    pub fn enqueue(
        &mut self,
        queue: &str,
        message_id: MessageId,
        payload: &[u8],
        produced_at: u64,
    ) -> (QueueResponse, Vec<SinkOp>) {
        if self.messages.contains_key(&message_id) {
            // A handover or retried proposal may replay an enqueue.
            return (QueueResponse::Enqueued { message_id }, Vec::new());
        }
        let message = Message {
            id: message_id,
            queue: queue.to_string(),
            payload: payload.to_vec(),
            produced_at,
            attempts: 0,
            state: MessageState::Pending,
        };
        let record = message.durable_record();
        self.pending.entry(queue.to_string()).or_default().push_back(message_id);
        self.messages.insert(message_id, message);
        (
            QueueResponse::Enqueued { message_id },
            vec![SinkOp::Put {
                key: Message::sink_key(&message_id),
                value: record,
            }],
        )
    }

    /// Apply a `QueueReserve` command: hand the message to a consumer and
    /// count the delivery.
    pub fn reserve(
        &mut self,
        message_id: &MessageId,
        consumer: &ClientId,
        visible_until_ms: u64,
    ) -> (QueueResponse, Vec<SinkOp>) {
        let message = match self.messages.get_mut(message_id) {
            Some(message) if message.state == MessageState::Pending => message,
            // The selection raced an ack or another reservation.
            _ => return (QueueResponse::NotPending, Vec::new()),
        };
        if let Some(ids) = self.pending.get_mut(&message.queue) {
            ids.retain(|id| id != message_id);
        }
        message.attempts += 1;
        message.state = MessageState::Inflight {
            consumer: consumer.clone(),
            visible_until_ms,
        };
        (
            QueueResponse::Reserved {
                message_id: *message_id,
                payload: message.payload.clone(),
                attempts: message.attempts,
            },
            Vec::new(),
        )
    }

    /// Apply a `QueueAck` command: delete the message everywhere.
    pub fn ack(&mut self, message_id: &MessageId) -> (QueueResponse, Vec<SinkOp>) {
        let message = match self.messages.remove(message_id) {
            Some(message) => message,
            None => return (QueueResponse::Unknown, Vec::new()),
        };
        if let Some(ids) = self.pending.get_mut(&message.queue) {
            ids.retain(|id| id != message_id);
        }
        let dlq = dead_letter_queue(&message.queue);
        if let Some(ids) = self.dead.get_mut(&dlq) {
            ids.retain(|id| id != message_id);
        }
        (
            QueueResponse::Acked,
            vec![SinkOp::Delete {
                key: Message::sink_key(message_id),
            }],
        )
    }

    /// Apply a `QueueReturn` command: an expired reservation goes back to the
    /// front of its queue.
    pub fn return_message(&mut self, message_id: &MessageId) -> (QueueResponse, Vec<SinkOp>) {
        let message = match self.messages.get_mut(message_id) {
            Some(message) if matches!(message.state, MessageState::Inflight { .. }) => message,
            _ => return (QueueResponse::NotPending, Vec::new()),
        };
        message.state = MessageState::Pending;
        self.pending.entry(message.queue.clone()).or_default().push_front(*message_id);
        (QueueResponse::Returned, Vec::new())
    }

    /// Apply a `QueueDead` command: move the message to its dead-letter
    /// queue. Terminal.
    pub fn dead(&mut self, message_id: &MessageId) -> (QueueResponse, Vec<SinkOp>) {
        let message = match self.messages.get_mut(message_id) {
            Some(message) if message.state != MessageState::Dead => message,
            Some(_) => return (QueueResponse::Dead, Vec::new()),
            None => return (QueueResponse::Unknown, Vec::new()),
        };
        message.state = MessageState::Dead;
        let queue = message.queue.clone();
        let record = message.durable_record();
        if let Some(ids) = self.pending.get_mut(&queue) {
            ids.retain(|id| id != message_id);
        }
        self.dead.entry(dead_letter_queue(&queue)).or_default().push_back(*message_id);
        (
            QueueResponse::Dead,
            vec![SinkOp::Put {
                key: Message::sink_key(message_id),
                value: record,
            }],
        )
    }

    /// The head pending message of a queue, if any. Used by the partition
    /// primary to select the next reservation candidate.
    pub fn peek_pending(&self, queue: &str) -> Option<MessageId> {
        self.pending.get(queue).and_then(|ids| ids.front().copied())
    }

    /// The head of a dead-letter queue. Dead messages are read in place
    /// (no reservation); `ack` removes them permanently.
    pub fn peek_dead(&self, dlq: &str) -> Option<&Message> {
        self.dead
            .get(dlq)
            .and_then(|ids| ids.front())
            .and_then(|id| self.messages.get(id))
    }

    /// All in-flight messages whose visibility deadline has passed.
    pub fn expired_inflight(&self, now_ms: u64) -> Vec<ExpiredMessage> {
        let mut expired: Vec<_> = self
            .messages
            .values()
            .filter_map(|message| match &message.state {
                MessageState::Inflight { visible_until_ms, .. } if *visible_until_ms <= now_ms => {
                    Some(ExpiredMessage {
                        id: message.id,
                        queue: message.queue.clone(),
                        attempts: message.attempts,
                    })
                }
                _ => None,
            })
            .collect();
        expired.sort_by_key(|e| e.id);
        expired
    }

    /// Fetch a message by id.
    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.get(message_id)
    }

    /// The number of pending messages in a queue.
    pub fn pending_len(&self, queue: &str) -> usize {
        self.pending.get(queue).map(|ids| ids.len()).unwrap_or(0)
    }
}
