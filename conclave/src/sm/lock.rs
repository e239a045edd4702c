//! The replicated lock table.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::command::LockMode;
use crate::command::LockResponse;
use crate::ClientId;

/// A request parked in a lock's wait queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockWaiter {
    pub client: ClientId,
    pub mode: LockMode,
    /// The log index of the `LockAcquire` which parked this request. Used as
    /// the arrival stamp for the youngest-victim rule; identical on every
    /// replica by construction.
    pub enqueued_at: u64,
}

/// The state of a single lockable resource.
#[derive(Clone, Debug, Default)]
struct ResourceLock {
    /// The mode the lock is currently held in; `None` means free.
    mode: Option<LockMode>,
    holders: BTreeSet<ClientId>,
    queue: VecDeque<LockWaiter>,
}

impl ResourceLock {
    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// A read-only view of one lock, for inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub resource: String,
    pub mode: Option<LockMode>,
    pub holders: Vec<ClientId>,
    pub queue: Vec<(ClientId, LockMode)>,
}

/// The shared/exclusive lock table with FIFO wait queues.
///
/// Entries are created on first acquire and destroyed once the lock is free
/// and its queue is empty. Queueing is strictly FIFO per resource: a request
/// is granted immediately only when the queue is empty and the current mode
/// is compatible, so a later-arriving shared request can never be promoted
/// past a queued exclusive request.
#[derive(Default)]
pub struct LockTable {
    locks: HashMap<String, ResourceLock>,
}

impl LockTable {
    /// Apply a `LockAcquire` command.
    pub fn acquire(&mut self, resource: &str, client: &ClientId, mode: LockMode, enqueued_at: u64) -> LockResponse {
        let lock = self.locks.entry(resource.to_string()).or_default();

        if lock.holders.contains(client) {
            // Re-acquire in the held mode is idempotent; conversion is not supported.
            return if lock.mode == Some(mode) {
                LockResponse::Granted
            } else {
                LockResponse::Denied {
                    reason: "lock conversion is not supported".to_string(),
                }
            };
        }
        if lock.queue.iter().any(|w| w.client == *client) {
            return LockResponse::Queued;
        }

        let grantable = lock.queue.is_empty()
            && match lock.mode {
                None => true,
                Some(held) => held.compatible_with(mode),
            };
        if grantable {
            lock.holders.insert(client.clone());
            lock.mode = Some(mode);
            LockResponse::Granted
        } else {
            lock.queue.push_back(LockWaiter {
                client: client.clone(),
                mode,
                enqueued_at,
            });
            LockResponse::Queued
        }
    }

    /// Apply a `LockRelease` command.
    ///
    /// Removes the client from the holder set, or cancels its queued request
    /// if it has not been granted yet. Returns the clients promoted from the
    /// wait queue as `(resource, client)` grants.
    pub fn release(&mut self, resource: &str, client: &ClientId) -> (LockResponse, Vec<ClientId>) {
        let lock = match self.locks.get_mut(resource) {
            Some(lock) => lock,
            None => return (LockResponse::NotHolder, Vec::new()),
        };

        let removed = if lock.holders.remove(client) {
            if lock.holders.is_empty() {
                lock.mode = None;
            }
            true
        } else if let Some(pos) = lock.queue.iter().position(|w| w.client == *client) {
            lock.queue.remove(pos);
            true
        } else {
            false
        };
        if !removed {
            return (LockResponse::NotHolder, Vec::new());
        }

        let granted = Self::promote_waiters(lock);
        if lock.is_idle() {
            self.locks.remove(resource);
        }
        (LockResponse::Released, granted)
    }

    /// Apply a `LockAbort` command: remove the victim from every holder set
    /// and wait queue. Returns the grants unblocked by the removal as
    /// `(resource, client)` pairs.
    pub fn abort(&mut self, client: &ClientId) -> (LockResponse, Vec<(String, ClientId)>) {
        let mut granted = Vec::new();
        let mut idle = Vec::new();
        for (resource, lock) in self.locks.iter_mut() {
            let mut touched = lock.holders.remove(client);
            if lock.holders.is_empty() {
                lock.mode = None;
            }
            if let Some(pos) = lock.queue.iter().position(|w| w.client == *client) {
                lock.queue.remove(pos);
                touched = true;
            }
            if touched {
                for promoted in Self::promote_waiters(lock) {
                    granted.push((resource.clone(), promoted));
                }
                if lock.is_idle() {
                    idle.push(resource.clone());
                }
            }
        }
        for resource in idle {
            self.locks.remove(&resource);
        }
        (LockResponse::Aborted, granted)
    }

    /// Grant the compatible prefix of the wait queue: an exclusive head
    /// consumes the slot alone, a shared head grants a run of shared
    /// requests.
    fn promote_waiters(lock: &mut ResourceLock) -> Vec<ClientId> {
        let mut granted = Vec::new();
        loop {
            let head_mode = match lock.queue.front() {
                Some(waiter) => waiter.mode,
                None => break,
            };
            let can_grant = lock.holders.is_empty()
                || (lock.mode == Some(LockMode::Shared) && head_mode == LockMode::Shared);
            if !can_grant {
                break;
            }
            let waiter = lock.queue.pop_front().expect("non-empty queue");
            lock.holders.insert(waiter.client.clone());
            lock.mode = Some(head_mode);
            granted.push(waiter.client);
            if head_mode == LockMode::Exclusive {
                break;
            }
        }
        granted
    }

    /// A read-only snapshot of the lock table, eventually consistent when
    /// served by a follower.
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        let mut out: Vec<_> = self
            .locks
            .iter()
            .map(|(resource, lock)| LockSnapshot {
                resource: resource.clone(),
                mode: lock.mode,
                holders: lock.holders.iter().cloned().collect(),
                queue: lock.queue.iter().map(|w| (w.client.clone(), w.mode)).collect(),
            })
            .collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    /// Build the wait-for graph: `A → B` iff A is parked in some queue on a
    /// resource held by B in a mode incompatible with A's request.
    ///
    /// Rebuilt from scratch on every scan; O(table size) and off the apply
    /// path.
    pub fn wait_for_edges(&self) -> HashMap<ClientId, BTreeSet<ClientId>> {
        let mut edges: HashMap<ClientId, BTreeSet<ClientId>> = HashMap::new();
        for lock in self.locks.values() {
            let held = match lock.mode {
                Some(mode) => mode,
                None => continue,
            };
            for waiter in &lock.queue {
                if held.compatible_with(waiter.mode) {
                    continue;
                }
                let entry = edges.entry(waiter.client.clone()).or_default();
                for holder in &lock.holders {
                    if holder != &waiter.client {
                        entry.insert(holder.clone());
                    }
                }
            }
        }
        edges
    }

    /// Detect deadlock cycles and select one victim per cycle.
    ///
    /// The victim is the cycle member whose pending request is youngest
    /// (greatest arrival stamp), ties broken by lexicographic client id.
    pub fn deadlock_victims(&self) -> Vec<ClientId> {
        let mut edges = self.wait_for_edges();

        // Youngest pending request per client.
        let mut stamps: HashMap<ClientId, u64> = HashMap::new();
        for lock in self.locks.values() {
            for waiter in &lock.queue {
                let stamp = stamps.entry(waiter.client.clone()).or_insert(0);
                *stamp = (*stamp).max(waiter.enqueued_at);
            }
        }

        let mut victims = Vec::new();
        while let Some(cycle) = find_cycle(&edges) {
            let victim = cycle
                .iter()
                .max_by_key(|client| (stamps.get(*client).copied().unwrap_or(0), (*client).clone()))
                .expect("cycles are non-empty")
                .clone();
            edges.remove(&victim);
            for targets in edges.values_mut() {
                targets.remove(&victim);
            }
            victims.push(victim);
        }
        victims
    }
}

/// Depth-first search for a cycle in the wait-for graph, returning its
/// members if one exists.
fn find_cycle(edges: &HashMap<ClientId, BTreeSet<ClientId>>) -> Option<Vec<ClientId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: &ClientId,
        edges: &HashMap<ClientId, BTreeSet<ClientId>>,
        color: &mut HashMap<ClientId, Color>,
        path: &mut Vec<ClientId>,
    ) -> Option<Vec<ClientId>> {
        color.insert(node.clone(), Color::Gray);
        path.push(node.clone());
        if let Some(targets) = edges.get(node) {
            for next in targets {
                match color.get(next).copied().unwrap_or(Color::White) {
                    Color::White => {
                        if let Some(cycle) = visit(next, edges, color, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Gray => {
                        let start = path.iter().position(|n| n == next).expect("gray node is on the path");
                        return Some(path[start..].to_vec());
                    }
                    Color::Black => {}
                }
            }
        }
        path.pop();
        color.insert(node.clone(), Color::Black);
        None
    }

    let mut color = HashMap::new();
    let mut path = Vec::new();
    // BTreeSet of roots for a deterministic visit order.
    let roots: BTreeSet<_> = edges.keys().cloned().collect();
    for root in roots {
        if color.get(&root).copied().map(|c| c == Color::White).unwrap_or(true) {
            if let Some(cycle) = visit(&root, edges, &mut color, &mut path) {
                return Some(cycle);
            }
            path.clear();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientId {
        name.to_string()
    }

    #[test]
    fn test_exclusive_then_queue_then_promote() {
        let mut table = LockTable::default();
        assert_eq!(
            table.acquire("r", &client("x"), LockMode::Exclusive, 1),
            LockResponse::Granted
        );
        assert_eq!(
            table.acquire("r", &client("y"), LockMode::Exclusive, 2),
            LockResponse::Queued
        );

        let (res, granted) = table.release("r", &client("x"));
        assert_eq!(res, LockResponse::Released);
        assert_eq!(granted, vec![client("y")]);
    }

    #[test]
    fn test_shared_holders_coexist() {
        let mut table = LockTable::default();
        assert_eq!(table.acquire("r", &client("a"), LockMode::Shared, 1), LockResponse::Granted);
        assert_eq!(table.acquire("r", &client("b"), LockMode::Shared, 2), LockResponse::Granted);

        let snap = table.snapshot();
        assert_eq!(snap[0].holders.len(), 2);
    }

    #[test]
    fn test_later_shared_does_not_pass_queued_exclusive() {
        let mut table = LockTable::default();
        table.acquire("r", &client("a"), LockMode::Shared, 1);
        assert_eq!(
            table.acquire("r", &client("w"), LockMode::Exclusive, 2),
            LockResponse::Queued
        );
        // A shared request arriving after a queued exclusive must wait behind it.
        assert_eq!(table.acquire("r", &client("b"), LockMode::Shared, 3), LockResponse::Queued);

        let (_, granted) = table.release("r", &client("a"));
        assert_eq!(granted, vec![client("w")]);

        // Releasing the exclusive then grants the shared run.
        let (_, granted) = table.release("r", &client("w"));
        assert_eq!(granted, vec![client("b")]);
    }

    #[test]
    fn test_shared_run_promotion() {
        let mut table = LockTable::default();
        table.acquire("r", &client("w"), LockMode::Exclusive, 1);
        table.acquire("r", &client("a"), LockMode::Shared, 2);
        table.acquire("r", &client("b"), LockMode::Shared, 3);
        table.acquire("r", &client("z"), LockMode::Exclusive, 4);

        let (_, granted) = table.release("r", &client("w"));
        // Both shared requests are granted as a run; the trailing exclusive stays queued.
        assert_eq!(granted, vec![client("a"), client("b")]);
        let snap = table.snapshot();
        assert_eq!(snap[0].queue, vec![(client("z"), LockMode::Exclusive)]);
    }

    #[test]
    fn test_release_of_non_holder() {
        let mut table = LockTable::default();
        let (res, _) = table.release("r", &client("nobody"));
        assert_eq!(res, LockResponse::NotHolder);

        table.acquire("r", &client("a"), LockMode::Shared, 1);
        let (res, _) = table.release("r", &client("b"));
        assert_eq!(res, LockResponse::NotHolder);
    }

    #[test]
    fn test_cancel_of_queued_request() {
        let mut table = LockTable::default();
        table.acquire("r", &client("a"), LockMode::Exclusive, 1);
        table.acquire("r", &client("b"), LockMode::Exclusive, 2);
        let (res, granted) = table.release("r", &client("b"));
        assert_eq!(res, LockResponse::Released);
        assert!(granted.is_empty());
        assert!(table.snapshot()[0].queue.is_empty());
    }

    #[test]
    fn test_conversion_is_denied() {
        let mut table = LockTable::default();
        table.acquire("r", &client("a"), LockMode::Shared, 1);
        assert!(matches!(
            table.acquire("r", &client("a"), LockMode::Exclusive, 2),
            LockResponse::Denied { .. }
        ));
        // Same-mode re-acquire is an idempotent grant.
        assert_eq!(table.acquire("r", &client("a"), LockMode::Shared, 3), LockResponse::Granted);
    }

    #[test]
    fn test_lock_entry_destroyed_when_idle() {
        let mut table = LockTable::default();
        table.acquire("r", &client("a"), LockMode::Exclusive, 1);
        table.release("r", &client("a"));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_wait_for_cycle_detection_and_victim() {
        let mut table = LockTable::default();
        // x holds r1, y holds r2, then each requests the other's resource.
        table.acquire("r1", &client("x"), LockMode::Exclusive, 1);
        table.acquire("r2", &client("y"), LockMode::Exclusive, 2);
        table.acquire("r2", &client("x"), LockMode::Exclusive, 3);
        table.acquire("r1", &client("y"), LockMode::Exclusive, 4);

        let victims = table.deadlock_victims();
        // y's pending request (stamp 4) is youngest.
        assert_eq!(victims, vec![client("y")]);

        let (_, granted) = table.abort(&client("y"));
        assert_eq!(granted, vec![("r2".to_string(), client("x"))]);
        assert!(table.deadlock_victims().is_empty());
    }

    #[test]
    fn test_no_cycle_no_victims() {
        let mut table = LockTable::default();
        table.acquire("r1", &client("x"), LockMode::Exclusive, 1);
        table.acquire("r1", &client("y"), LockMode::Exclusive, 2);
        assert!(table.deadlock_victims().is_empty());
    }

    #[test]
    fn test_shared_holders_block_exclusive_waiter_edges() {
        let mut table = LockTable::default();
        table.acquire("r", &client("a"), LockMode::Shared, 1);
        table.acquire("r", &client("b"), LockMode::Shared, 2);
        table.acquire("r", &client("w"), LockMode::Exclusive, 3);

        let edges = table.wait_for_edges();
        let blockers = edges.get(&client("w")).expect("w waits");
        assert!(blockers.contains(&client("a")) && blockers.contains(&client("b")));
    }
}
