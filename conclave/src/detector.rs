//! φ-accrual failure detection.
//!
//! Each peer gets a bounded window of heartbeat inter-arrival samples from
//! which a suspicion level φ is computed as `-log10(1 - F(Δt))`, with `F`
//! the (logistically approximated) normal CDF over the sampled mean and
//! variance. Rather than a boolean verdict, φ grows continuously as a peer
//! falls silent; thresholds map it onto the `alive → suspected → failed`
//! transitions, and any successful message resets the peer to alive.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::Config;
use crate::NodeId;

/// The observed health of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    Alive,
    Suspected,
    Failed,
}

/// Minimum standard deviation used in the φ computation, to keep the value
/// finite for extremely regular heartbeat histories.
const MIN_STD_DEV_MS: f64 = 10.0;

/// The heartbeat inter-arrival history of a single peer.
#[derive(Debug)]
pub struct PhiAccrual {
    window: usize,
    intervals_ms: VecDeque<f64>,
    last_arrival: Option<Instant>,
}

impl PhiAccrual {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            intervals_ms: VecDeque::with_capacity(window),
            last_arrival: None,
        }
    }

    /// Record an arrival from the peer.
    pub fn heartbeat(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let interval = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            if self.intervals_ms.len() == self.window {
                self.intervals_ms.pop_front();
            }
            self.intervals_ms.push_back(interval);
        }
        self.last_arrival = Some(now);
    }

    /// The current suspicion level for the peer.
    ///
    /// Returns 0 until at least a few samples have been collected, so that a
    /// freshly started cluster does not immediately suspect every peer.
    pub fn phi(&self, now: Instant) -> f64 {
        let last = match self.last_arrival {
            Some(last) => last,
            None => return 0.0,
        };
        if self.intervals_ms.len() < 3 {
            return 0.0;
        }

        let elapsed_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
        let n = self.intervals_ms.len() as f64;
        let mean = self.intervals_ms.iter().sum::<f64>() / n;
        let variance = self.intervals_ms.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let std_dev = variance.sqrt().max(MIN_STD_DEV_MS);

        let y = (elapsed_ms - mean) / std_dev;
        // Logistic approximation of the normal CDF, accurate to a few
        // thousandths over the range that matters here.
        let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
        if elapsed_ms > mean {
            -(e / (1.0 + e)).log10()
        } else {
            -(1.0 - 1.0 / (1.0 + e)).log10()
        }
    }
}

/// The per-peer failure detector, publishing health transitions on a watch channel.
pub struct FailureDetector {
    phi_suspected: f64,
    phi_failed: f64,
    peers: BTreeMap<NodeId, PhiAccrual>,
    health: BTreeMap<NodeId, NodeHealth>,
    tx: watch::Sender<BTreeMap<NodeId, NodeHealth>>,
    rx: watch::Receiver<BTreeMap<NodeId, NodeHealth>>,
}

impl FailureDetector {
    /// Build a detector covering every roster member other than this node.
    pub fn new(config: &Config, self_id: &NodeId) -> Self {
        let mut peers = BTreeMap::new();
        let mut health = BTreeMap::new();
        for peer in config.members.keys() {
            if peer != self_id {
                peers.insert(peer.clone(), PhiAccrual::new(config.phi_window));
                health.insert(peer.clone(), NodeHealth::Alive);
            }
        }
        let (tx, rx) = watch::channel(health.clone());
        Self {
            phi_suspected: config.phi_suspected_threshold,
            phi_failed: config.phi_failed_threshold,
            peers,
            health,
            tx,
            rx,
        }
    }

    /// A subscription to the health table; updated on every transition.
    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<NodeId, NodeHealth>> {
        self.rx.clone()
    }

    /// Record an inbound message from a peer. Any successful message resets
    /// the peer to alive.
    pub fn observe(&mut self, peer: &NodeId, now: Instant) {
        if let Some(window) = self.peers.get_mut(peer) {
            window.heartbeat(now);
        }
        if self.health.get(peer).copied() != Some(NodeHealth::Alive) {
            self.transition(peer, NodeHealth::Alive);
        }
    }

    /// Re-evaluate every peer's φ against the thresholds.
    pub fn evaluate(&mut self, now: Instant) {
        let mut transitions = Vec::new();
        for (peer, window) in self.peers.iter() {
            let phi = window.phi(now);
            let current = self.health.get(peer).copied().unwrap_or(NodeHealth::Alive);
            let next = match current {
                NodeHealth::Alive if phi > self.phi_suspected => NodeHealth::Suspected,
                NodeHealth::Suspected if phi > self.phi_failed => NodeHealth::Failed,
                _ => continue,
            };
            tracing::info!(peer=%peer, phi, ?next, "peer health transition");
            transitions.push((peer.clone(), next));
        }
        for (peer, next) in transitions {
            self.transition(&peer, next);
        }
    }

    /// The current health of a peer; unknown peers are reported alive.
    pub fn health_of(&self, peer: &NodeId) -> NodeHealth {
        self.health.get(peer).copied().unwrap_or(NodeHealth::Alive)
    }

    fn transition(&mut self, peer: &NodeId, next: NodeHealth) {
        self.health.insert(peer.clone(), next);
        let _ = self.tx.send(self.health.clone());
    }
}

/// The set of nodes currently considered usable for routing (alive or
/// suspected; only failed nodes are routed around).
pub fn routable_nodes(health: &BTreeMap<NodeId, NodeHealth>, self_id: &NodeId) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = health
        .iter()
        .filter(|(_, state)| **state != NodeHealth::Failed)
        .map(|(peer, _)| peer.clone())
        .collect();
    nodes.push(self_id.clone());
    nodes.sort();
    nodes
}

#[cfg(test)]
mod tests {
    use tokio::time::Duration;

    use super::*;

    fn advance(start: Instant, ms: u64) -> Instant {
        start + Duration::from_millis(ms)
    }

    #[test]
    fn test_phi_stays_low_with_regular_heartbeats() {
        let mut window = PhiAccrual::new(100);
        let start = Instant::now();
        for beat in 0..20 {
            window.heartbeat(advance(start, beat * 50));
        }
        let phi = window.phi(advance(start, 19 * 50 + 50));
        assert!(phi < 2.0, "phi was {}", phi);
    }

    #[test]
    fn test_phi_grows_as_peer_falls_silent() {
        let mut window = PhiAccrual::new(100);
        let start = Instant::now();
        for beat in 0..20 {
            window.heartbeat(advance(start, beat * 50));
        }
        let soon = window.phi(advance(start, 19 * 50 + 100));
        let late = window.phi(advance(start, 19 * 50 + 1000));
        let very_late = window.phi(advance(start, 19 * 50 + 5000));
        assert!(soon < late && late <= very_late);
        assert!(very_late > 12.0, "phi was {}", very_late);
    }

    #[test]
    fn test_phi_needs_warmup_samples() {
        let mut window = PhiAccrual::new(100);
        let start = Instant::now();
        window.heartbeat(start);
        assert_eq!(window.phi(advance(start, 60_000)), 0.0);
    }

    #[test]
    fn test_detector_transitions_and_reset() {
        let config = Config::build("test".into())
            .member("a", "127.0.0.1:1")
            .member("b", "127.0.0.1:2")
            .validate()
            .expect("valid config");
        let mut detector = FailureDetector::new(&config, &"a".to_string());
        let peer = "b".to_string();
        let start = Instant::now();

        for beat in 0..20 {
            detector.observe(&peer, advance(start, beat * 50));
        }
        detector.evaluate(advance(start, 19 * 50 + 50));
        assert_eq!(detector.health_of(&peer), NodeHealth::Alive);

        // Long silence drives the peer through suspected into failed.
        detector.evaluate(advance(start, 19 * 50 + 5000));
        assert_eq!(detector.health_of(&peer), NodeHealth::Suspected);
        detector.evaluate(advance(start, 19 * 50 + 60_000));
        assert_eq!(detector.health_of(&peer), NodeHealth::Failed);

        // Any successful message resets to alive.
        detector.observe(&peer, advance(start, 19 * 50 + 60_050));
        assert_eq!(detector.health_of(&peer), NodeHealth::Alive);
    }
}
