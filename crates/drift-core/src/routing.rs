//! Routing oracle: observed topology and next-hop selection.
//!
//! The oracle keeps a directed graph of links reported by neighbors and a
//! per-link quality score in `[0, 1]`, an exponential moving average over
//! send outcomes nudged upward by receives. Its decisions are advisory:
//! topology is eventually consistent and never authoritative, and the
//! relay engine tolerates its absence by falling back to any available
//! peer other than the one a message came from.

use crate::identity::ChatId;
use crate::outbox::Priority;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Instant;

/// Smoothing factor of the quality EMA.
const QUALITY_ALPHA: f64 = 0.3;

/// Quality granted to a link never attempted.
const QUALITY_INITIAL: f64 = 0.5;

/// Upward nudge applied on each receive.
const QUALITY_RECEIVE_BOOST: f64 = 0.05;

/// Links below this score are not attempted for non-urgent traffic.
const QUALITY_FLOOR: f64 = 0.2;

#[derive(Default)]
struct Topology {
    /// Directed edges: reporter -> neighbors, with observation times.
    edges: HashMap<ChatId, HashMap<ChatId, Instant>>,
    /// Quality of our own links, by neighbor.
    quality: HashMap<ChatId, f64>,
    /// Connection times of our own links (freshness tie-break).
    connected_at: HashMap<ChatId, Instant>,
}

/// Topology store and next-hop chooser.
pub struct RoutingOracle {
    local: ChatId,
    inner: RwLock<Topology>,
}

impl RoutingOracle {
    /// Create an oracle for the local node.
    #[must_use]
    pub fn new(local: ChatId) -> Self {
        Self {
            local,
            inner: RwLock::new(Topology::default()),
        }
    }

    /// Record a neighbor's reported adjacency. Replaces the reporter's
    /// previous edge set.
    pub fn update_adjacency(&self, reporter: ChatId, neighbors: &[ChatId], now: Instant) {
        let mut inner = self.write();
        let edges = inner.edges.entry(reporter).or_default();
        edges.clear();
        for neighbor in neighbors {
            edges.insert(*neighbor, now);
        }
        tracing::trace!(reporter = %reporter, count = neighbors.len(), "adjacency updated");
    }

    /// Record a new direct link.
    pub fn note_connected(&self, peer: ChatId, now: Instant) {
        let mut inner = self.write();
        inner.connected_at.insert(peer, now);
        inner.quality.entry(peer).or_insert(QUALITY_INITIAL);
        inner.edges.entry(self.local).or_default().insert(peer, now);
    }

    /// Drop a direct link.
    pub fn note_disconnected(&self, peer: &ChatId) {
        let mut inner = self.write();
        inner.connected_at.remove(peer);
        if let Some(edges) = inner.edges.get_mut(&self.local) {
            edges.remove(peer);
        }
    }

    /// Fold a send outcome into the link quality EMA.
    pub fn record_send_result(&self, peer: &ChatId, success: bool) {
        let mut inner = self.write();
        let sample = if success { 1.0 } else { 0.0 };
        let quality = inner.quality.entry(*peer).or_insert(QUALITY_INITIAL);
        *quality = QUALITY_ALPHA * sample + (1.0 - QUALITY_ALPHA) * *quality;
    }

    /// Nudge the link quality upward on traffic received from the peer.
    pub fn record_receive(&self, peer: &ChatId) {
        let mut inner = self.write();
        let quality = inner.quality.entry(*peer).or_insert(QUALITY_INITIAL);
        *quality = (*quality + QUALITY_RECEIVE_BOOST).min(1.0);
    }

    /// Whether the oracle has no reported topology beyond its own links.
    /// The relay engine treats an empty oracle as advisory-absent and
    /// falls back to any available peer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.read();
        inner
            .edges
            .iter()
            .all(|(reporter, edges)| *reporter == self.local || edges.is_empty())
    }

    /// Current quality score of a direct link.
    #[must_use]
    pub fn link_quality(&self, peer: &ChatId) -> f64 {
        self.read()
            .quality
            .get(peer)
            .copied()
            .unwrap_or(QUALITY_INITIAL)
    }

    /// Pick the next hop toward `final_recipient` among the currently
    /// available peers.
    ///
    /// Policy, in order: the recipient itself if available; otherwise the
    /// first hop of the shortest observed path, ties broken by higher
    /// first-hop quality, remaining ties by fresher connection. Non-urgent
    /// traffic refuses links below the quality floor; urgent ignores it.
    #[must_use]
    pub fn choose_next_hop(
        &self,
        final_recipient: &ChatId,
        available: &[ChatId],
        priority: Priority,
    ) -> Option<ChatId> {
        if available.contains(final_recipient) {
            return Some(*final_recipient);
        }

        let inner = self.read();
        let mut best: Option<(usize, f64, Instant, ChatId)> = None;
        for candidate in available {
            let Some(distance) = hop_distance(&inner.edges, candidate, final_recipient) else {
                continue;
            };
            let quality = inner
                .quality
                .get(candidate)
                .copied()
                .unwrap_or(QUALITY_INITIAL);
            let connected = inner
                .connected_at
                .get(candidate)
                .copied()
                .unwrap_or_else(Instant::now);
            let better = match &best {
                None => true,
                Some((best_distance, best_quality, best_connected, _)) => {
                    distance < *best_distance
                        || (distance == *best_distance
                            && (quality > *best_quality
                                || (quality == *best_quality && connected > *best_connected)))
                }
            };
            if better {
                best = Some((distance, quality, connected, *candidate));
            }
        }

        let (_, quality, _, choice) = best?;
        if priority != Priority::Urgent && quality < QUALITY_FLOOR {
            tracing::debug!(
                peer = %choice,
                quality,
                "withholding send below quality floor"
            );
            return None;
        }
        Some(choice)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Topology> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Topology> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Breadth-first hop count from `from` to `to` over the reported edges.
fn hop_distance(
    edges: &HashMap<ChatId, HashMap<ChatId, Instant>>,
    from: &ChatId,
    to: &ChatId,
) -> Option<usize> {
    if from == to {
        return Some(0);
    }
    let mut visited: HashSet<ChatId> = HashSet::new();
    let mut queue: VecDeque<(ChatId, usize)> = VecDeque::new();
    visited.insert(*from);
    queue.push_back((*from, 0));

    while let Some((node, distance)) = queue.pop_front() {
        let Some(neighbors) = edges.get(&node) else {
            continue;
        };
        for neighbor in neighbors.keys() {
            if neighbor == to {
                return Some(distance + 1);
            }
            if visited.insert(*neighbor) {
                queue.push_back((*neighbor, distance + 1));
            }
        }
    }
    None
}
