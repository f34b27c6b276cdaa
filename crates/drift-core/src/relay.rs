//! Mesh relay engine.
//!
//! Classifies every decrypted inbound message: deliver locally, forward to
//! a next hop, park in the outbox for a later attempt, or drop. Drops are
//! silent by design; they are counted, never surfaced to the user path.
//!
//! Forwarding always increments the hop count, never exceeds the hop
//! ceiling, never echoes to the peer a message came from, and is gated by
//! a per-original-sender token bucket.

use crate::error::FrameError;
use crate::identity::ChatId;
use crate::outbox::{MessageId, Priority, RelayMetadata};
use crate::routing::RoutingOracle;
use crate::seen::SeenStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

/// Reasons for a silent drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDrop {
    /// Seen within the duplicate-suppression window.
    Duplicate,
    /// Hop count reached the ceiling.
    HopLimit,
    /// Original sender exceeded the sustained rate.
    Rate,
    /// Could be neither forwarded nor parked.
    NoRoute,
}

/// What to do with an inbound message.
#[derive(Debug)]
pub enum RelayDecision {
    /// Addressed to this node; hand to the delivery sink.
    DeliverLocal(RelayEnvelope),
    /// Forward to the chosen peer; the envelope's hop count is already
    /// incremented and it must be re-encrypted for that hop.
    Forward {
        /// Peer to emit to.
        next_hop: ChatId,
        /// Envelope with incremented hop count.
        envelope: RelayEnvelope,
    },
    /// No route right now; enqueue into the outbox for a later attempt.
    Park(RelayEnvelope),
    /// Silent drop.
    Drop(RelayDrop),
}

/// Routing metadata plus the payload it wraps.
///
/// `end_to_end` distinguishes the two payload forms: a single-hop message
/// is protected by the hop seal alone (the hop session and the end-to-end
/// session are the same channel), while relayed traffic carries an inner
/// ciphertext sealed under the session with the final recipient, opaque
/// to every intermediate node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Multi-hop routing header.
    pub metadata: RelayMetadata,
    /// Whether `payload` carries an inner end-to-end seal.
    pub end_to_end: bool,
    /// Payload bytes; ciphertext for the final recipient when
    /// `end_to_end` is set.
    pub payload: Vec<u8>,
}

impl RelayEnvelope {
    /// Serialize for per-hop encryption.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadOverflow`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serialize(self).map_err(|_| FrameError::PayloadOverflow)
    }

    /// Parse a decrypted per-hop payload.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MalformedFragment`] on undecodable input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        bincode::deserialize(bytes).map_err(|_| FrameError::MalformedFragment)
    }

    /// The envelope as emitted to the next hop: hop count incremented,
    /// everything else untouched.
    #[must_use]
    pub fn for_next_hop(mut self) -> Self {
        self.metadata.hop_count = self.metadata.hop_count.saturating_add(1);
        self
    }
}

/// Monotonic relay counters.
#[derive(Default)]
pub struct RelayStats {
    relayed: AtomicU64,
    delivered_to_self: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_hop_limit: AtomicU64,
    dropped_spam: AtomicU64,
    dropped_no_route: AtomicU64,
}

/// Point-in-time view of the relay counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStatsSnapshot {
    /// Messages forwarded to a next hop.
    pub relayed: u64,
    /// Messages delivered to the local sink.
    pub delivered_to_self: u64,
    /// Drops: duplicate within the seen window.
    pub dropped_duplicate: u64,
    /// Drops: hop ceiling reached.
    pub dropped_hop_limit: u64,
    /// Drops: sender rate gate.
    pub dropped_spam: u64,
    /// Drops: unroutable and unparkable.
    pub dropped_no_route: u64,
}

impl RelayStats {
    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            relayed: self.relayed.load(Ordering::Relaxed),
            delivered_to_self: self.delivered_to_self.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_hop_limit: self.dropped_hop_limit.load(Ordering::Relaxed),
            dropped_spam: self.dropped_spam.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
        }
    }
}

/// Token bucket, refilled continuously by elapsed time.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn try_consume(&mut self, amount: f64, now: Instant) -> bool {
        let elapsed = now
            .checked_duration_since(self.last_refill)
            .unwrap_or_default();
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);
        self.last_refill = now;

        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

/// The relay engine.
pub struct RelayEngine {
    local: ChatId,
    seen: Arc<SeenStore>,
    stats: RelayStats,
    buckets: DashMap<ChatId, TokenBucket>,
    max_hops: u8,
    relay_ttl_secs: u64,
    rate_per_minute: u32,
}

impl RelayEngine {
    /// Create an engine for the local chat identity.
    #[must_use]
    pub fn new(
        local: ChatId,
        seen: Arc<SeenStore>,
        max_hops: u8,
        relay_ttl_secs: u64,
        rate_per_minute: u32,
    ) -> Self {
        Self {
            local,
            seen,
            stats: RelayStats::default(),
            buckets: DashMap::new(),
            max_hops,
            relay_ttl_secs,
            rate_per_minute,
        }
    }

    /// Wrap a locally originated end-to-end ciphertext with relay
    /// metadata. The message id is content-addressed:
    /// `SHA-256(timestamp || sender || content)` truncated to 16 bytes.
    #[must_use]
    pub fn wrap_outbound(
        &self,
        payload: Vec<u8>,
        final_recipient: ChatId,
        now: SystemTime,
    ) -> RelayEnvelope {
        let timestamp_ms = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64);
        let original_message_id = MessageId::for_content(timestamp_ms, &self.local, &payload);
        RelayEnvelope {
            metadata: RelayMetadata {
                original_message_id,
                original_sender: self.local,
                final_recipient,
                hop_count: 0,
                max_hops: self.max_hops,
                timestamp_ms,
                ttl_secs: self.relay_ttl_secs,
            },
            end_to_end: false,
            payload,
        }
    }

    /// Classify a decrypted inbound envelope.
    ///
    /// `inbound_peer` is excluded from forwarding so a relay never echoes
    /// a message back where it came from; `available` are the peers with
    /// ready sessions right now.
    pub fn classify(
        &self,
        envelope: RelayEnvelope,
        inbound_peer: Option<&ChatId>,
        oracle: &RoutingOracle,
        available: &[ChatId],
        now: Instant,
    ) -> RelayDecision {
        let fingerprint = envelope.metadata.original_message_id.fingerprint();

        if envelope.metadata.final_recipient == self.local {
            if self.seen.witness(fingerprint, now) {
                self.stats.delivered_to_self.fetch_add(1, Ordering::Relaxed);
                return RelayDecision::DeliverLocal(envelope);
            }
            self.stats.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
            return RelayDecision::Drop(RelayDrop::Duplicate);
        }

        if !self.seen.witness(fingerprint, now) {
            self.stats.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
            return RelayDecision::Drop(RelayDrop::Duplicate);
        }

        if !envelope.metadata.can_relay() {
            self.stats.dropped_hop_limit.fetch_add(1, Ordering::Relaxed);
            return RelayDecision::Drop(RelayDrop::HopLimit);
        }

        if !self.admit_sender(&envelope.metadata.original_sender, now) {
            self.stats.dropped_spam.fetch_add(1, Ordering::Relaxed);
            return RelayDecision::Drop(RelayDrop::Rate);
        }

        let candidates: Vec<ChatId> = available
            .iter()
            .filter(|peer| Some(*peer) != inbound_peer)
            .copied()
            .collect();

        let recipient = envelope.metadata.final_recipient;
        let mut next_hop = oracle.choose_next_hop(&recipient, &candidates, Priority::Normal);
        if next_hop.is_none() && oracle.is_empty() {
            // No topology observed yet; the oracle is advisory, fall back
            // to any available peer other than the inbound one.
            next_hop = candidates.first().copied();
        }

        match next_hop {
            Some(peer) => {
                self.stats.relayed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    id = %envelope.metadata.original_message_id,
                    next_hop = %peer,
                    hop = envelope.metadata.hop_count + 1,
                    "forwarding"
                );
                RelayDecision::Forward {
                    next_hop: peer,
                    envelope: envelope.for_next_hop(),
                }
            }
            None => RelayDecision::Park(envelope),
        }
    }

    /// Count a message that could be neither forwarded nor parked.
    pub fn record_no_route(&self) {
        self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    fn admit_sender(&self, sender: &ChatId, now: Instant) -> bool {
        let mut bucket = self.buckets.entry(*sender).or_insert_with(|| {
            TokenBucket::new(
                f64::from(self.rate_per_minute),
                f64::from(self.rate_per_minute) / 60.0,
                now,
            )
        });
        bucket.try_consume(1.0, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chat(tag: u8) -> ChatId {
        ChatId([tag; 32])
    }

    fn engine(local: u8) -> (RelayEngine, RoutingOracle) {
        let seen = Arc::new(SeenStore::new(1024, Duration::from_secs(300)));
        (
            RelayEngine::new(chat(local), seen, 5, 3600, 30),
            RoutingOracle::new(chat(local)),
        )
    }

    fn envelope(sender: u8, recipient: u8, hop: u8, body: &[u8]) -> RelayEnvelope {
        RelayEnvelope {
            metadata: RelayMetadata {
                original_message_id: MessageId::for_content(1000, &chat(sender), body),
                original_sender: chat(sender),
                final_recipient: chat(recipient),
                hop_count: hop,
                max_hops: 5,
                timestamp_ms: 1000,
                ttl_secs: 3600,
            },
            end_to_end: true,
            payload: body.to_vec(),
        }
    }

    #[test]
    fn test_wrap_outbound_shape() {
        let (engine, _) = engine(1);
        let now = SystemTime::UNIX_EPOCH + Duration::from_millis(5000);
        let envelope = engine.wrap_outbound(b"ciphertext".to_vec(), chat(9), now);
        assert_eq!(envelope.metadata.hop_count, 0);
        assert_eq!(envelope.metadata.max_hops, 5);
        assert_eq!(envelope.metadata.original_sender, chat(1));
        assert_eq!(envelope.metadata.final_recipient, chat(9));
        assert_eq!(envelope.metadata.ttl_secs, 3600);
        assert_eq!(
            envelope.metadata.original_message_id,
            MessageId::for_content(5000, &chat(1), b"ciphertext")
        );
    }

    #[test]
    fn test_deliver_local_once() {
        let (engine, oracle) = engine(2);
        let now = Instant::now();

        let first = engine.classify(envelope(1, 2, 1, b"msg"), Some(&chat(1)), &oracle, &[], now);
        assert!(matches!(first, RelayDecision::DeliverLocal(_)));

        let again = engine.classify(envelope(1, 2, 1, b"msg"), Some(&chat(1)), &oracle, &[], now);
        assert!(matches!(again, RelayDecision::Drop(RelayDrop::Duplicate)));

        let stats = engine.stats();
        assert_eq!(stats.delivered_to_self, 1);
        assert_eq!(stats.dropped_duplicate, 1);
    }

    #[test]
    fn test_forward_increments_hop_and_dedupes() {
        let (engine, oracle) = engine(2);
        let now = Instant::now();

        // B forwards A -> C directly when C is available.
        let decision = engine.classify(
            envelope(1, 3, 0, b"hop"),
            Some(&chat(1)),
            &oracle,
            &[chat(3)],
            now,
        );
        match decision {
            RelayDecision::Forward { next_hop, envelope } => {
                assert_eq!(next_hop, chat(3));
                assert_eq!(envelope.metadata.hop_count, 1);
            }
            other => panic!("expected forward, got {other:?}"),
        }

        // Same message within the window drops.
        let again = engine.classify(
            envelope(1, 3, 0, b"hop"),
            Some(&chat(1)),
            &oracle,
            &[chat(3)],
            now + Duration::from_secs(1),
        );
        assert!(matches!(again, RelayDecision::Drop(RelayDrop::Duplicate)));

        let stats = engine.stats();
        assert_eq!(stats.relayed, 1);
        assert_eq!(stats.dropped_duplicate, 1);
    }

    #[test]
    fn test_hop_limit_drop() {
        let (engine, oracle) = engine(2);
        let decision = engine.classify(
            envelope(1, 3, 5, b"too far"),
            Some(&chat(1)),
            &oracle,
            &[chat(3)],
            Instant::now(),
        );
        assert!(matches!(decision, RelayDecision::Drop(RelayDrop::HopLimit)));
        assert_eq!(engine.stats().dropped_hop_limit, 1);
    }

    #[test]
    fn test_never_echo_to_inbound_peer() {
        let (engine, oracle) = engine(2);
        // Only the inbound peer is available: nothing to forward to.
        let decision = engine.classify(
            envelope(1, 3, 0, b"echo"),
            Some(&chat(1)),
            &oracle,
            &[chat(1)],
            Instant::now(),
        );
        assert!(matches!(decision, RelayDecision::Park(_)));
    }

    #[test]
    fn test_rate_gate_per_original_sender() {
        let (engine, oracle) = engine(2);
        let now = Instant::now();

        for sequence in 0..30u32 {
            let decision = engine.classify(
                envelope(1, 3, 0, &sequence.to_le_bytes()),
                Some(&chat(1)),
                &oracle,
                &[chat(3)],
                now,
            );
            assert!(matches!(decision, RelayDecision::Forward { .. }));
        }
        // The 31st within the same instant is refused.
        let decision = engine.classify(
            envelope(1, 3, 0, b"over the line"),
            Some(&chat(1)),
            &oracle,
            &[chat(3)],
            now,
        );
        assert!(matches!(decision, RelayDecision::Drop(RelayDrop::Rate)));
        assert_eq!(engine.stats().dropped_spam, 1);

        // A different original sender is unaffected.
        let decision = engine.classify(
            envelope(7, 3, 0, b"fresh sender"),
            Some(&chat(7)),
            &oracle,
            &[chat(3)],
            now,
        );
        assert!(matches!(decision, RelayDecision::Forward { .. }));
    }

    #[test]
    fn test_rate_gate_refills_over_time() {
        let (engine, oracle) = engine(2);
        let now = Instant::now();
        for sequence in 0..30u32 {
            engine.classify(
                envelope(1, 3, 0, &sequence.to_le_bytes()),
                Some(&chat(1)),
                &oracle,
                &[chat(3)],
                now,
            );
        }
        // Two seconds refills one token at 30/min.
        let decision = engine.classify(
            envelope(1, 3, 0, b"after refill"),
            Some(&chat(1)),
            &oracle,
            &[chat(3)],
            now + Duration::from_secs(2),
        );
        assert!(matches!(decision, RelayDecision::Forward { .. }));
    }

    #[test]
    fn test_park_when_no_route() {
        let (engine, oracle) = engine(2);
        let decision = engine.classify(
            envelope(1, 3, 0, b"park me"),
            Some(&chat(1)),
            &oracle,
            &[],
            Instant::now(),
        );
        assert!(matches!(decision, RelayDecision::Park(_)));

        engine.record_no_route();
        assert_eq!(engine.stats().dropped_no_route, 1);
    }

    #[test]
    fn test_envelope_codec_roundtrip() {
        let envelope = envelope(1, 3, 2, b"bytes");
        let encoded = envelope.to_bytes().unwrap();
        assert_eq!(RelayEnvelope::from_bytes(&encoded).unwrap(), envelope);
        assert!(RelayEnvelope::from_bytes(&encoded[..4]).is_err());
    }
}
