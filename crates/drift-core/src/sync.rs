//! Queue synchronization between neighbors.
//!
//! When two peers connect, each summarizes its outbox membership as a
//! Golomb-coded set and the sides reconcile: request (hash + filter),
//! offer (ids the peer's filter does not cover), want (ids actually
//! missing), push (the ciphertexts). Pushes carry ciphertexts, not
//! plaintext: they are content-addressed and require no further trust.
//!
//! Filter parameters follow the target false-positive rate:
//! `P = ceil(log2(1 / fpr))`, each id hashed to 64 bits modulo
//! `m = n * 2^P`, sorted values delta-encoded as a unary quotient plus a
//! P-bit remainder.

use crate::error::SyncError;
use crate::identity::ChatId;
use crate::outbox::{Draft, MessageBody, MessageId, Outbox, Priority, RelayMetadata};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Derive the Golomb-Rice parameter from a target false-positive rate.
#[must_use]
pub fn derive_p(fpr: f64) -> u8 {
    let p = (1.0 / fpr.clamp(1e-9, 0.5)).log2().ceil();
    (p as u8).clamp(1, 32)
}

/// A serialized Golomb-coded set over message-id fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcsFilter {
    /// Golomb-Rice parameter (remainder bits).
    pub p: u8,
    /// Number of encoded members.
    pub n: u64,
    /// Members dropped to satisfy the envelope size cap.
    pub trimmed: u64,
    /// Delta-encoded member stream.
    pub bits: Vec<u8>,
}

impl GcsFilter {
    /// Build a filter over the given ids, trimming membership to keep the
    /// serialized stream within `max_bytes`.
    #[must_use]
    pub fn build(ids: &[MessageId], fpr: f64, max_bytes: usize) -> Self {
        let p = derive_p(fpr);
        let mut keep = ids.len();
        loop {
            let filter = Self::encode(&ids[..keep], p, (ids.len() - keep) as u64);
            if filter.bits.len() <= max_bytes || keep == 0 {
                if filter.trimmed > 0 {
                    tracing::debug!(
                        kept = keep,
                        trimmed = filter.trimmed,
                        "sync filter trimmed to envelope cap"
                    );
                }
                return filter;
            }
            // Shrink proportionally, always making progress.
            let next = keep * max_bytes / filter.bits.len();
            keep = next.min(keep - 1);
        }
    }

    fn encode(ids: &[MessageId], p: u8, trimmed: u64) -> Self {
        let n = ids.len() as u64;
        if n == 0 {
            return Self {
                p,
                n: 0,
                trimmed,
                bits: Vec::new(),
            };
        }
        let m = n << p;
        let mut values: Vec<u64> = ids.iter().map(|id| id.fingerprint() % m).collect();
        values.sort_unstable();
        values.dedup();

        let mut writer = BitWriter::new();
        let mut previous = 0u64;
        for value in &values {
            let delta = value - previous;
            writer.write_unary(delta >> p);
            writer.write_bits(delta & ((1u64 << p) - 1), p);
            previous = *value;
        }
        Self {
            p,
            n,
            trimmed,
            bits: writer.finish(),
        }
    }

    /// Membership test. Every encoded id answers `true`; non-members
    /// answer `true` with probability about `2^-p`.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        if self.n == 0 {
            return false;
        }
        let m = self.n << self.p;
        let target = id.fingerprint() % m;

        let mut reader = BitReader::new(&self.bits);
        let mut cumulative = 0u64;
        loop {
            let Some(quotient) = reader.read_unary() else {
                return false;
            };
            let Some(remainder) = reader.read_bits(self.p) else {
                return false;
            };
            cumulative += (quotient << self.p) | remainder;
            if cumulative == target {
                return true;
            }
            if cumulative > target {
                return false;
            }
        }
    }

    /// Serialized size of the member stream.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }
}

struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit: 0,
        }
    }

    fn write_bit(&mut self, set: bool) {
        if self.bit == 0 {
            self.bytes.push(0);
        }
        if set {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> self.bit;
        }
        self.bit = (self.bit + 1) % 8;
    }

    fn write_unary(&mut self, quotient: u64) {
        for _ in 0..quotient {
            self.write_bit(true);
        }
        self.write_bit(false);
    }

    fn write_bits(&mut self, value: u64, count: u8) {
        for shift in (0..count).rev() {
            self.write_bit((value >> shift) & 1 == 1);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let byte = self.bytes.get(self.position / 8)?;
        let set = (byte >> (7 - (self.position % 8))) & 1 == 1;
        self.position += 1;
        Some(set)
    }

    fn read_unary(&mut self) -> Option<u64> {
        let mut count = 0u64;
        loop {
            match self.read_bit()? {
                true => count += 1,
                false => return Some(count),
            }
        }
    }

    fn read_bits(&mut self, count: u8) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Some(value)
    }
}

/// One message streamed during reconciliation: the parked ciphertext with
/// just enough metadata to re-enqueue it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Content-addressed id.
    pub id: MessageId,
    /// Relay header of the original message.
    pub relay: RelayMetadata,
    /// End-to-end ciphertext.
    pub ciphertext: Vec<u8>,
    /// Queue priority at the sender.
    pub priority: Priority,
}

/// Reconciliation exchange messages (wire type 0x05).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueSyncMessage {
    /// Opening message: full-queue hash plus membership filter.
    Request {
        /// Sender's chat identity.
        node_id: ChatId,
        /// `SHA-256(sorted(active) || sorted(deleted))`.
        queue_hash: [u8; 32],
        /// Membership filter over the active ids.
        filter: GcsFilter,
    },
    /// Ids the sender holds that the peer's filter does not cover.
    Offer {
        /// Sender's chat identity.
        node_id: ChatId,
        /// Candidate ids to push.
        offered: Vec<MessageId>,
    },
    /// Ids the sender actually lacks out of an offer.
    Want {
        /// Sender's chat identity.
        node_id: ChatId,
        /// Requested ids.
        wanted: Vec<MessageId>,
    },
    /// The requested messages.
    Push {
        /// Sender's chat identity.
        node_id: ChatId,
        /// Streamed entries.
        messages: Vec<SyncEnvelope>,
    },
}

impl QueueSyncMessage {
    /// Wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Malformed`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serialize(self).map_err(|error| SyncError::Malformed(error.to_string()))
    }

    /// Parse the wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Malformed`] on undecodable input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        bincode::deserialize(bytes).map_err(|error| SyncError::Malformed(error.to_string()))
    }
}

/// The per-node reconciliation driver.
pub struct QueueSync {
    local: ChatId,
    fpr: f64,
    envelope_bytes: usize,
}

impl QueueSync {
    /// Create a driver for the local node.
    #[must_use]
    pub fn new(local: ChatId, fpr: f64, envelope_bytes: usize) -> Self {
        Self {
            local,
            fpr,
            envelope_bytes,
        }
    }

    /// Build the opening request for a freshly connected peer.
    #[must_use]
    pub fn request(&self, outbox: &Outbox) -> QueueSyncMessage {
        let active = outbox.active_ids();
        QueueSyncMessage::Request {
            node_id: self.local,
            queue_hash: outbox.queue_hash(),
            filter: GcsFilter::build(&active, self.fpr, self.envelope_bytes),
        }
    }

    /// Process one inbound sync message, returning the reply to send, if
    /// any.
    ///
    /// # Errors
    ///
    /// This method itself does not fail; the `Result` mirrors the wire
    /// codec callers chain it with.
    pub fn handle(
        &self,
        message: QueueSyncMessage,
        outbox: &Outbox,
        now: SystemTime,
    ) -> Result<Option<QueueSyncMessage>, SyncError> {
        match message {
            QueueSyncMessage::Request {
                node_id,
                queue_hash,
                filter,
            } => {
                if queue_hash == outbox.queue_hash() {
                    tracing::debug!(peer = %node_id, "queues identical, sync short-circuited");
                    return Ok(None);
                }
                let offered: Vec<MessageId> = outbox
                    .active_ids()
                    .into_iter()
                    .filter(|id| !filter.contains(id))
                    .collect();
                if offered.is_empty() {
                    return Ok(None);
                }
                Ok(Some(QueueSyncMessage::Offer {
                    node_id: self.local,
                    offered,
                }))
            }
            QueueSyncMessage::Offer { offered, .. } => {
                let wanted: Vec<MessageId> = offered
                    .into_iter()
                    .filter(|id| !outbox.contains(id) && !outbox.is_tombstoned(id))
                    .collect();
                if wanted.is_empty() {
                    return Ok(None);
                }
                Ok(Some(QueueSyncMessage::Want {
                    node_id: self.local,
                    wanted,
                }))
            }
            QueueSyncMessage::Want { wanted, .. } => {
                let messages: Vec<SyncEnvelope> = wanted
                    .iter()
                    .filter_map(|id| outbox.get(id))
                    .filter(|entry| !entry.status.is_terminal())
                    .filter_map(|entry| {
                        let relay = entry.relay?;
                        match entry.body {
                            MessageBody::Ciphertext(ciphertext) => Some(SyncEnvelope {
                                id: entry.id,
                                relay,
                                ciphertext,
                                priority: entry.priority,
                            }),
                            // Deferred plaintext never leaves the node.
                            MessageBody::Deferred(_) => None,
                        }
                    })
                    .collect();
                if messages.is_empty() {
                    return Ok(None);
                }
                Ok(Some(QueueSyncMessage::Push {
                    node_id: self.local,
                    messages,
                }))
            }
            QueueSyncMessage::Push { node_id, messages } => {
                for envelope in messages {
                    if outbox.contains(&envelope.id) || outbox.is_tombstoned(&envelope.id) {
                        continue;
                    }
                    if envelope.relay.final_recipient == self.local {
                        // Addressed to us; the relay path delivers it, the
                        // outbox never holds our own inbound traffic.
                        continue;
                    }
                    let draft = Draft {
                        chat_id: envelope.relay.original_sender,
                        recipient: envelope.relay.final_recipient,
                        sender: envelope.relay.original_sender,
                        body: MessageBody::Ciphertext(envelope.ciphertext),
                        priority: envelope.priority,
                        relay: Some(envelope.relay),
                        id: Some(envelope.id),
                    };
                    if let Err(error) = outbox.enqueue(draft, now) {
                        tracing::warn!(peer = %node_id, %error, "sync push not accepted");
                    }
                }
                Ok(None)
            }
        }
    }
}
