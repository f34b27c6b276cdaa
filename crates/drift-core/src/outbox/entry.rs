//! Outbox entry model.

use crate::identity::ChatId;
use drift_crypto::primitives::sha256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Content-addressed message identifier: the first 16 bytes of
/// `SHA-256(timestamp || sender || content)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// Derive the id for a message.
    #[must_use]
    pub fn for_content(timestamp_ms: u64, sender: &ChatId, content: &[u8]) -> Self {
        let mut preimage = Vec::with_capacity(8 + 32 + content.len());
        preimage.extend_from_slice(&timestamp_ms.to_le_bytes());
        preimage.extend_from_slice(&sender.0);
        preimage.extend_from_slice(content);
        let digest = sha256(&preimage);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    /// Raw id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 64-bit fingerprint used by the seen-store and the sync filter.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        u64::from_le_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7],
        ])
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Send priority. Order matters: later variants outrank earlier ones.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Priority {
    /// Background traffic.
    Low,
    /// Ordinary messages.
    #[default]
    Normal,
    /// Time-sensitive messages.
    High,
    /// Must-deliver messages; ignores the routing quality floor.
    Urgent,
}

impl Priority {
    /// Time-to-live granted at enqueue.
    #[must_use]
    pub fn time_to_live(self) -> Duration {
        match self {
            Priority::Urgent => Duration::from_secs(24 * 3600),
            Priority::High => Duration::from_secs(12 * 3600),
            Priority::Normal => Duration::from_secs(6 * 3600),
            Priority::Low => Duration::from_secs(3 * 3600),
        }
    }

    /// Retry budget adjustment relative to the base.
    #[must_use]
    pub fn retry_bonus(self) -> i32 {
        match self {
            Priority::Urgent => 2,
            Priority::High => 1,
            Priority::Normal => 0,
            Priority::Low => -1,
        }
    }
}

/// Entry lifecycle. `Delivered` and `Expired` are terminal: no later
/// mutation leaves them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Queued, not yet attempted.
    Pending,
    /// Handed to a link right now.
    Sending,
    /// Sent, waiting for the custody acknowledgment.
    AwaitingAck,
    /// Acknowledged. Terminal.
    Delivered,
    /// Retry budget exhausted; may be reset by `retry_failed`.
    Failed,
    /// Scheduled for another attempt.
    Retrying,
    /// Time-to-live elapsed. Terminal.
    Expired,
}

impl Status {
    /// Whether the status permits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Delivered | Status::Expired)
    }
}

/// Routing header attached to a message for multi-hop forwarding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetadata {
    /// Content-addressed id assigned by the original sender.
    pub original_message_id: MessageId,
    /// Chat identity of the original sender.
    pub original_sender: ChatId,
    /// Chat identity of the final recipient.
    pub final_recipient: ChatId,
    /// Hops taken so far; strictly increases at each emission.
    pub hop_count: u8,
    /// Hop ceiling; an entry at the ceiling is never relayed.
    pub max_hops: u8,
    /// Origination time, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Time-to-live in seconds from `timestamp_ms`.
    pub ttl_secs: u64,
}

impl RelayMetadata {
    /// Absolute expiry implied by the metadata.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH
            + Duration::from_millis(self.timestamp_ms)
            + Duration::from_secs(self.ttl_secs)
    }

    /// Whether another hop is allowed.
    #[must_use]
    pub fn can_relay(&self) -> bool {
        self.hop_count < self.max_hops
    }
}

/// Message body held by an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// End-to-end ciphertext, ready to forward.
    Ciphertext(Vec<u8>),
    /// Plaintext deferred until a session with the recipient exists.
    Deferred(Vec<u8>),
}

impl MessageBody {
    /// The carried bytes, whichever form they are in.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            MessageBody::Ciphertext(bytes) | MessageBody::Deferred(bytes) => bytes,
        }
    }

    /// Whether the body still awaits encryption.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, MessageBody::Deferred(_))
    }
}

/// One queued message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Content-addressed identifier.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub chat_id: ChatId,
    /// Recipient chat identity.
    pub recipient: ChatId,
    /// Sender chat identity.
    pub sender: ChatId,
    /// Ciphertext, or deferred plaintext.
    pub body: MessageBody,
    /// Send priority.
    pub priority: Priority,
    /// Lifecycle status.
    pub status: Status,
    /// Attempts made so far.
    pub attempts: u32,
    /// Retry ceiling for this entry.
    pub max_retries: u32,
    /// Earliest next attempt, when backing off.
    pub next_retry_at: Option<SystemTime>,
    /// When the last attempt started.
    pub last_attempt_at: Option<SystemTime>,
    /// Enqueue time; ties within a priority dequeue oldest first.
    pub queued_at: SystemTime,
    /// Hard expiry; supersedes remaining retries.
    pub expires_at: SystemTime,
    /// Relay header for multi-hop traffic.
    pub relay: Option<RelayMetadata>,
    /// Full content hash.
    pub content_hash: [u8; 32],
}

impl OutboxEntry {
    /// Whether the entry's time-to-live elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// Whether the entry may be handed to a link at `now`: pending or
    /// retrying, past its backoff, not expired, and past the clock-jitter
    /// guard since the previous attempt.
    #[must_use]
    pub fn is_ready(&self, now: SystemTime, retry_floor: Duration) -> bool {
        if !matches!(self.status, Status::Pending | Status::Retrying) {
            return false;
        }
        if self.is_expired(now) {
            return false;
        }
        if let Some(at) = self.next_retry_at {
            if now < at {
                return false;
            }
        }
        if let Some(last) = self.last_attempt_at {
            if now < last + retry_floor {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_content_addressed() {
        let sender = ChatId([1; 32]);
        let id_a = MessageId::for_content(1000, &sender, b"hello");
        let id_b = MessageId::for_content(1000, &sender, b"hello");
        assert_eq!(id_a, id_b);

        assert_ne!(id_a, MessageId::for_content(1001, &sender, b"hello"));
        assert_ne!(id_a, MessageId::for_content(1000, &sender, b"other"));
        assert_ne!(
            id_a,
            MessageId::for_content(1000, &ChatId([2; 32]), b"hello")
        );
    }

    #[test]
    fn test_fingerprint_uses_leading_bytes() {
        let id = MessageId([1, 0, 0, 0, 0, 0, 0, 0, 9, 9, 9, 9, 9, 9, 9, 9]);
        assert_eq!(id.fingerprint(), 1);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_ttl_table() {
        assert_eq!(
            Priority::Urgent.time_to_live(),
            Duration::from_secs(86_400)
        );
        assert_eq!(Priority::High.time_to_live(), Duration::from_secs(43_200));
        assert_eq!(
            Priority::Normal.time_to_live(),
            Duration::from_secs(21_600)
        );
        assert_eq!(Priority::Low.time_to_live(), Duration::from_secs(10_800));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Delivered.is_terminal());
        assert!(Status::Expired.is_terminal());
        for status in [
            Status::Pending,
            Status::Sending,
            Status::AwaitingAck,
            Status::Failed,
            Status::Retrying,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_relay_metadata_expiry() {
        let metadata = RelayMetadata {
            original_message_id: MessageId([0; 16]),
            original_sender: ChatId([1; 32]),
            final_recipient: ChatId([2; 32]),
            hop_count: 0,
            max_hops: 5,
            timestamp_ms: 1_000_000,
            ttl_secs: 3600,
        };
        let expected = SystemTime::UNIX_EPOCH + Duration::from_millis(1_000_000 + 3_600_000);
        assert_eq!(metadata.expires_at(), expected);
        assert!(metadata.can_relay());
    }
}
