//! Durable priority outbox.
//!
//! The outbox is the offline-first heart of the engine: every send lands
//! here first and leaves only on delivery acknowledgment or expiry.
//! Entries carry a priority that sets their time-to-live and retry budget,
//! a content-addressed id, and optional relay metadata for multi-hop
//! traffic parked at an intermediate node.
//!
//! Durability contract: enqueue and every terminal transition are persisted
//! synchronously through the KV store's atomic transactions. Intermediate
//! `sending`/`awaiting-ack` states are not persisted; on startup they are
//! recovered as `pending`.

pub mod entry;

pub use entry::{MessageBody, MessageId, OutboxEntry, Priority, RelayMetadata, Status};

use crate::error::{OutboxError, StoreError};
use crate::identity::ChatId;
use crate::store::KvStore;
use drift_crypto::primitives::sha256;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

const ENTRY_PREFIX: &[u8] = b"outbox/";
const TOMBSTONE_KEY: &[u8] = b"meta/tombstones";
const SCHEMA_KEY: &[u8] = b"meta/schema";
const SCHEMA_VERSION: u32 = 1;

/// Side-channel notifications for the host (UI, notifications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxEvent {
    /// The entry was acknowledged by the next hop.
    Delivered(MessageId),
    /// The entry exhausted its retry budget.
    Failed {
        /// Entry id.
        id: MessageId,
        /// Last failure reason.
        reason: String,
    },
    /// The entry's time-to-live elapsed.
    Expired(MessageId),
}

/// Monotonic outbox counters.
#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    /// Entries accepted since startup.
    pub enqueued: u64,
    /// Entries acknowledged since startup.
    pub delivered: u64,
    /// Entries that exhausted their retries.
    pub failed: u64,
    /// Entries that timed out.
    pub expired: u64,
    /// Entries evicted by the capacity bound.
    pub evicted: u64,
    /// Entries currently held, terminal included.
    pub held: usize,
}

/// Parameters fixed at open time.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Hard entry ceiling.
    pub capacity: usize,
    /// Base retry budget before the priority bonus.
    pub base_retries: u32,
    /// First backoff step.
    pub retry_initial: Duration,
    /// Backoff ceiling.
    pub retry_max: Duration,
    /// Minimum gap between attempts.
    pub retry_floor: Duration,
    /// Deleted-id tombstones retained.
    pub tombstone_capacity: usize,
}

impl From<&crate::config::Config> for OutboxConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            capacity: config.outbox_capacity,
            base_retries: config.base_retries,
            retry_initial: config.retry_initial,
            retry_max: config.retry_max,
            retry_floor: config.retry_floor,
            tombstone_capacity: config.tombstone_capacity,
        }
    }
}

/// A message handed to `enqueue`.
#[derive(Debug, Clone)]
pub struct Draft {
    /// Conversation id.
    pub chat_id: ChatId,
    /// Recipient chat identity.
    pub recipient: ChatId,
    /// Sender chat identity.
    pub sender: ChatId,
    /// Ciphertext, or plaintext to defer.
    pub body: MessageBody,
    /// Send priority.
    pub priority: Priority,
    /// Relay header, present for multi-hop traffic.
    pub relay: Option<RelayMetadata>,
    /// Pre-assigned id; derived from content when absent.
    pub id: Option<MessageId>,
}

struct Inner {
    entries: HashMap<MessageId, OutboxEntry>,
    tombstones: VecDeque<MessageId>,
    tombstone_set: HashSet<MessageId>,
}

/// The durable priority queue.
pub struct Outbox {
    store: Arc<dyn KvStore>,
    inner: Mutex<Inner>,
    config: OutboxConfig,
    events: mpsc::UnboundedSender<OutboxEvent>,
    counters: Counters,
}

impl Outbox {
    /// Open the outbox over a store, recovering persisted entries.
    ///
    /// Entries found in `sending` or `awaiting-ack` are demoted to
    /// `pending`. Returns the outbox and the receiver of its side-channel
    /// events.
    ///
    /// # Errors
    ///
    /// Refuses to open on a newer schema version or a store failure; the
    /// engine treats that as system-fatal.
    pub fn open(
        store: Arc<dyn KvStore>,
        config: OutboxConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OutboxEvent>), OutboxError> {
        let mut entries = HashMap::new();
        let mut tombstones = VecDeque::new();

        {
            let mut tx = store.begin()?;
            match tx.get(SCHEMA_KEY)? {
                Some(raw) => {
                    let found = decode_schema(&raw)?;
                    if found > SCHEMA_VERSION {
                        return Err(StoreError::SchemaVersion { found }.into());
                    }
                }
                None => {
                    tx.put(SCHEMA_KEY, &SCHEMA_VERSION.to_le_bytes())?;
                }
            }

            for (key, value) in tx.scan_prefix(ENTRY_PREFIX)? {
                match bincode::deserialize::<OutboxEntry>(&value) {
                    Ok(mut entry) => {
                        if matches!(entry.status, Status::Sending | Status::AwaitingAck) {
                            entry.status = Status::Pending;
                            tx.put(&key, &encode_entry(&entry)?)?;
                        }
                        entries.insert(entry.id, entry);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "dropping undecodable outbox entry");
                        tx.delete(&key)?;
                    }
                }
            }

            if let Some(raw) = tx.get(TOMBSTONE_KEY)? {
                match bincode::deserialize::<Vec<MessageId>>(&raw) {
                    Ok(ids) => tombstones.extend(ids),
                    Err(error) => tracing::warn!(%error, "dropping undecodable tombstones"),
                }
            }
            tx.commit()?;
        }

        tracing::info!(
            entries = entries.len(),
            tombstones = tombstones.len(),
            "outbox opened"
        );

        let tombstone_set = tombstones.iter().copied().collect();
        let (events, receiver) = mpsc::unbounded_channel();
        Ok((
            Self {
                store,
                inner: Mutex::new(Inner {
                    entries,
                    tombstones,
                    tombstone_set,
                }),
                config,
                events,
                counters: Counters::default(),
            },
            receiver,
        ))
    }

    /// Accept a message. Assigns the content-addressed id when the draft
    /// carries none, grants the priority's time-to-live and retry budget,
    /// and persists synchronously.
    ///
    /// Enqueueing an id that is already held (any status) is a no-op that
    /// returns the existing id.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::Full`] when at capacity and nothing of equal or
    ///   lower priority can be evicted.
    /// - [`OutboxError::Persist`] when the store rejects the write.
    pub fn enqueue(&self, draft: Draft, now: SystemTime) -> Result<MessageId, OutboxError> {
        let timestamp_ms = millis_since_epoch(now);
        let id = draft
            .id
            .or(draft.relay.as_ref().map(|relay| relay.original_message_id))
            .unwrap_or_else(|| {
                MessageId::for_content(timestamp_ms, &draft.sender, draft.body.bytes())
            });

        let mut inner = self.lock();
        if inner.entries.contains_key(&id) {
            return Ok(id);
        }

        let mut evicted = None;
        if inner.entries.len() >= self.config.capacity {
            let victim = pick_eviction_victim(&inner.entries, draft.priority)
                .ok_or(OutboxError::Full)?;
            evicted = inner.entries.remove(&victim);
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = %victim, "evicted outbox entry at capacity");
        }

        let mut expires_at = now + draft.priority.time_to_live();
        if let Some(relay) = &draft.relay {
            // Parked foreign traffic also honors the relay header's clock.
            if relay.hop_count > 0 {
                expires_at = expires_at.min(relay.expires_at());
            }
        }

        let max_retries =
            (self.config.base_retries as i32 + draft.priority.retry_bonus()).max(1) as u32;

        let entry = OutboxEntry {
            id,
            chat_id: draft.chat_id,
            recipient: draft.recipient,
            sender: draft.sender,
            content_hash: sha256(draft.body.bytes()),
            body: draft.body,
            priority: draft.priority,
            status: Status::Pending,
            attempts: 0,
            max_retries,
            next_retry_at: None,
            last_attempt_at: None,
            queued_at: now,
            expires_at,
            relay: draft.relay,
        };

        {
            let mut tx = self.store.begin()?;
            if let Some(victim) = &evicted {
                tx.delete(&entry_key(&victim.id))?;
            }
            tx.put(&entry_key(&id), &encode_entry(&entry)?)?;
            tx.commit()?;
        }

        inner.entries.insert(id, entry);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id = %id, "enqueued message");
        Ok(id)
    }

    /// Entries ready to send at `now`, ordered by priority descending then
    /// enqueue time ascending. Expired entries encountered on the way are
    /// transitioned to `expired` (terminal, persisted) and reported on the
    /// side channel.
    pub fn dequeue_ready(&self, now: SystemTime) -> Vec<OutboxEntry> {
        let mut inner = self.lock();
        self.sweep_expired(&mut inner, now);

        let mut ready: Vec<OutboxEntry> = inner
            .entries
            .values()
            .filter(|entry| entry.is_ready(now, self.config.retry_floor))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
        });
        ready
    }

    /// Transition an entry to `sending`. In-memory only.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::UnknownMessage`] for an unknown id and
    /// [`OutboxError::Expired`] for an expired entry.
    pub fn mark_sending(&self, id: &MessageId) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(OutboxError::UnknownMessage)?;
        match entry.status {
            Status::Expired => Err(OutboxError::Expired),
            Status::Delivered => Ok(()),
            _ => {
                entry.status = Status::Sending;
                Ok(())
            }
        }
    }

    /// Transition an entry to `awaiting-ack`. In-memory only.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::UnknownMessage`] for an unknown id and
    /// [`OutboxError::Expired`] for an expired entry.
    pub fn mark_awaiting_ack(&self, id: &MessageId) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(OutboxError::UnknownMessage)?;
        match entry.status {
            Status::Expired => Err(OutboxError::Expired),
            Status::Delivered => Ok(()),
            _ => {
                entry.status = Status::AwaitingAck;
                Ok(())
            }
        }
    }

    /// Record a delivery acknowledgment. Terminal; persisted; idempotent.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::UnknownMessage`] for an unknown id.
    /// - [`OutboxError::Persist`] when the store rejects the write.
    pub fn mark_delivered(&self, id: &MessageId) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(OutboxError::UnknownMessage)?;
        match entry.status {
            Status::Delivered => return Ok(()),
            Status::Expired => return Err(OutboxError::Expired),
            _ => entry.status = Status::Delivered,
        }
        let encoded = encode_entry(entry)?;
        let mut tx = self.store.begin()?;
        tx.put(&entry_key(id), &encoded)?;
        tx.commit()?;

        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(OutboxEvent::Delivered(*id));
        tracing::debug!(id = %id, "message delivered");
        Ok(())
    }

    /// Record a failed attempt. Schedules a retry with exponential backoff
    /// and ±25 % jitter, or transitions to `failed` when the budget is
    /// exhausted, or to `expired` when the time-to-live elapsed (expiry
    /// supersedes retry).
    ///
    /// # Errors
    ///
    /// - [`OutboxError::UnknownMessage`] for an unknown id.
    /// - [`OutboxError::Persist`] when a terminal write fails.
    pub fn mark_failed(
        &self,
        id: &MessageId,
        reason: &str,
        now: SystemTime,
    ) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(OutboxError::UnknownMessage)?;
        if entry.status.is_terminal() {
            return Ok(());
        }

        entry.attempts += 1;
        entry.last_attempt_at = Some(now);

        if entry.is_expired(now) {
            entry.status = Status::Expired;
            let encoded = encode_entry(entry)?;
            let mut tx = self.store.begin()?;
            tx.put(&entry_key(id), &encoded)?;
            tx.commit()?;
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            let _ = self.events.send(OutboxEvent::Expired(*id));
            return Ok(());
        }

        if entry.attempts >= entry.max_retries {
            entry.status = Status::Failed;
            entry.next_retry_at = None;
            let encoded = encode_entry(entry)?;
            let mut tx = self.store.begin()?;
            tx.put(&entry_key(id), &encoded)?;
            tx.commit()?;
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = self.events.send(OutboxEvent::Failed {
                id: *id,
                reason: reason.to_string(),
            });
            tracing::debug!(id = %id, reason, "message failed");
            return Ok(());
        }

        let backoff = backoff_for_attempt(
            entry.attempts,
            self.config.retry_initial,
            self.config.retry_max,
        );
        entry.status = Status::Retrying;
        entry.next_retry_at = Some(now + jittered(backoff, &mut rand::thread_rng()));
        tracing::debug!(
            id = %id,
            attempt = entry.attempts,
            backoff_ms = backoff.as_millis() as u64,
            reason,
            "retry scheduled"
        );
        Ok(())
    }

    /// Reset failed-but-unexpired entries to `pending`, optionally scoped
    /// to one chat.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Persist`] when the store rejects the write.
    pub fn retry_failed(
        &self,
        chat: Option<&ChatId>,
        now: SystemTime,
    ) -> Result<usize, OutboxError> {
        let mut inner = self.lock();
        let mut reset = Vec::new();
        for entry in inner.entries.values_mut() {
            if entry.status != Status::Failed || entry.is_expired(now) {
                continue;
            }
            if let Some(chat) = chat {
                if &entry.chat_id != chat {
                    continue;
                }
            }
            entry.status = Status::Pending;
            entry.attempts = 0;
            entry.next_retry_at = None;
            reset.push(entry.clone());
        }
        if !reset.is_empty() {
            let mut tx = self.store.begin()?;
            for entry in &reset {
                tx.put(&entry_key(&entry.id), &encode_entry(entry)?)?;
            }
            tx.commit()?;
        }
        Ok(reset.len())
    }

    /// Entries to push to a peer that just connected: everything pending
    /// or retrying addressed to it, backoff ignored, ordered by priority
    /// descending then enqueue time ascending.
    pub fn flush_for_peer(&self, recipient: &ChatId, now: SystemTime) -> Vec<OutboxEntry> {
        let mut inner = self.lock();
        self.sweep_expired(&mut inner, now);

        let mut batch: Vec<OutboxEntry> = inner
            .entries
            .values()
            .filter(|entry| {
                &entry.recipient == recipient
                    && matches!(entry.status, Status::Pending | Status::Retrying)
                    && !entry.is_expired(now)
            })
            .cloned()
            .collect();
        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.queued_at.cmp(&b.queued_at))
        });
        batch
    }

    /// Replace a deferred body with its ciphertext once a session exists.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::UnknownMessage`] for an unknown id.
    /// - [`OutboxError::Persist`] when the store rejects the write.
    pub fn attach_ciphertext(
        &self,
        id: &MessageId,
        ciphertext: Vec<u8>,
    ) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or(OutboxError::UnknownMessage)?;
        entry.body = MessageBody::Ciphertext(ciphertext);
        let encoded = encode_entry(entry)?;
        let mut tx = self.store.begin()?;
        tx.put(&entry_key(id), &encoded)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove an entry at the user's request, leaving a tombstone that
    /// suppresses re-propagation through queue sync.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Persist`] when the store rejects the write.
    pub fn delete(&self, id: &MessageId) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        inner.entries.remove(id);
        if inner.tombstone_set.insert(*id) {
            inner.tombstones.push_back(*id);
            while inner.tombstones.len() > self.config.tombstone_capacity {
                if let Some(old) = inner.tombstones.pop_front() {
                    inner.tombstone_set.remove(&old);
                }
            }
        }
        let tombstones: Vec<MessageId> = inner.tombstones.iter().copied().collect();
        let mut tx = self.store.begin()?;
        tx.delete(&entry_key(id))?;
        tx.put(
            TOMBSTONE_KEY,
            &bincode::serialize(&tombstones)
                .map_err(|error| StoreError::Corrupt(error.to_string()))?,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Non-terminal entry ids, the membership set for queue sync.
    pub fn active_ids(&self) -> Vec<MessageId> {
        self.lock()
            .entries
            .values()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.id)
            .collect()
    }

    /// Tombstoned (user-deleted) ids.
    pub fn deleted_ids(&self) -> Vec<MessageId> {
        self.lock().tombstones.iter().copied().collect()
    }

    /// Whether the id was deleted locally.
    pub fn is_tombstoned(&self, id: &MessageId) -> bool {
        self.lock().tombstone_set.contains(id)
    }

    /// Whether the id is held, terminal or not.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Clone of one entry.
    pub fn get(&self, id: &MessageId) -> Option<OutboxEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// `SHA-256(sorted(active-ids) || sorted(deleted-ids))`; lets two
    /// peers short-circuit sync when identical.
    pub fn queue_hash(&self) -> [u8; 32] {
        let inner = self.lock();
        let mut active: Vec<MessageId> = inner
            .entries
            .values()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.id)
            .collect();
        active.sort();
        let mut deleted: Vec<MessageId> = inner.tombstones.iter().copied().collect();
        deleted.sort();

        let mut preimage = Vec::with_capacity((active.len() + deleted.len()) * 16);
        for id in active.iter().chain(deleted.iter()) {
            preimage.extend_from_slice(id.as_bytes());
        }
        sha256(&preimage)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            held: self.lock().entries.len(),
        }
    }

    /// Persist every entry, demoting in-flight states to `pending`. Called
    /// on shutdown and by the outbox worker's cancellation path.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Persist`] when the store rejects the write.
    pub fn persist_all(&self) -> Result<(), OutboxError> {
        let mut inner = self.lock();
        let mut tx = self.store.begin()?;
        for entry in inner.entries.values_mut() {
            if matches!(entry.status, Status::Sending | Status::AwaitingAck) {
                entry.status = Status::Pending;
            }
            tx.put(&entry_key(&entry.id), &encode_entry(entry)?)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn sweep_expired(&self, inner: &mut MutexGuard<'_, Inner>, now: SystemTime) {
        let expired: Vec<MessageId> = inner
            .entries
            .values()
            .filter(|entry| !entry.status.is_terminal() && entry.is_expired(now))
            .map(|entry| entry.id)
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut tx = match self.store.begin() {
            Ok(tx) => tx,
            Err(error) => {
                tracing::warn!(%error, "expiry sweep could not open a transaction");
                return;
            }
        };
        for id in &expired {
            if let Some(entry) = inner.entries.get_mut(id) {
                entry.status = Status::Expired;
                match encode_entry(entry) {
                    Ok(encoded) => {
                        if let Err(error) = tx.put(&entry_key(id), &encoded) {
                            tracing::warn!(%error, id = %id, "expiry persist failed");
                        }
                    }
                    Err(error) => tracing::warn!(%error, id = %id, "expiry encode failed"),
                }
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.send(OutboxEvent::Expired(*id));
            }
        }
        if let Err(error) = tx.commit() {
            tracing::warn!(%error, "expiry sweep commit failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Exponential backoff without jitter:
/// `min(max, initial * 2^(attempt - 1))`.
#[must_use]
pub fn backoff_for_attempt(attempt: u32, initial: Duration, max: Duration) -> Duration {
    if attempt <= 1 {
        return initial.min(max);
    }
    let shift = (attempt - 1).min(31);
    initial
        .checked_mul(1u32 << shift)
        .map_or(max, |backoff| backoff.min(max))
}

/// Apply ±25 % uniform jitter.
fn jittered<R: Rng>(base: Duration, rng: &mut R) -> Duration {
    base.mul_f64(rng.gen_range(0.75..=1.25))
}

fn pick_eviction_victim(
    entries: &HashMap<MessageId, OutboxEntry>,
    incoming: Priority,
) -> Option<MessageId> {
    // Terminal entries are spent; reclaim those first, oldest first.
    if let Some(entry) = entries
        .values()
        .filter(|entry| entry.status.is_terminal())
        .min_by_key(|entry| entry.queued_at)
    {
        return Some(entry.id);
    }
    // Otherwise the oldest entry of the lowest priority, but never one
    // that outranks the incoming message.
    entries
        .values()
        .filter(|entry| entry.priority <= incoming)
        .min_by_key(|entry| (entry.priority, entry.queued_at))
        .map(|entry| entry.id)
}

fn entry_key(id: &MessageId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ENTRY_PREFIX.len() + 16);
    key.extend_from_slice(ENTRY_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

fn encode_entry(entry: &OutboxEntry) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(entry).map_err(|error| StoreError::Corrupt(error.to_string()))
}

fn decode_schema(raw: &[u8]) -> Result<u32, StoreError> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| StoreError::Corrupt("schema version".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

fn millis_since_epoch(now: SystemTime) -> u64 {
    now.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn open_outbox() -> (Outbox, mpsc::UnboundedReceiver<OutboxEvent>) {
        let store = Arc::new(MemoryStore::new());
        Outbox::open(store, test_config()).unwrap()
    }

    fn test_config() -> OutboxConfig {
        OutboxConfig {
            capacity: 8,
            base_retries: 3,
            retry_initial: Duration::from_secs(2),
            retry_max: Duration::from_secs(600),
            retry_floor: Duration::from_secs(5),
            tombstone_capacity: 4,
        }
    }

    fn draft(priority: Priority, tag: u8) -> Draft {
        Draft {
            chat_id: ChatId([0xC0; 32]),
            recipient: ChatId([0xB0; 32]),
            sender: ChatId([0xA0; 32]),
            body: MessageBody::Ciphertext(vec![tag; 32]),
            priority,
            relay: None,
            id: None,
        }
    }

    fn epoch(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_enqueue_assigns_ttl_and_retries_from_priority() {
        let (outbox, _events) = open_outbox();
        let now = epoch(1_000_000);

        let id = outbox.enqueue(draft(Priority::Urgent, 1), now).unwrap();
        let entry = outbox.get(&id).unwrap();
        assert_eq!(entry.expires_at, now + Duration::from_secs(24 * 3600));
        assert_eq!(entry.max_retries, 5);

        let id = outbox.enqueue(draft(Priority::Low, 2), now).unwrap();
        let entry = outbox.get(&id).unwrap();
        assert_eq!(entry.expires_at, now + Duration::from_secs(3 * 3600));
        // base 3 - 1, still >= 1.
        assert_eq!(entry.max_retries, 2);
    }

    #[test]
    fn test_enqueue_same_id_is_noop() {
        let (outbox, _events) = open_outbox();
        let now = epoch(1_000_000);
        let first = outbox.enqueue(draft(Priority::Normal, 1), now).unwrap();
        let second = outbox.enqueue(draft(Priority::Normal, 1), now).unwrap();
        assert_eq!(first, second);
        assert_eq!(outbox.stats().held, 1);
    }

    #[test]
    fn test_dequeue_orders_by_priority_then_age() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);

        outbox.enqueue(draft(Priority::Low, 1), t0).unwrap();
        outbox
            .enqueue(draft(Priority::Urgent, 2), t0 + Duration::from_secs(1))
            .unwrap();
        outbox
            .enqueue(draft(Priority::Normal, 3), t0 + Duration::from_secs(2))
            .unwrap();
        outbox
            .enqueue(draft(Priority::Normal, 4), t0 + Duration::from_secs(3))
            .unwrap();

        let ready = outbox.dequeue_ready(t0 + Duration::from_secs(10));
        let priorities: Vec<Priority> = ready.iter().map(|entry| entry.priority).collect();
        assert_eq!(
            priorities,
            vec![
                Priority::Urgent,
                Priority::Normal,
                Priority::Normal,
                Priority::Low
            ]
        );
        // Same priority dequeues oldest first.
        assert!(ready[1].queued_at < ready[2].queued_at);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let (outbox, _events) = open_outbox();
        let now = epoch(1_000_000);
        let id = outbox.enqueue(draft(Priority::Normal, 1), now).unwrap();

        outbox.mark_delivered(&id).unwrap();
        assert_eq!(outbox.get(&id).unwrap().status, Status::Delivered);

        // Further transitions leave the status untouched.
        outbox.mark_sending(&id).unwrap();
        outbox.mark_failed(&id, "late failure", now).unwrap();
        assert_eq!(outbox.get(&id).unwrap().status, Status::Delivered);
    }

    #[test]
    fn test_expiry_supersedes_retry() {
        let (outbox, mut events) = open_outbox();
        let t0 = epoch(1_000_000);
        // Low priority: 3 h time-to-live, retries remain.
        let id = outbox.enqueue(draft(Priority::Low, 1), t0).unwrap();
        outbox.mark_sending(&id).unwrap();
        outbox.mark_failed(&id, "no link", t0).unwrap();
        assert_eq!(outbox.get(&id).unwrap().status, Status::Retrying);

        let late = t0 + Duration::from_secs(3 * 3600);
        let ready = outbox.dequeue_ready(late);
        assert!(ready.is_empty());
        let entry = outbox.get(&id).unwrap();
        assert_eq!(entry.status, Status::Expired);
        assert_eq!(entry.attempts, 1);
        assert_eq!(events.try_recv().unwrap(), OutboxEvent::Expired(id));

        // Never sent again, even with retries left.
        assert!(outbox.dequeue_ready(late + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_retry_backoff_schedule() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);
        let id = outbox.enqueue(draft(Priority::Urgent, 1), t0).unwrap();

        outbox.mark_failed(&id, "attempt 1", t0).unwrap();
        let entry = outbox.get(&id).unwrap();
        assert_eq!(entry.status, Status::Retrying);
        let next = entry.next_retry_at.unwrap();
        // 2 s base with ±25 % jitter.
        assert!(next >= t0 + Duration::from_millis(1_500));
        assert!(next <= t0 + Duration::from_millis(2_500));

        // Not ready before the backoff nor before the 5 s floor.
        assert!(outbox.dequeue_ready(t0 + Duration::from_secs(2)).is_empty());
        assert_eq!(
            outbox
                .dequeue_ready(t0 + Duration::from_secs(6))
                .first()
                .map(|entry| entry.id),
            Some(id)
        );
    }

    #[test]
    fn test_max_retries_fails_entry() {
        let (outbox, mut events) = open_outbox();
        let t0 = epoch(1_000_000);
        let id = outbox.enqueue(draft(Priority::Low, 1), t0).unwrap();
        // Low: max_retries 2.
        outbox.mark_failed(&id, "first", t0).unwrap();
        outbox
            .mark_failed(&id, "second", t0 + Duration::from_secs(10))
            .unwrap();

        let entry = outbox.get(&id).unwrap();
        assert_eq!(entry.status, Status::Failed);
        assert_eq!(
            events.try_recv().unwrap(),
            OutboxEvent::Failed {
                id,
                reason: "second".into()
            }
        );

        // retry_failed resurrects it.
        let reset = outbox
            .retry_failed(None, t0 + Duration::from_secs(20))
            .unwrap();
        assert_eq!(reset, 1);
        assert_eq!(outbox.get(&id).unwrap().status, Status::Pending);
        assert_eq!(outbox.get(&id).unwrap().attempts, 0);
    }

    #[test]
    fn test_flush_for_peer_ignores_backoff_and_orders() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);

        let recipient = ChatId([0xB0; 32]);
        let urgent = outbox.enqueue(draft(Priority::Urgent, 1), t0).unwrap();
        let normal = outbox
            .enqueue(draft(Priority::Normal, 2), t0 + Duration::from_secs(1))
            .unwrap();
        let low = outbox
            .enqueue(draft(Priority::Low, 3), t0 + Duration::from_secs(2))
            .unwrap();
        // Push one entry into deep backoff; flush must still include it.
        outbox.mark_failed(&normal, "offline", t0).unwrap();

        let batch = outbox.flush_for_peer(&recipient, t0 + Duration::from_secs(3));
        let ids: Vec<MessageId> = batch.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![urgent, normal, low]);
    }

    #[test]
    fn test_capacity_evicts_oldest_low_priority() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);

        let mut low_ids = Vec::new();
        for tag in 0..8u8 {
            let at = t0 + Duration::from_secs(u64::from(tag));
            low_ids.push(outbox.enqueue(draft(Priority::Low, tag), at).unwrap());
        }
        assert_eq!(outbox.stats().held, 8);

        let id = outbox
            .enqueue(draft(Priority::High, 9), t0 + Duration::from_secs(60))
            .unwrap();
        assert_eq!(outbox.stats().held, 8);
        assert!(outbox.contains(&id));
        // The oldest low-priority entry went away.
        assert!(!outbox.contains(&low_ids[0]));
        assert_eq!(outbox.stats().evicted, 1);
    }

    #[test]
    fn test_capacity_full_of_higher_priority_rejects() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);
        for tag in 0..8u8 {
            outbox.enqueue(draft(Priority::Urgent, tag), t0).unwrap();
        }
        let result = outbox.enqueue(draft(Priority::Low, 99), t0);
        assert!(matches!(result, Err(OutboxError::Full)));
    }

    #[test]
    fn test_durability_across_reopen() {
        let store = Arc::new(MemoryStore::new());
        let t0 = epoch(1_000_000);
        let (id_pending, id_inflight, id_delivered);
        {
            let (outbox, _events) = Outbox::open(store.clone(), test_config()).unwrap();
            id_pending = outbox.enqueue(draft(Priority::Normal, 1), t0).unwrap();
            id_inflight = outbox.enqueue(draft(Priority::Normal, 2), t0).unwrap();
            id_delivered = outbox.enqueue(draft(Priority::Normal, 3), t0).unwrap();
            outbox.mark_sending(&id_inflight).unwrap();
            outbox.mark_awaiting_ack(&id_inflight).unwrap();
            outbox.mark_delivered(&id_delivered).unwrap();
            outbox.persist_all().unwrap();
        }

        let (reopened, _events) = Outbox::open(store, test_config()).unwrap();
        assert_eq!(reopened.get(&id_pending).unwrap().status, Status::Pending);
        // In-flight states recover as pending.
        assert_eq!(reopened.get(&id_inflight).unwrap().status, Status::Pending);
        // Terminal transitions survive.
        assert_eq!(
            reopened.get(&id_delivered).unwrap().status,
            Status::Delivered
        );
    }

    #[test]
    fn test_delete_leaves_bounded_tombstones() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);

        let mut ids = Vec::new();
        for tag in 0..6u8 {
            let id = outbox.enqueue(draft(Priority::Normal, tag), t0).unwrap();
            outbox.delete(&id).unwrap();
            ids.push(id);
        }
        // Capacity 4: the two oldest tombstones rolled off.
        assert_eq!(outbox.deleted_ids().len(), 4);
        assert!(!outbox.is_tombstoned(&ids[0]));
        assert!(outbox.is_tombstoned(&ids[5]));
        assert!(!outbox.contains(&ids[5]));
    }

    #[test]
    fn test_queue_hash_tracks_membership() {
        let (outbox, _events) = open_outbox();
        let t0 = epoch(1_000_000);
        let empty = outbox.queue_hash();

        let id = outbox.enqueue(draft(Priority::Normal, 1), t0).unwrap();
        let one = outbox.queue_hash();
        assert_ne!(empty, one);

        // Delivered entries drop out of the active set; the tombstone-free
        // hash returns to the empty value only if no tombstones exist.
        outbox.mark_delivered(&id).unwrap();
        assert_eq!(outbox.queue_hash(), empty);
    }

    #[test]
    fn test_backoff_monotonic_up_to_cap() {
        let initial = Duration::from_secs(2);
        let max = Duration::from_secs(600);
        let mut previous = Duration::ZERO;
        for attempt in 1..16u32 {
            let backoff = backoff_for_attempt(attempt, initial, max);
            assert!(backoff >= previous);
            assert!(backoff <= max);
            previous = backoff;
        }
        assert_eq!(backoff_for_attempt(1, initial, max), initial);
        assert_eq!(backoff_for_attempt(2, initial, max), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(16, initial, max), max);
    }

    #[test]
    fn test_schema_guard_refuses_newer() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut tx = store.begin().unwrap();
            tx.put(SCHEMA_KEY, &99u32.to_le_bytes()).unwrap();
            tx.commit().unwrap();
        }
        let result = Outbox::open(store, test_config());
        assert!(matches!(
            result,
            Err(OutboxError::Persist(StoreError::SchemaVersion { found: 99 }))
        ));
    }
}
