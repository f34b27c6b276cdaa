//! Bounded duplicate-suppression index.
//!
//! Maps 64-bit message-id fingerprints to first-seen timestamps with
//! delivered/read flags. Bounded both by entry count and by a time window;
//! whichever bound triggers first evicts the oldest record.
//!
//! Deliberately not persisted: duplicate detection here is a best-effort
//! network-layer optimization. At-most-once semantics at the application
//! layer come from content-addressed message ids at the delivery sink.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
struct SeenRecord {
    first_seen: Instant,
    delivered: bool,
    read: bool,
}

struct Inner {
    map: HashMap<u64, SeenRecord>,
    order: VecDeque<u64>,
}

/// Bounded seen-message store.
pub struct SeenStore {
    inner: Mutex<Inner>,
    capacity: usize,
    window: Duration,
}

impl SeenStore {
    /// Create a store bounded to `capacity` entries and a `window` of
    /// recency.
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
            window,
        }
    }

    /// Record a sighting. Returns `true` on the first sighting within the
    /// window, `false` for a duplicate.
    pub fn witness(&self, fingerprint: u64, now: Instant) -> bool {
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        if inner.map.contains_key(&fingerprint) {
            return false;
        }
        inner.map.insert(
            fingerprint,
            SeenRecord {
                first_seen: now,
                delivered: false,
                read: false,
            },
        );
        inner.order.push_back(fingerprint);
        Self::enforce_capacity(&mut inner, self.capacity);
        true
    }

    /// Mark a message delivered. Idempotent; inserts the record if absent.
    pub fn mark_delivered(&self, fingerprint: u64, now: Instant) {
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        match inner.map.get_mut(&fingerprint) {
            Some(record) => record.delivered = true,
            None => {
                inner.map.insert(
                    fingerprint,
                    SeenRecord {
                        first_seen: now,
                        delivered: true,
                        read: false,
                    },
                );
                inner.order.push_back(fingerprint);
                Self::enforce_capacity(&mut inner, self.capacity);
            }
        }
    }

    /// Mark a message read. Idempotent; inserts the record if absent.
    pub fn mark_read(&self, fingerprint: u64, now: Instant) {
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        match inner.map.get_mut(&fingerprint) {
            Some(record) => record.read = true,
            None => {
                inner.map.insert(
                    fingerprint,
                    SeenRecord {
                        first_seen: now,
                        delivered: false,
                        read: true,
                    },
                );
                inner.order.push_back(fingerprint);
                Self::enforce_capacity(&mut inner, self.capacity);
            }
        }
    }

    /// O(1) delivered check.
    #[must_use]
    pub fn has_delivered(&self, fingerprint: u64) -> bool {
        self.lock()
            .map
            .get(&fingerprint)
            .is_some_and(|record| record.delivered)
    }

    /// O(1) read check.
    #[must_use]
    pub fn has_read(&self, fingerprint: u64) -> bool {
        self.lock()
            .map
            .get(&fingerprint)
            .is_some_and(|record| record.read)
    }

    /// Current record count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Evict expired records. Insertion order doubles as time order
    /// because `first_seen` never changes.
    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(&oldest) = inner.order.front() {
            let expired = inner.map.get(&oldest).is_none_or(|record| {
                now.checked_duration_since(record.first_seen)
                    .is_some_and(|age| age >= self.window)
            });
            if expired {
                inner.order.pop_front();
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn enforce_capacity(inner: &mut Inner, capacity: usize) {
        while inner.order.len() > capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
    }
}
