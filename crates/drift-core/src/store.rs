//! Persistence contracts.
//!
//! The core does not ship a storage engine. It consumes a small key-value
//! transaction API with atomic multi-key commits (the outbox depends on
//! that atomicity) and an identity store with at-rest confidentiality
//! provided by the host. [`MemoryStore`] and [`MemoryIdentityStore`] are
//! the reference implementations used by tests and ephemeral nodes.

use crate::error::StoreError;
use crate::identity::{PeerId, PeerRecord};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Key-value store with transactional writes.
pub trait KvStore: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the engine cannot start one.
    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>, StoreError>;
}

/// A single transaction. Writes become visible atomically on `commit`;
/// dropping the transaction discards them.
pub trait KvTransaction {
    /// Read a key, observing the transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// All pairs whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply all writes atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the commit does not land.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// In-memory `KvStore`.
#[derive(Default, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl KvStore for MemoryStore {
    fn begin(&self) -> Result<Box<dyn KvTransaction + '_>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            writes: BTreeMap::new(),
        }))
    }
}

/// Buffered writes applied to the backing map on commit.
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvTransaction for MemoryTransaction<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.store.lock().get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self.store.lock();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, pending) in &self.writes {
            if !key.starts_with(prefix) {
                continue;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut data = self.store.lock();
        for (key, pending) in self.writes {
            match pending {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Identity storage contract: the local static key and peer records, kept
/// confidential at rest by the host platform.
pub trait IdentityStore: Send + Sync {
    /// Load the local static keypair, if one was saved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn load_static_key(&self) -> Result<Option<([u8; 32], [u8; 32])>, StoreError>;

    /// Persist the local static keypair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn save_static_key(&self, secret: &[u8; 32], public: &[u8; 32]) -> Result<(), StoreError>;

    /// Load one peer record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn load_peer(&self, id: &PeerId) -> Result<Option<PeerRecord>, StoreError>;

    /// Persist one peer record, keyed by its immutable peer id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn save_peer(&self, record: &PeerRecord) -> Result<(), StoreError>;

    /// Remove a peer record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on an engine failure.
    fn delete_peer(&self, id: &PeerId) -> Result<(), StoreError>;
}

/// In-memory `IdentityStore`.
#[derive(Default)]
pub struct MemoryIdentityStore {
    inner: Mutex<MemoryIdentityInner>,
}

#[derive(Default)]
struct MemoryIdentityInner {
    static_key: Option<([u8; 32], [u8; 32])>,
    peers: BTreeMap<[u8; 32], PeerRecord>,
}

impl MemoryIdentityStore {
    /// Create an empty identity store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryIdentityInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load_static_key(&self) -> Result<Option<([u8; 32], [u8; 32])>, StoreError> {
        Ok(self.lock().static_key)
    }

    fn save_static_key(&self, secret: &[u8; 32], public: &[u8; 32]) -> Result<(), StoreError> {
        self.lock().static_key = Some((*secret, *public));
        Ok(())
    }

    fn load_peer(&self, id: &PeerId) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.lock().peers.get(&id.0).cloned())
    }

    fn save_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        self.lock().peers.insert(record.peer_id.0, record.clone());
        Ok(())
    }

    fn delete_peer(&self, id: &PeerId) -> Result<(), StoreError> {
        self.lock().peers.remove(&id.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_commit_is_atomic() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.put(b"a", b"1").unwrap();
            tx.put(b"b", b"2").unwrap();
            // Nothing visible before commit.
            let mut probe = store.begin().unwrap();
            assert_eq!(probe.get(b"a").unwrap(), None);
            tx.commit().unwrap();
        }
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tx.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.put(b"a", b"1").unwrap();
            // Dropped without commit.
        }
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_transaction_sees_own_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.put(b"k", b"v").unwrap();
        assert_eq!(tx.get(b"k").unwrap(), Some(b"v".to_vec()));
        tx.delete(b"k").unwrap();
        assert_eq!(tx.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_merges_pending_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.put(b"outbox/1", b"a").unwrap();
        tx.put(b"outbox/2", b"b").unwrap();
        tx.put(b"meta/x", b"c").unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.delete(b"outbox/1").unwrap();
        tx.put(b"outbox/3", b"d").unwrap();
        let scanned = tx.scan_prefix(b"outbox/").unwrap();
        let keys: Vec<&[u8]> = scanned.iter().map(|(key, _)| key.as_slice()).collect();
        assert_eq!(keys, vec![b"outbox/2".as_slice(), b"outbox/3".as_slice()]);
    }

    #[test]
    fn test_identity_store_roundtrip() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.load_static_key().unwrap(), None);
        store.save_static_key(&[1; 32], &[2; 32]).unwrap();
        assert_eq!(store.load_static_key().unwrap(), Some(([1; 32], [2; 32])));

        let record = PeerRecord::new(PeerId([7; 32]));
        store.save_peer(&record).unwrap();
        assert!(store.load_peer(&PeerId([7; 32])).unwrap().is_some());
        store.delete_peer(&PeerId([7; 32])).unwrap();
        assert!(store.load_peer(&PeerId([7; 32])).unwrap().is_none());
    }
}
