//! Session registry.
//!
//! Maps session keys (ephemeral handle while connected, first-observed
//! public key otherwise) to sessions, with a chat-identity index kept in
//! lockstep. Reads are shared, writes exclusive; writes only happen on
//! establishment, rekey replacement and removal, so a reader-writer lock
//! fits the access pattern.
//!
//! Sessions live behind `Arc<Mutex<..>>`: to encrypt or decrypt, a task
//! takes a short-lived lock, performs the AEAD operation atomically with
//! its counter increment, and releases. Replacing a session atomically
//! swaps the map entry; the old cipher states zeroize as their last
//! reference drops.

use crate::identity::{ChatId, SessionKey};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Default)]
struct Inner {
    by_session: HashMap<SessionKey, Arc<Mutex<Session>>>,
    by_chat: HashMap<ChatId, SessionKey>,
}

/// Thread-safe peer-to-session map.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for a peer, replacing any previous one
    /// atomically. At most one session exists per peer; the replaced
    /// session's key material zeroizes when its last borrow ends.
    pub fn insert(&self, key: SessionKey, chat: ChatId, session: Session) {
        let handle = Arc::new(Mutex::new(session));
        let mut inner = self.write();
        if let Some(previous) = inner.by_chat.insert(chat, key) {
            if previous != key {
                inner.by_session.remove(&previous);
            }
        }
        if inner.by_session.insert(key, handle).is_some() {
            tracing::debug!(session = %key, "session replaced");
        }
    }

    /// Look up by session key.
    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<Session>>> {
        self.read().by_session.get(key).cloned()
    }

    /// Look up by stable chat identity.
    #[must_use]
    pub fn get_by_chat(&self, chat: &ChatId) -> Option<Arc<Mutex<Session>>> {
        let inner = self.read();
        let key = inner.by_chat.get(chat)?;
        inner.by_session.get(key).cloned()
    }

    /// Resolve a chat identity to its current session key.
    #[must_use]
    pub fn session_key_for_chat(&self, chat: &ChatId) -> Option<SessionKey> {
        self.read().by_chat.get(chat).copied()
    }

    /// Move a session to a new key, as when a peer's ephemeral handle is
    /// dropped on disconnect and lookup falls back to the stable key. The
    /// chat index follows.
    pub fn rebind(&self, old: &SessionKey, new: SessionKey, chat: ChatId) {
        if old == &new {
            return;
        }
        let mut inner = self.write();
        if let Some(handle) = inner.by_session.remove(old) {
            inner.by_session.insert(new, handle);
            inner.by_chat.insert(chat, new);
        }
    }

    /// Remove a peer's session. Both indexes update together.
    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Mutex<Session>>> {
        let mut inner = self.write();
        let removed = inner.by_session.remove(key);
        if removed.is_some() {
            inner.by_chat.retain(|_, mapped| mapped != key);
        }
        removed
    }

    /// Chat identities with an established session right now.
    #[must_use]
    pub fn established_chats(&self) -> Vec<ChatId> {
        let inner = self.read();
        inner
            .by_chat
            .iter()
            .filter(|(_, key)| {
                inner.by_session.get(*key).is_some_and(|session| {
                    session
                        .lock()
                        .map(|session| session.is_established())
                        .unwrap_or(false)
                })
            })
            .map(|(chat, _)| *chat)
            .collect()
    }

    /// Number of sessions held, in any phase.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_session.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session. Cipher states zeroize as references drain;
    /// used by global shutdown.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.by_session.clear();
        inner.by_chat.clear();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EphemeralId, PeerId};
    use drift_crypto::StaticKeypair;
    use drift_crypto::handshake::{Pattern, Role};
    use std::time::{Duration, Instant};

    fn session() -> Session {
        Session::begin(
            Pattern::Xx,
            Role::Initiator,
            StaticKeypair::from_secret([0x05; 32]),
            None,
            Instant::now(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn ephemeral(tag: u8) -> SessionKey {
        SessionKey::Ephemeral(EphemeralId([tag; 16]))
    }

    fn chat(tag: u8) -> ChatId {
        ChatId([tag; 32])
    }

    #[test]
    fn test_insert_and_lookup_both_indexes() {
        let registry = SessionRegistry::new();
        registry.insert(ephemeral(1), chat(9), session());

        assert!(registry.get(&ephemeral(1)).is_some());
        assert!(registry.get_by_chat(&chat(9)).is_some());
        assert_eq!(registry.session_key_for_chat(&chat(9)), Some(ephemeral(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_keeps_single_session_per_peer() {
        let registry = SessionRegistry::new();
        registry.insert(ephemeral(1), chat(9), session());
        // Reconnect rotates the ephemeral handle.
        registry.insert(ephemeral(2), chat(9), session());

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&ephemeral(1)).is_none());
        assert!(registry.get(&ephemeral(2)).is_some());
        assert_eq!(registry.session_key_for_chat(&chat(9)), Some(ephemeral(2)));
    }

    #[test]
    fn test_remove_updates_chat_index() {
        let registry = SessionRegistry::new();
        registry.insert(ephemeral(1), chat(9), session());
        assert!(registry.remove(&ephemeral(1)).is_some());
        assert!(registry.get_by_chat(&chat(9)).is_none());
        assert!(registry.is_empty());

        // Removing again is a no-op.
        assert!(registry.remove(&ephemeral(1)).is_none());
    }

    #[test]
    fn test_rebind_moves_session_to_stable_key() {
        let registry = SessionRegistry::new();
        registry.insert(ephemeral(1), chat(9), session());

        let stable = SessionKey::Static(PeerId([9; 32]));
        registry.rebind(&ephemeral(1), stable, chat(9));

        assert!(registry.get(&ephemeral(1)).is_none());
        assert!(registry.get(&stable).is_some());
        assert_eq!(registry.session_key_for_chat(&chat(9)), Some(stable));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_static_fallback_key() {
        let registry = SessionRegistry::new();
        let key = SessionKey::Static(PeerId([3; 32]));
        registry.insert(key, chat(3), session());
        assert!(registry.get(&key).is_some());
    }

    #[test]
    fn test_established_chats_excludes_handshaking() {
        let registry = SessionRegistry::new();
        registry.insert(ephemeral(1), chat(9), session());
        assert!(registry.established_chats().is_empty());
    }

    #[test]
    fn test_clear() {
        let registry = SessionRegistry::new();
        registry.insert(ephemeral(1), chat(1), session());
        registry.insert(ephemeral(2), chat(2), session());
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get_by_chat(&chat(1)).is_none());
    }
}
