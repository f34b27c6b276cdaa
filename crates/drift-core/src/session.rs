//! Per-peer secure session.
//!
//! A session is either mid-handshake or established; the two phases carry
//! disjoint state, so the type is a sum, not a struct of optionals. An
//! established session owns exactly one cipher state per direction and
//! preserves send order through their counters.
//!
//! Rekeying: when a direction's counter reaches the configured message
//! budget, both sides derive the next key deterministically (an HKDF step)
//! and reset the counter, no signaling needed. When the session age
//! exceeds its budget, the session is replaced by a fresh handshake
//! instead, since the sides cannot re-ratchet in lockstep on wall-clock
//! time alone.

use crate::error::SessionError;
use drift_crypto::handshake::{Handshake, Pattern, Role};
use drift_crypto::{CipherState, StaticKeypair};
use rand_core::{CryptoRng, RngCore};
use std::time::{Duration, Instant};

/// A secure session with one peer.
pub enum Session {
    /// Handshake in progress.
    Handshaking {
        /// The Noise state machine.
        handshake: Handshake,
        /// Absolute deadline; exceeding it discards the session.
        deadline: Instant,
    },
    /// Handshake complete; transport keys active.
    Established {
        /// Sending direction.
        send: CipherState,
        /// Receiving direction.
        recv: CipherState,
        /// The peer's authenticated static key.
        remote_static: Option<[u8; 32]>,
        /// Pattern the session was established with.
        pattern: Pattern,
        /// When the current keys were installed.
        established_at: Instant,
    },
}

impl Session {
    /// Start a handshake session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Handshake`] when the pattern preconditions
    /// are not met (KK without the remote static).
    pub fn begin(
        pattern: Pattern,
        role: Role,
        local_static: StaticKeypair,
        remote_static: Option<[u8; 32]>,
        now: Instant,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let handshake = Handshake::initiate(pattern, role, local_static, remote_static)?;
        Ok(Session::Handshaking {
            handshake,
            deadline: now + timeout,
        })
    }

    /// Whether the session is past its handshake.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self, Session::Established { .. })
    }

    /// Whether an in-progress handshake blew its deadline.
    #[must_use]
    pub fn handshake_expired(&self, now: Instant) -> bool {
        match self {
            Session::Handshaking { deadline, .. } => now >= *deadline,
            Session::Established { .. } => false,
        }
    }

    /// Produce the next handshake message.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoHandshake`] on an established session.
    /// - [`SessionError::Handshake`] on a state-machine failure.
    pub fn write_handshake<R: RngCore + CryptoRng>(
        &mut self,
        payload: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, SessionError> {
        match self {
            Session::Handshaking { handshake, .. } => {
                Ok(handshake.write_message(payload, rng)?)
            }
            Session::Established { .. } => Err(SessionError::NoHandshake),
        }
    }

    /// Consume a peer handshake message, returning its payload.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoHandshake`] on an established session.
    /// - [`SessionError::Handshake`] on a state-machine failure.
    pub fn read_handshake(&mut self, message: &[u8]) -> Result<Vec<u8>, SessionError> {
        match self {
            Session::Handshaking { handshake, .. } => Ok(handshake.read_message(message)?),
            Session::Established { .. } => Err(SessionError::NoHandshake),
        }
    }

    /// Whether the handshake has processed its final message and can
    /// split.
    #[must_use]
    pub fn handshake_complete(&self) -> bool {
        match self {
            Session::Handshaking { handshake, .. } => handshake.is_complete(),
            Session::Established { .. } => false,
        }
    }

    /// Whether it is this side's turn to write the next handshake
    /// message.
    #[must_use]
    pub fn handshake_wants_write(&self) -> bool {
        match self {
            Session::Handshaking { handshake, .. } => handshake.wants_write(),
            Session::Established { .. } => false,
        }
    }

    /// Split a completed handshake into the established phase. The
    /// previous state, chaining key included, is zeroized as it drops.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoHandshake`] on an established session.
    /// - [`SessionError::Handshake`] when messages remain.
    pub fn establish(self, now: Instant) -> Result<Self, SessionError> {
        match self {
            Session::Handshaking { handshake, .. } => {
                let remote_static = handshake.remote_static();
                let pattern = handshake.pattern();
                let (send, recv) = handshake.split()?;
                Ok(Session::Established {
                    send,
                    recv,
                    remote_static,
                    pattern,
                    established_at: now,
                })
            }
            Session::Established { .. } => Err(SessionError::NoHandshake),
        }
    }

    /// Encrypt a payload in send order.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotEstablished`] mid-handshake.
    /// - [`SessionError::Crypto`] on nonce exhaustion.
    pub fn encrypt(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        match self {
            Session::Established { send, .. } => Ok(send.encrypt(ad, plaintext)?),
            Session::Handshaking { .. } => Err(SessionError::NotEstablished),
        }
    }

    /// Decrypt the next in-order payload.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotEstablished`] mid-handshake.
    /// - [`SessionError::Crypto`] on authentication failure; the receive
    ///   counter does not advance.
    pub fn decrypt(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        match self {
            Session::Established { recv, .. } => Ok(recv.decrypt(ad, ciphertext)?),
            Session::Handshaking { .. } => Err(SessionError::NotEstablished),
        }
    }

    /// The peer's authenticated static key, once known.
    #[must_use]
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        match self {
            Session::Handshaking { handshake, .. } => handshake.remote_static(),
            Session::Established { remote_static, .. } => *remote_static,
        }
    }

    /// Messages sent under the current send key.
    #[must_use]
    pub fn send_count(&self) -> u64 {
        match self {
            Session::Established { send, .. } => send.counter(),
            Session::Handshaking { .. } => 0,
        }
    }

    /// Whether the counter budget calls for an in-place rekey.
    #[must_use]
    pub fn needs_counter_rekey(&self, rekey_messages: u64) -> bool {
        match self {
            Session::Established { send, recv, .. } => {
                send.counter() >= rekey_messages || recv.counter() >= rekey_messages
            }
            Session::Handshaking { .. } => false,
        }
    }

    /// Whether the age budget calls for a replacement handshake.
    #[must_use]
    pub fn needs_age_rekey(&self, now: Instant, rekey_age: Duration) -> bool {
        match self {
            Session::Established { established_at, .. } => {
                now.checked_duration_since(*established_at)
                    .is_some_and(|age| age >= rekey_age)
            }
            Session::Handshaking { .. } => false,
        }
    }

    /// Ratchet both directions forward and reset their counters. Both
    /// sides perform the same step at the same counter budget, so no
    /// signaling is exchanged.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotEstablished`] mid-handshake.
    /// - [`SessionError::Crypto`] on a key-derivation failure.
    pub fn rekey(&mut self, now: Instant) -> Result<(), SessionError> {
        match self {
            Session::Established {
                send,
                recv,
                established_at,
                ..
            } => {
                send.rekey()?;
                recv.rekey()?;
                *established_at = now;
                tracing::debug!("session rekeyed");
                Ok(())
            }
            Session::Handshaking { .. } => Err(SessionError::NotEstablished),
        }
    }
}
