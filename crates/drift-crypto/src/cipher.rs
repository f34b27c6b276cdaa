//! Per-direction cipher state for established sessions.
//!
//! Exactly one `CipherState` exists per direction of a session. Each holds a
//! 32-byte symmetric key and a 64-bit counter that starts at zero and is
//! never reused for the same key. Encrypt advances the counter atomically
//! with the AEAD seal; a failed decrypt leaves the counter untouched, so the
//! receive side accepts a strictly in-order counter sequence.

use crate::error::CryptoError;
use crate::primitives::{aead_open, aead_seal, hkdf2, nonce_for_counter};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key plus monotonically increasing nonce counter.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    key: [u8; 32],
    #[zeroize(skip)]
    counter: u64,
}

impl CipherState {
    /// Create a cipher state with a fresh key and a zero counter.
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// Encrypt and authenticate `plaintext` under the current counter, then
    /// advance the counter.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceExhausted`] if the counter would
    /// overflow. Practically unreachable, but a reused nonce is fatal so the
    /// final counter value is refused.
    pub fn encrypt(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = nonce_for_counter(self.counter);
        let ciphertext = aead_seal(&self.key, &nonce, ad, plaintext)?;
        self.counter += 1;
        Ok(ciphertext)
    }

    /// Decrypt `ciphertext` under the current counter.
    ///
    /// The counter advances only on success; an authentication failure
    /// leaves the state unchanged so the caller decides retry/reject
    /// policy. Receipt is strictly in-order (window size 1), which is
    /// sufficient for a reliable transport and makes cross-session replay
    /// impossible.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthFailure`] on tag mismatch and
    /// [`CryptoError::NonceExhausted`] if the counter would overflow.
    pub fn decrypt(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = nonce_for_counter(self.counter);
        let plaintext = aead_open(&self.key, &nonce, ad, ciphertext)?;
        self.counter += 1;
        Ok(plaintext)
    }

    /// Derive a fresh key by one HKDF step and reset the counter to zero.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] on an HKDF failure.
    pub fn rekey(&mut self) -> Result<(), CryptoError> {
        let (next, _) = hkdf2(&self.key, &[])?;
        self.key.zeroize();
        self.key = next;
        self.counter = 0;
        Ok(())
    }

    /// Number of successful operations so far; also the next nonce counter.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Key bytes, exposed inside the crate for handshake tests.
    #[cfg(test)]
    pub(crate) fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CipherState, CipherState) {
        let key = [0x21u8; 32];
        (CipherState::new(key), CipherState::new(key))
    }

    #[test]
    fn test_roundtrip_in_order() {
        let (mut tx, mut rx) = pair();
        for i in 0..10u8 {
            let ct = tx.encrypt(b"hdr", &[i]).unwrap();
            let pt = rx.decrypt(b"hdr", &ct).unwrap();
            assert_eq!(pt, [i]);
        }
        assert_eq!(tx.counter(), 10);
        assert_eq!(rx.counter(), 10);
    }

    #[test]
    fn test_counter_sequence_is_contiguous() {
        let (mut tx, _) = pair();
        for expected in 0..5u64 {
            assert_eq!(tx.counter(), expected);
            tx.encrypt(b"", b"payload").unwrap();
        }
    }

    #[test]
    fn test_failed_decrypt_does_not_advance() {
        let (mut tx, mut rx) = pair();
        let mut ct = tx.encrypt(b"", b"msg").unwrap();
        ct[0] ^= 0xFF;

        assert_eq!(rx.decrypt(b"", &ct), Err(CryptoError::AuthFailure));
        assert_eq!(rx.counter(), 0);

        // The untampered ciphertext still decrypts afterwards.
        ct[0] ^= 0xFF;
        assert_eq!(rx.decrypt(b"", &ct).unwrap(), b"msg");
        assert_eq!(rx.counter(), 1);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (mut tx, mut rx) = pair();
        let _skipped = tx.encrypt(b"", b"first").unwrap();
        let second = tx.encrypt(b"", b"second").unwrap();

        // Receiver is still at counter 0; a message sealed at counter 1
        // cannot authenticate.
        assert!(rx.decrypt(b"", &second).is_err());
    }

    #[test]
    fn test_nonce_exhaustion() {
        let mut state = CipherState::new([7u8; 32]);
        state.counter = u64::MAX;
        assert_eq!(
            state.encrypt(b"", b"x"),
            Err(CryptoError::NonceExhausted)
        );
        assert_eq!(
            state.decrypt(b"", &[0u8; 32]),
            Err(CryptoError::NonceExhausted)
        );
    }

    #[test]
    fn test_rekey_resets_counter_and_changes_key() {
        let (mut tx, mut rx) = pair();
        let before = *tx.key();
        let ct_old = tx.encrypt(b"", b"old").unwrap();

        tx.rekey().unwrap();
        assert_eq!(tx.counter(), 0);
        assert_ne!(tx.key(), &before);

        // Peer that performs the same step stays in sync.
        let _consumed = rx.decrypt(b"", &ct_old).unwrap();
        rx.rekey().unwrap();
        let ct_new = tx.encrypt(b"", b"new").unwrap();
        assert_eq!(rx.decrypt(b"", &ct_new).unwrap(), b"new");
    }

    #[test]
    fn test_rekeyed_key_rejects_old_traffic() {
        let (mut tx, mut rx) = pair();
        let ct = tx.encrypt(b"", b"msg").unwrap();
        rx.rekey().unwrap();
        assert!(rx.decrypt(b"", &ct).is_err());
    }
}
