//! Stateless cryptographic primitive adapter.
//!
//! Thin wrappers over X25519, ChaCha20-Poly1305, SHA-256 and HKDF-SHA256.
//! No RNG state lives here; callers pass entropy where a primitive needs it.
//!
//! Nonce layout follows the Noise convention: 4 zero bytes followed by the
//! 64-bit counter in little-endian.

use crate::error::CryptoError;
use crate::{KEY_LEN, NONCE_LEN, TAG_LEN};
use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Encodings of the low-order points on Curve25519.
///
/// A DH against any of these yields a non-contributory shared secret. The
/// responder uses this table to reject a bad message-1 ephemeral before any
/// DH is computed; `dh` itself rejects the remaining non-canonical encodings
/// by checking the shared secret.
const LOW_ORDER_POINTS: [[u8; 32]; 7] = [
    // 0 (order 4)
    [0; 32],
    // 1 (order 1)
    [
        1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0,
    ],
    // order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1 (order 2)
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p (= 0, order 4)
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1 (= 1, order 1)
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Long-term X25519 identity keypair.
pub struct StaticKeypair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl StaticKeypair {
    /// Generate a fresh keypair from the given entropy source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Rebuild a keypair from a stored secret key.
    #[must_use]
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let public = public_key(&secret);
        Self { secret, public }
    }

    /// The public key bytes.
    #[must_use]
    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    /// The secret key bytes. Handle with care; this is the long-term
    /// identity key.
    #[must_use]
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Clone for StaticKeypair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret,
            public: self.public,
        }
    }
}

/// Generate a static keypair, returned as raw `(secret, public)` bytes.
pub fn generate_static_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> ([u8; 32], [u8; 32]) {
    let keypair = StaticKeypair::generate(rng);
    (*keypair.secret(), *keypair.public())
}

/// Derive the X25519 public key for a secret key.
#[must_use]
pub fn public_key(secret: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*secret);
    PublicKey::from(&secret).to_bytes()
}

/// Check a public key against the known low-order point encodings.
#[must_use]
pub fn is_low_order_point(public: &[u8; 32]) -> bool {
    LOW_ORDER_POINTS.iter().any(|p| p == public)
}

/// X25519 Diffie-Hellman.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPoint`] when the peer key is a low-order
/// point or the shared secret is non-contributory (all zero).
pub fn dh(secret: &[u8; 32], public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    if is_low_order_point(public) {
        return Err(CryptoError::InvalidPoint);
    }
    let secret = StaticSecret::from(*secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPoint);
    }
    Ok(shared.to_bytes())
}

/// Build the 12-byte AEAD nonce for a counter value: 4 zero bytes followed
/// by the counter in little-endian.
#[must_use]
pub fn nonce_for_counter(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// AEAD seal: `ciphertext || tag(16)`.
///
/// # Errors
///
/// Returns [`CryptoError::AuthFailure`] if the underlying AEAD rejects the
/// input (oversized plaintext).
pub fn aead_seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            nonce.into(),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::AuthFailure)
}

/// AEAD open. Verifies the tag before returning plaintext.
///
/// # Errors
///
/// Returns [`CryptoError::AuthFailure`] on tag mismatch or a ciphertext
/// shorter than the tag.
pub fn aead_open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthFailure);
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::AuthFailure)
}

/// HKDF-SHA256 keyed by the chaining key.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if `out_len` exceeds the HKDF
/// output bound (255 blocks).
pub fn hkdf(
    chaining_key: &[u8; 32],
    ikm: &[u8],
    out_len: usize,
    info: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// HKDF-SHA256 producing two 32-byte outputs, as used by the Noise
/// `MixKey` and `Split` operations.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] on an HKDF expand failure.
pub fn hkdf2(chaining_key: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), ikm);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((first, second))
}

/// SHA-256 digest.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// SHA-256 over the concatenation of two inputs, without an intermediate
/// allocation.
#[must_use]
pub fn sha256_pair(first: &[u8], second: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_keypair_generation() {
        let keypair = StaticKeypair::generate(&mut OsRng);
        assert_ne!(keypair.public(), &[0u8; 32]);
        assert_eq!(&public_key(keypair.secret()), keypair.public());
    }

    #[test]
    fn test_dh_agreement() {
        let alice = StaticKeypair::generate(&mut OsRng);
        let bob = StaticKeypair::generate(&mut OsRng);

        let shared_a = dh(alice.secret(), bob.public()).unwrap();
        let shared_b = dh(bob.secret(), alice.public()).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn test_dh_rejects_low_order() {
        let alice = StaticKeypair::generate(&mut OsRng);
        for point in &LOW_ORDER_POINTS {
            assert_eq!(dh(alice.secret(), point), Err(CryptoError::InvalidPoint));
        }
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = nonce_for_counter(0x0102_0304_0506_0708);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &0x0102_0304_0506_0708u64.to_le_bytes());
    }

    #[test]
    fn test_aead_roundtrip() {
        let key = [0x42u8; 32];
        let nonce = nonce_for_counter(7);
        let sealed = aead_seal(&key, &nonce, b"ad", b"drift").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_LEN);
        let opened = aead_open(&key, &nonce, b"ad", &sealed).unwrap();
        assert_eq!(opened, b"drift");
    }

    #[test]
    fn test_aead_tamper_detection() {
        let key = [0x42u8; 32];
        let nonce = nonce_for_counter(7);
        let mut sealed = aead_seal(&key, &nonce, b"ad", b"drift").unwrap();
        sealed[0] ^= 0xFF;
        assert_eq!(
            aead_open(&key, &nonce, b"ad", &sealed),
            Err(CryptoError::AuthFailure)
        );
    }

    #[test]
    fn test_aead_wrong_ad() {
        let key = [0x42u8; 32];
        let nonce = nonce_for_counter(0);
        let sealed = aead_seal(&key, &nonce, b"ad", b"drift").unwrap();
        assert!(aead_open(&key, &nonce, b"other", &sealed).is_err());
    }

    #[test]
    fn test_aead_short_ciphertext() {
        let key = [0u8; 32];
        let nonce = nonce_for_counter(0);
        assert_eq!(
            aead_open(&key, &nonce, b"", &[0u8; 8]),
            Err(CryptoError::AuthFailure)
        );
    }

    #[test]
    fn test_hkdf2_domain_separation() {
        let ck = [1u8; 32];
        let (a, b) = hkdf2(&ck, b"input").unwrap();
        assert_ne!(a, b);
        let (a2, _) = hkdf2(&ck, b"input").unwrap();
        assert_eq!(a, a2);
        let (a3, _) = hkdf2(&ck, b"other").unwrap();
        assert_ne!(a, a3);
    }

    #[test]
    fn test_hkdf_matches_hkdf2() {
        let ck = [9u8; 32];
        let flat = hkdf(&ck, b"ikm", 64, &[]).unwrap();
        let (a, b) = hkdf2(&ck, b"ikm").unwrap();
        assert_eq!(&flat[..32], &a);
        assert_eq!(&flat[32..], &b);
    }

    #[test]
    fn test_sha256_pair_matches_concat() {
        let joined = [b"left".as_slice(), b"right".as_slice()].concat();
        assert_eq!(sha256(&joined), sha256_pair(b"left", b"right"));
    }
}
