//! Cryptographic error types.

use thiserror::Error;

/// Errors from the primitive layer and cipher states.
///
/// These are fatal to the current message only; the owning session may
/// continue unless the caller decides otherwise.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// DH input was a low-order or otherwise malformed curve point.
    #[error("invalid curve point")]
    InvalidPoint,

    /// AEAD authentication failed on open.
    #[error("authentication failure")]
    AuthFailure,

    /// The 64-bit nonce counter would overflow.
    #[error("nonce counter exhausted, rekey required")]
    NonceExhausted,

    /// HKDF output request could not be satisfied.
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Errors fatal to an in-progress handshake.
///
/// Any of these removes the session; the peer may initiate again.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// A handshake message failed AEAD decryption.
    #[error("handshake message failed to decrypt")]
    DecryptFailure,

    /// A handshake message was structurally invalid (short, bad point).
    #[error("malformed handshake message")]
    MalformedMessage,

    /// A write or read was attempted out of turn, or split before the
    /// final message.
    #[error("handshake message out of sequence")]
    OutOfSequence,

    /// The handshake exceeded its wall-clock deadline.
    #[error("handshake deadline exceeded")]
    Timeout,

    /// The KK pattern was initiated without the peer's static key.
    #[error("pattern requires the remote static key")]
    MissingRemoteStatic,

    /// Underlying primitive failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
