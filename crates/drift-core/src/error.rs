//! Error taxonomy for the Drift core.
//!
//! Propagation policy:
//! - relay drops and single-packet auth failures are counted, never
//!   surfaced to the user message path;
//! - per-message fatal outbox errors mark the entry failed and notify the
//!   subscriber side channel;
//! - handshake errors remove the session, the next send retries;
//! - an inaccessible store at startup refuses to start.

use thiserror::Error;

/// Top-level core error.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic primitive failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] drift_crypto::CryptoError),

    /// Handshake failure; the session is removed.
    #[error("handshake error: {0}")]
    Handshake(#[from] drift_crypto::HandshakeError),

    /// Framing or fragmentation failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Outbox failure.
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Session layer failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Persistence failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue synchronization failure.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Link failure, handled by the orchestrator's reconnect policy.
    #[error("link error: {0}")]
    Link(#[from] drift_link::LinkError),
}

/// Framing and fragmentation errors; fatal to the current payload only.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Packet or fragment shorter than its header.
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum length required.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Declared payload length exceeds the data or the MTU.
    #[error("payload length exceeds bounds")]
    PayloadOverflow,

    /// Fragment header inconsistent with its reassembly buffer.
    #[error("malformed fragment")]
    MalformedFragment,

    /// A reassembly buffer expired before completing.
    #[error("reassembly timed out")]
    ReassemblyTimeout,

    /// Reassembly memory budget exhausted.
    #[error("reassembly buffers exhausted")]
    BufferExhausted,
}

/// Outbox errors. `Expired` and `MaxRetries` are surfaced to the sender;
/// `Persist` additionally escalates to a warning.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The outbox is at capacity and nothing lower-priority can be evicted.
    #[error("outbox full")]
    Full,

    /// The entry's time-to-live elapsed.
    #[error("message expired")]
    Expired,

    /// The entry exhausted its retry budget.
    #[error("retry budget exhausted")]
    MaxRetries,

    /// The backing store rejected a write.
    #[error("persistence failure: {0}")]
    Persist(#[from] StoreError),

    /// No entry with the given id.
    #[error("unknown message id")]
    UnknownMessage,
}

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Payload operation on a session still in handshake.
    #[error("session not established")]
    NotEstablished,

    /// Handshake operation on an established session.
    #[error("no handshake in progress")]
    NoHandshake,

    /// Underlying handshake failure.
    #[error(transparent)]
    Handshake(#[from] drift_crypto::HandshakeError),

    /// Underlying cipher failure.
    #[error(transparent)]
    Crypto(#[from] drift_crypto::CryptoError),
}

/// Persistence errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing engine failed.
    #[error("store backend: {0}")]
    Backend(String),

    /// A stored value failed to decode.
    #[error("store corrupt: {0}")]
    Corrupt(String),

    /// The store was written by a newer schema.
    #[error("unsupported schema version {found}")]
    SchemaVersion {
        /// Version found on disk.
        found: u32,
    },
}

/// Queue synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A sync envelope failed to decode.
    #[error("sync message malformed: {0}")]
    Malformed(String),

    /// A filter's parameters are outside sane bounds.
    #[error("filter parameters invalid")]
    InvalidFilter,
}

/// Identity encoding errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A QR or announce payload failed to parse.
    #[error("identity payload malformed")]
    Malformed,
}
