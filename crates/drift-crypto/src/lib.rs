//! # Drift Crypto
//!
//! Cryptographic primitives for the Drift messaging engine.
//!
//! This crate provides:
//! - `Noise_XX` and `Noise_KK` handshakes for mutual authentication
//! - Per-direction cipher states with strict nonce discipline
//! - ChaCha20-Poly1305 AEAD, X25519 key agreement, HKDF-SHA256
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | AEAD | ChaCha20-Poly1305 |
//! | Hash | SHA-256 |
//! | KDF | HKDF-SHA256 |
//!
//! The suite is fixed: both handshake patterns run over
//! `25519_ChaChaPoly_SHA256` and the session layer reuses the same AEAD with
//! a 64-bit counter nonce.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cipher;
pub mod error;
pub mod handshake;
pub mod primitives;

pub use cipher::CipherState;
pub use error::{CryptoError, HandshakeError};
pub use handshake::{Handshake, Pattern, Role};
pub use primitives::StaticKeypair;

/// X25519 key size in bytes.
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag size in bytes.
pub const TAG_LEN: usize = 16;

/// SHA-256 output size in bytes.
pub const HASH_LEN: usize = 32;
