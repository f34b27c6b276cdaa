//! Peer identity model.
//!
//! Every remote peer is tracked under three identifiers:
//!
//! - the **public key** first observed for the peer: immutable, the
//!   primary key of the record;
//! - a **persistent static key**, present only after a verified security
//!   upgrade;
//! - a **current ephemeral id**, rotated with each new session and absent
//!   while disconnected.
//!
//! Chat identity resolves to the persistent key when present (stable across
//! sessions); session lookup resolves to the ephemeral id when present
//! (privacy-preserving on the air).

use crate::error::IdentityError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// First-observed public key of a peer. Immutable for the lifetime of the
/// record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Stable chat identity: the persistent static key when the peer is
/// verified, otherwise the first-observed public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub [u8; 32]);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChatId({self})")
    }
}

/// Short-lived handle rotated with each new session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EphemeralId(pub [u8; 16]);

impl fmt::Display for EphemeralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EphemeralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EphemeralId({self})")
    }
}

/// Session lookup key: the ephemeral handle while connected, the original
/// public key otherwise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SessionKey {
    /// Rotating per-session handle.
    Ephemeral(EphemeralId),
    /// Fallback to the first-observed public key.
    Static(PeerId),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Ephemeral(id) => write!(f, "eph:{id}"),
            SessionKey::Static(id) => write!(f, "pk:{id}"),
        }
    }
}

/// Everything known about a remote peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Primary key; the first identifier ever observed.
    pub peer_id: PeerId,
    /// Persistent static key, set only after a verified security upgrade.
    pub noise_static_key: Option<[u8; 32]>,
    /// Current ephemeral identifier, absent when not connected.
    pub ephemeral_id: Option<EphemeralId>,
    /// Peer-chosen display name.
    pub display_name: Option<String>,
}

impl PeerRecord {
    /// Create a record for a newly observed peer.
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            noise_static_key: None,
            ephemeral_id: None,
            display_name: None,
        }
    }

    /// Chat identity resolution.
    #[must_use]
    pub fn chat_id(&self) -> ChatId {
        ChatId(self.noise_static_key.unwrap_or(self.peer_id.0))
    }

    /// Session lookup resolution.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        match self.ephemeral_id {
            Some(ephemeral) => SessionKey::Ephemeral(ephemeral),
            None => SessionKey::Static(self.peer_id),
        }
    }

    /// Record a verified security upgrade. The persistent key is written
    /// once; a later different key is refused.
    pub fn upgrade_security(&mut self, static_key: [u8; 32]) -> Result<(), IdentityError> {
        match self.noise_static_key {
            None => {
                self.noise_static_key = Some(static_key);
                Ok(())
            }
            Some(existing) if existing == static_key => Ok(()),
            Some(_) => Err(IdentityError::Malformed),
        }
    }

    /// Rotate in the ephemeral handle for a new session.
    pub fn begin_session(&mut self, ephemeral: EphemeralId) {
        self.ephemeral_id = Some(ephemeral);
    }

    /// Clear the ephemeral handle on disconnect.
    pub fn end_session(&mut self) {
        self.ephemeral_id = None;
    }
}

/// Scheme prefix of the printable identity payload.
const QR_PREFIX: &str = "drift:";

/// Identity payload carried by the wire identity-exchange message and by
/// the out-of-band QR flow; the two stay format-compatible.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAnnounce {
    /// The announcing peer's public key.
    pub public_key: [u8; 32],
    /// Ephemeral handle for this session, if one is active.
    pub ephemeral_id: Option<EphemeralId>,
    /// Display name.
    pub display_name: String,
    /// Noise static public key, if the peer advertises one.
    pub noise_static_public_key: Option<[u8; 32]>,
}

impl IdentityAnnounce {
    /// Binary encoding for the wire message (type 0x01).
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        bincode::serialize(self).map_err(|_| IdentityError::Malformed)
    }

    /// Parse the wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] on undecodable input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        bincode::deserialize(bytes).map_err(|_| IdentityError::Malformed)
    }

    /// Printable-ASCII encoding for the QR flow.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] if encoding fails.
    pub fn to_qr_string(&self) -> Result<String, IdentityError> {
        let json = serde_json::to_vec(self).map_err(|_| IdentityError::Malformed)?;
        Ok(format!("{QR_PREFIX}{}", BASE64.encode(json)))
    }

    /// Parse the printable encoding.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] on a missing prefix or
    /// undecodable body.
    pub fn from_qr_string(encoded: &str) -> Result<Self, IdentityError> {
        let body = encoded
            .strip_prefix(QR_PREFIX)
            .ok_or(IdentityError::Malformed)?;
        let json = BASE64.decode(body).map_err(|_| IdentityError::Malformed)?;
        serde_json::from_slice(&json).map_err(|_| IdentityError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PeerRecord {
        PeerRecord::new(PeerId([0xAA; 32]))
    }

    #[test]
    fn test_chat_id_prefers_persistent_key() {
        let mut peer = record();
        assert_eq!(peer.chat_id(), ChatId([0xAA; 32]));

        peer.upgrade_security([0xBB; 32]).unwrap();
        assert_eq!(peer.chat_id(), ChatId([0xBB; 32]));
    }

    #[test]
    fn test_session_key_prefers_ephemeral() {
        let mut peer = record();
        assert_eq!(peer.session_key(), SessionKey::Static(PeerId([0xAA; 32])));

        peer.begin_session(EphemeralId([7; 16]));
        assert_eq!(
            peer.session_key(),
            SessionKey::Ephemeral(EphemeralId([7; 16]))
        );

        peer.end_session();
        assert_eq!(peer.session_key(), SessionKey::Static(PeerId([0xAA; 32])));
    }

    #[test]
    fn test_security_upgrade_is_write_once() {
        let mut peer = record();
        peer.upgrade_security([1; 32]).unwrap();
        // Same key again is fine.
        peer.upgrade_security([1; 32]).unwrap();
        // A different key is refused and the original kept.
        assert!(peer.upgrade_security([2; 32]).is_err());
        assert_eq!(peer.noise_static_key, Some([1; 32]));
    }

    #[test]
    fn test_announce_wire_roundtrip() {
        let announce = IdentityAnnounce {
            public_key: [3; 32],
            ephemeral_id: Some(EphemeralId([4; 16])),
            display_name: "mallory".into(),
            noise_static_public_key: None,
        };
        let bytes = announce.to_bytes().unwrap();
        assert_eq!(IdentityAnnounce::from_bytes(&bytes).unwrap(), announce);
    }

    #[test]
    fn test_qr_roundtrip_is_printable() {
        let announce = IdentityAnnounce {
            public_key: [9; 32],
            ephemeral_id: None,
            display_name: "alice".into(),
            noise_static_public_key: Some([8; 32]),
        };
        let encoded = announce.to_qr_string().unwrap();
        assert!(encoded.starts_with("drift:"));
        assert!(encoded.is_ascii());
        assert_eq!(IdentityAnnounce::from_qr_string(&encoded).unwrap(), announce);
    }

    #[test]
    fn test_qr_rejects_garbage() {
        assert!(IdentityAnnounce::from_qr_string("drift:!!!").is_err());
        assert!(IdentityAnnounce::from_qr_string("other:abcd").is_err());
    }
}
