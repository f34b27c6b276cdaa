//! # Drift Link
//!
//! The link seam of the Drift messaging engine.
//!
//! The radio link itself (scanning, advertising, characteristic I/O) lives
//! outside the core; this crate defines the contract the core consumes:
//! a [`Link`] for outbound writes, and [`LinkEvent`]s delivered over a
//! single channel into the orchestrator. Peers at this layer are opaque
//! link addresses; protocol identities are established above, during
//! identity exchange.
//!
//! [`memory::MemoryLink`] provides an in-process link pair used by the
//! integration tests.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod memory;
pub mod mtu;

use std::fmt;
use thiserror::Error;

/// Opaque link-layer address of a peer device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddr(pub [u8; 6]);

impl LinkAddr {
    /// Address bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkAddr({self})")
    }
}

/// Link-layer failures, surfaced at the orchestrator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The link to the peer dropped.
    #[error("link lost")]
    Lost,

    /// A link operation exceeded its deadline.
    #[error("link timeout")]
    Timeout,

    /// The platform denied the radio operation.
    #[error("permission denied")]
    PermissionDenied,
}

/// Events emitted by a link implementation.
///
/// All events for all peers are delivered over one channel and processed
/// sequentially per link by the orchestrator.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A nearby peer was discovered while scanning.
    PeerDiscovered {
        /// Link address of the discovered peer.
        addr: LinkAddr,
    },
    /// A connection to the peer is up (either role).
    Connected {
        /// Link address of the connected peer.
        addr: LinkAddr,
    },
    /// The per-link MTU negotiation finished.
    MtuNegotiated {
        /// Link address of the peer.
        addr: LinkAddr,
        /// Agreed maximum transmission unit in bytes.
        mtu: u16,
    },
    /// Bytes arrived from the peer.
    Inbound {
        /// Link address of the sending peer.
        addr: LinkAddr,
        /// Raw packet bytes as received.
        bytes: Vec<u8>,
    },
    /// The connection to the peer went down.
    Disconnected {
        /// Link address of the peer.
        addr: LinkAddr,
    },
}

/// Outbound contract of a link implementation.
///
/// Implementations are expected to queue writes internally; `send` returns
/// once the bytes are accepted for transmission, not once they are on the
/// air.
pub trait Link: Send + Sync {
    /// Write one packet to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Lost`] if the peer is not connected.
    fn send(&self, peer: LinkAddr, bytes: &[u8]) -> Result<(), LinkError>;

    /// The negotiated MTU for the peer, if negotiation completed.
    fn negotiated_mtu(&self, peer: LinkAddr) -> Option<u16>;

    /// Tear the connection down. Idempotent.
    fn disconnect(&self, peer: LinkAddr);
}
