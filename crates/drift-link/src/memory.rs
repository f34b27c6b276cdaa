//! In-process link pair for tests.
//!
//! Two [`MemoryLink`]s wired together behave like a connected radio link:
//! `send` on one side surfaces as [`LinkEvent::Inbound`] on the other, with
//! a configurable MTU and a drop switch for simulating partitions.

use crate::{Link, LinkAddr, LinkError, LinkEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct PeerWire {
    events: mpsc::UnboundedSender<LinkEvent>,
    mtu: u16,
}

/// An in-memory link endpoint.
pub struct MemoryLink {
    addr: LinkAddr,
    events: mpsc::UnboundedSender<LinkEvent>,
    peers: Mutex<HashMap<LinkAddr, PeerWire>>,
    partitioned: AtomicBool,
}

impl MemoryLink {
    /// Create an endpoint and the receiver half of its event channel.
    #[must_use]
    pub fn new(addr: LinkAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            addr,
            events: tx,
            peers: Mutex::new(HashMap::new()),
            partitioned: AtomicBool::new(false),
        });
        (link, rx)
    }

    /// This endpoint's link address.
    #[must_use]
    pub fn addr(&self) -> LinkAddr {
        self.addr
    }

    /// Wire two endpoints together with the given MTU; both sides observe
    /// `Connected` followed by `MtuNegotiated`.
    pub fn connect(a: &Arc<Self>, b: &Arc<Self>, mtu: u16) {
        {
            let mut peers = a.lock_peers();
            peers.insert(
                b.addr,
                PeerWire {
                    events: b.events.clone(),
                    mtu,
                },
            );
        }
        {
            let mut peers = b.lock_peers();
            peers.insert(
                a.addr,
                PeerWire {
                    events: a.events.clone(),
                    mtu,
                },
            );
        }
        let _ = a.events.send(LinkEvent::Connected { addr: b.addr });
        let _ = a.events.send(LinkEvent::MtuNegotiated { addr: b.addr, mtu });
        let _ = b.events.send(LinkEvent::Connected { addr: a.addr });
        let _ = b.events.send(LinkEvent::MtuNegotiated { addr: a.addr, mtu });
    }

    /// Drop all traffic sent from this endpoint while set.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<LinkAddr, PeerWire>> {
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Link for MemoryLink {
    fn send(&self, peer: LinkAddr, bytes: &[u8]) -> Result<(), LinkError> {
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(LinkError::Lost);
        }
        let peers = self.lock_peers();
        let wire = peers.get(&peer).ok_or(LinkError::Lost)?;
        if bytes.len() > wire.mtu as usize {
            tracing::warn!(
                peer = %peer,
                len = bytes.len(),
                mtu = wire.mtu,
                "dropping over-MTU packet"
            );
            return Err(LinkError::Lost);
        }
        wire.events
            .send(LinkEvent::Inbound {
                addr: self.addr,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| LinkError::Lost)
    }

    fn negotiated_mtu(&self, peer: LinkAddr) -> Option<u16> {
        self.lock_peers().get(&peer).map(|wire| wire.mtu)
    }

    fn disconnect(&self, peer: LinkAddr) {
        let removed = self.lock_peers().remove(&peer);
        if let Some(wire) = removed {
            let _ = wire.events.send(LinkEvent::Disconnected { addr: self.addr });
            let _ = self.events.send(LinkEvent::Disconnected { addr: peer });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> LinkAddr {
        LinkAddr([tag; 6])
    }

    #[tokio::test]
    async fn test_pair_delivers_bytes() {
        let (a, _a_rx) = MemoryLink::new(addr(1));
        let (b, mut b_rx) = MemoryLink::new(addr(2));
        MemoryLink::connect(&a, &b, 185);

        // Drain connection events.
        assert!(matches!(
            b_rx.recv().await,
            Some(LinkEvent::Connected { .. })
        ));
        assert!(matches!(
            b_rx.recv().await,
            Some(LinkEvent::MtuNegotiated { mtu: 185, .. })
        ));

        a.send(addr(2), b"ping").unwrap();
        match b_rx.recv().await {
            Some(LinkEvent::Inbound { addr: from, bytes }) => {
                assert_eq!(from, addr(1));
                assert_eq!(bytes, b"ping");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (a, _rx) = MemoryLink::new(addr(1));
        assert_eq!(a.send(addr(9), b"x"), Err(LinkError::Lost));
    }

    #[tokio::test]
    async fn test_over_mtu_rejected() {
        let (a, _a_rx) = MemoryLink::new(addr(1));
        let (b, _b_rx) = MemoryLink::new(addr(2));
        MemoryLink::connect(&a, &b, 32);
        assert_eq!(a.send(addr(2), &[0u8; 64]), Err(LinkError::Lost));
    }

    #[tokio::test]
    async fn test_partition_blocks_traffic() {
        let (a, _a_rx) = MemoryLink::new(addr(1));
        let (b, _b_rx) = MemoryLink::new(addr(2));
        MemoryLink::connect(&a, &b, 185);

        a.set_partitioned(true);
        assert_eq!(a.send(addr(2), b"x"), Err(LinkError::Lost));
        a.set_partitioned(false);
        assert!(a.send(addr(2), b"x").is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_sides() {
        let (a, mut a_rx) = MemoryLink::new(addr(1));
        let (b, mut b_rx) = MemoryLink::new(addr(2));
        MemoryLink::connect(&a, &b, 185);

        // Drain connect events.
        for rx in [&mut a_rx, &mut b_rx] {
            let _ = rx.recv().await;
            let _ = rx.recv().await;
        }

        a.disconnect(addr(2));
        assert!(matches!(
            a_rx.recv().await,
            Some(LinkEvent::Disconnected { .. })
        ));
        assert!(matches!(
            b_rx.recv().await,
            Some(LinkEvent::Disconnected { .. })
        ));
        assert_eq!(a.send(addr(2), b"x"), Err(LinkError::Lost));
    }
}
