//! Connection lifecycle and subsystem wiring.
//!
//! One explicit state machine per link:
//!
//! ```text
//! DISCONNECTED ──start──▶ SCANNING|ADVERTISING
//! SCANNING     ──found──▶ CONNECTING
//! ADVERTISING  ──accept─▶ CONNECTING
//! CONNECTING   ──ok────▶ MTU_NEGOTIATION
//! MTU_NEGOTIATION ──ok─▶ IDENTITY_EXCHANGE
//! IDENTITY_EXCHANGE ─ok▶ NOISE_HANDSHAKE
//! NOISE_HANDSHAKE ──ok─▶ READY
//! any ──error|timeout─▶ DISCONNECTING ──▶ DISCONNECTED
//! READY        ──bye──▶ DISCONNECTING
//! ```
//!
//! All link events arrive on one channel and are processed sequentially
//! per link. Entering READY triggers the outbox flush for the peer, the
//! queue-sync exchange, and a replay of any messages buffered during the
//! handshake. A failure on one link never aborts another.
//!
//! Payload layering: every wire emission is sealed under the hop session.
//! A message whose next hop is its final recipient needs nothing more (the
//! hop session is the end-to-end channel); a message entering the mesh is
//! additionally sealed under the session with its final recipient, and
//! that inner layer rides opaque through every intermediate node.

use crate::config::Config;
use crate::error::{Error, OutboxError};
use crate::fragment::{self, Reassembler};
use crate::identity::{ChatId, EphemeralId, IdentityAnnounce, PeerId, PeerRecord, SessionKey};
use crate::outbox::{
    Draft, MessageBody, MessageId, Outbox, OutboxEntry, OutboxEvent, OutboxStats, Priority,
};
use crate::registry::SessionRegistry;
use crate::relay::{RelayDecision, RelayDrop, RelayEngine, RelayEnvelope, RelayStatsSnapshot};
use crate::routing::RoutingOracle;
use crate::seen::SeenStore;
use crate::session::Session;
use crate::store::{IdentityStore, KvStore};
use crate::sync::{QueueSync, QueueSyncMessage};
use crate::wire::{self, PacketType};
use drift_crypto::StaticKeypair;
use drift_crypto::handshake::{Pattern, Role};
use drift_link::{Link, LinkAddr, LinkEvent};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;

/// Per-link connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No connection.
    Disconnected,
    /// Looking for peers (central role).
    Scanning,
    /// Accepting connections (peripheral role).
    Advertising,
    /// Link-layer connect in flight.
    Connecting,
    /// Waiting for the negotiated MTU.
    MtuNegotiation,
    /// Announces crossing.
    IdentityExchange,
    /// Noise messages crossing.
    NoiseHandshake,
    /// Session established; payload traffic flows.
    Ready,
    /// Teardown in progress.
    Disconnecting,
}

struct LinkContext {
    phase: LinkPhase,
    mtu: u16,
    peer: Option<PeerRecord>,
    deadline: Option<Instant>,
    held_inbound: Vec<Vec<u8>>,
}

impl LinkContext {
    fn new(phase: LinkPhase) -> Self {
        Self {
            phase,
            mtu: drift_link::mtu::DEFAULT_MTU,
            peer: None,
            deadline: None,
            held_inbound: Vec::new(),
        }
    }

    fn chat_id(&self) -> Option<ChatId> {
        self.peer.as_ref().map(PeerRecord::chat_id)
    }

    fn session_key(&self) -> Option<SessionKey> {
        self.peer.as_ref().map(PeerRecord::session_key)
    }
}

/// A message that reached its final recipient on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Content-addressed id from the relay metadata.
    pub id: MessageId,
    /// Original sender's chat identity.
    pub sender: ChatId,
    /// Decrypted end-to-end payload.
    pub payload: Vec<u8>,
}

/// Aggregated engine statistics.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    /// Relay engine counters.
    pub relay: RelayStatsSnapshot,
    /// Outbox counters.
    pub outbox: OutboxStats,
    /// Sessions held, any phase.
    pub sessions: usize,
    /// Links in READY.
    pub ready_links: usize,
}

/// The engine: owns every subsystem and drives them from link events.
pub struct Orchestrator {
    config: Config,
    keypair: StaticKeypair,
    local_chat: ChatId,
    local_ephemeral: EphemeralId,
    display_name: String,

    link: Arc<dyn Link>,
    identity_store: Arc<dyn IdentityStore>,

    registry: Arc<SessionRegistry>,
    outbox: Arc<Outbox>,
    relay: Arc<RelayEngine>,
    oracle: Arc<RoutingOracle>,
    seen: Arc<SeenStore>,
    sync: QueueSync,
    reassembler: Reassembler,

    links: HashMap<LinkAddr, LinkContext>,
    chat_to_addr: HashMap<ChatId, LinkAddr>,
    delivery: mpsc::UnboundedSender<DeliveredMessage>,
}

impl Orchestrator {
    /// Assemble the engine.
    ///
    /// Loads (or creates and saves) the local static key through the
    /// identity store, and opens the outbox over the KV store, the one
    /// mandatory blocking operation, performed at startup. Returns the
    /// engine plus the delivery sink and the outbox side channel.
    ///
    /// # Errors
    ///
    /// Propagates store failures; an inaccessible store refuses startup.
    pub fn new(
        config: Config,
        display_name: String,
        link: Arc<dyn Link>,
        kv_store: Arc<dyn KvStore>,
        identity_store: Arc<dyn IdentityStore>,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<DeliveredMessage>,
            mpsc::UnboundedReceiver<OutboxEvent>,
        ),
        Error,
    > {
        let keypair = match identity_store.load_static_key()? {
            Some((secret, _public)) => StaticKeypair::from_secret(secret),
            None => {
                let keypair = StaticKeypair::generate(&mut rand::rngs::OsRng);
                identity_store.save_static_key(keypair.secret(), keypair.public())?;
                keypair
            }
        };
        let local_chat = ChatId(*keypair.public());
        let local_ephemeral = EphemeralId(rand::thread_rng().r#gen());

        let (outbox, outbox_events) =
            Outbox::open(kv_store, crate::outbox::OutboxConfig::from(&config))?;
        let seen = Arc::new(SeenStore::new(config.seen_capacity, config.seen_window));
        let relay = Arc::new(RelayEngine::new(
            local_chat,
            seen.clone(),
            config.max_hops,
            config.relay_ttl.as_secs(),
            config.spam_rate_per_minute,
        ));
        let oracle = Arc::new(RoutingOracle::new(local_chat));
        let sync = QueueSync::new(local_chat, config.sync_fpr, config.sync_envelope_bytes);
        let reassembler = Reassembler::new(
            config.reassembly_max_buffers,
            config.reassembly_budget_bytes,
            config.fragment_timeout,
        );
        let (delivery, delivered) = mpsc::unbounded_channel();

        tracing::info!(node = %local_chat, "engine assembled");
        Ok((
            Self {
                config,
                keypair,
                local_chat,
                local_ephemeral,
                display_name,
                link,
                identity_store,
                registry: Arc::new(SessionRegistry::new()),
                outbox: Arc::new(outbox),
                relay,
                oracle,
                seen,
                sync,
                reassembler,
                links: HashMap::new(),
                chat_to_addr: HashMap::new(),
                delivery,
            },
            delivered,
            outbox_events,
        ))
    }

    /// The local chat identity.
    #[must_use]
    pub fn local_chat(&self) -> ChatId {
        self.local_chat
    }

    /// Shared handle to the outbox.
    #[must_use]
    pub fn outbox(&self) -> Arc<Outbox> {
        self.outbox.clone()
    }

    /// Shared handle to the seen-message store, for delivery and read
    /// bookkeeping by the host.
    #[must_use]
    pub fn seen(&self) -> Arc<SeenStore> {
        self.seen.clone()
    }

    /// The local identity announce, also usable as the QR payload.
    #[must_use]
    pub fn announce(&self) -> IdentityAnnounce {
        IdentityAnnounce {
            public_key: *self.keypair.public(),
            ephemeral_id: Some(self.local_ephemeral),
            display_name: self.display_name.clone(),
            noise_static_public_key: Some(*self.keypair.public()),
        }
    }

    /// Current phase of a link.
    #[must_use]
    pub fn link_phase(&self, addr: LinkAddr) -> LinkPhase {
        self.links
            .get(&addr)
            .map_or(LinkPhase::Disconnected, |ctx| ctx.phase)
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            relay: self.relay.stats(),
            outbox: self.outbox.stats(),
            sessions: self.registry.len(),
            ready_links: self
                .links
                .values()
                .filter(|ctx| ctx.phase == LinkPhase::Ready)
                .count(),
        }
    }

    /// Chat identities of peers with a READY link right now.
    #[must_use]
    pub fn ready_chats(&self) -> Vec<ChatId> {
        self.links
            .values()
            .filter(|ctx| ctx.phase == LinkPhase::Ready)
            .filter_map(LinkContext::chat_id)
            .collect()
    }

    /// Queue a message to a recipient. Offline-first: the entry always
    /// lands in the outbox; if the recipient or a route is available it
    /// is dispatched immediately.
    ///
    /// # Errors
    ///
    /// Surfaces outbox admission failures to the sender.
    pub fn send_message(
        &mut self,
        recipient: ChatId,
        content: &[u8],
        priority: Priority,
        now: Instant,
        now_sys: SystemTime,
    ) -> Result<MessageId, OutboxError> {
        // The id and relay header are fixed at origination over the user
        // content; encryption happens at dispatch, once the path is known.
        let envelope = self
            .relay
            .wrap_outbound(content.to_vec(), recipient, now_sys);
        let id = envelope.metadata.original_message_id;

        let draft = Draft {
            chat_id: recipient,
            recipient,
            sender: self.local_chat,
            body: MessageBody::Deferred(content.to_vec()),
            priority,
            relay: Some(envelope.metadata),
            id: Some(id),
        };
        let id = self.outbox.enqueue(draft, now_sys)?;
        self.dispatch_ready(now, now_sys);
        Ok(id)
    }

    /// Feed one link event through the state machine.
    pub fn handle_event(&mut self, event: LinkEvent, now: Instant, now_sys: SystemTime) {
        match event {
            LinkEvent::PeerDiscovered { addr } => self.on_discovered(addr, now),
            LinkEvent::Connected { addr } => self.on_connected(addr, now),
            LinkEvent::MtuNegotiated { addr, mtu } => self.on_mtu(addr, mtu, now),
            LinkEvent::Inbound { addr, bytes } => self.on_inbound(addr, bytes, now, now_sys),
            LinkEvent::Disconnected { addr } => self.on_disconnected(addr),
        }
    }

    /// Deadline sweep plus the outbox worker's scan. Call at a bounded
    /// cadence; once per second is sufficient.
    pub fn tick(&mut self, now: Instant, now_sys: SystemTime) {
        for (peer, fragment_id) in self.reassembler.expire(now) {
            tracing::debug!(peer = %peer, fragment_id, "fragment reassembly timed out");
        }

        let overdue: Vec<LinkAddr> = self
            .links
            .iter()
            .filter(|(_, ctx)| ctx.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in overdue {
            self.fail_link(addr, "phase deadline exceeded");
        }

        self.maintain_sessions(now);
        self.dispatch_ready(now, now_sys);
    }

    /// Persist the outbox and zeroize all cipher states. The engine is
    /// inert afterwards.
    pub fn shutdown(&mut self) {
        if let Err(error) = self.outbox.persist_all() {
            tracing::warn!(%error, "outbox drain on shutdown failed");
        }
        let addrs: Vec<LinkAddr> = self.links.keys().copied().collect();
        for addr in addrs {
            self.link.disconnect(addr);
        }
        self.links.clear();
        self.chat_to_addr.clear();
        self.registry.clear();
        tracing::info!("engine shut down");
    }

    // ---- state machine steps ----

    fn on_discovered(&mut self, addr: LinkAddr, now: Instant) {
        if self.links.len() >= self.config.max_links {
            tracing::debug!(peer = %addr, "ignoring discovery at link capacity");
            return;
        }
        let connect_timeout = self.config.connect_timeout;
        let ctx = self
            .links
            .entry(addr)
            .or_insert_with(|| LinkContext::new(LinkPhase::Scanning));
        if matches!(ctx.phase, LinkPhase::Scanning | LinkPhase::Disconnected) {
            ctx.phase = LinkPhase::Connecting;
            ctx.deadline = Some(now + connect_timeout);
        }
    }

    fn on_connected(&mut self, addr: LinkAddr, now: Instant) {
        if self.links.len() >= self.config.max_links && !self.links.contains_key(&addr) {
            tracing::warn!(peer = %addr, "refusing connection at link capacity");
            self.link.disconnect(addr);
            return;
        }
        let mtu_timeout = self.config.mtu_timeout;
        let ctx = self
            .links
            .entry(addr)
            .or_insert_with(|| LinkContext::new(LinkPhase::Advertising));
        ctx.phase = LinkPhase::MtuNegotiation;
        ctx.deadline = Some(now + mtu_timeout);
        tracing::debug!(peer = %addr, "connected, negotiating MTU");
    }

    fn on_mtu(&mut self, addr: LinkAddr, mtu: u16, now: Instant) {
        let identity_timeout = self.config.identity_timeout;
        {
            let Some(ctx) = self.links.get_mut(&addr) else {
                return;
            };
            ctx.mtu = mtu;
            ctx.phase = LinkPhase::IdentityExchange;
            ctx.deadline = Some(now + identity_timeout);
        }

        let announce = self.announce();
        match announce.to_bytes() {
            Ok(payload) => {
                if let Err(error) = self.send_packet(addr, PacketType::Identity, &payload) {
                    tracing::warn!(peer = %addr, %error, "identity announce failed");
                    self.fail_link(addr, "identity announce failed");
                }
            }
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "identity announce encode failed");
                self.fail_link(addr, "identity announce encode failed");
            }
        }
    }

    fn on_inbound(&mut self, addr: LinkAddr, bytes: Vec<u8>, now: Instant, now_sys: SystemTime) {
        let phase = self.link_phase(addr);
        match phase {
            LinkPhase::IdentityExchange => {
                if let Ok((PacketType::Identity, payload)) = wire::decode_packet(&bytes) {
                    let payload = payload.to_vec();
                    self.on_identity(addr, &payload, now);
                } else {
                    // Early traffic raced ahead of the announce; replay it
                    // once the handshake completes.
                    self.hold_inbound(addr, bytes);
                }
            }
            LinkPhase::NoiseHandshake => {
                if let Ok((PacketType::Handshake, payload)) = wire::decode_packet(&bytes) {
                    let payload = payload.to_vec();
                    self.on_handshake_message(addr, &payload, now, now_sys);
                } else {
                    self.hold_inbound(addr, bytes);
                }
            }
            LinkPhase::Ready => self.on_ready_inbound(addr, &bytes, now, now_sys),
            _ => {
                tracing::debug!(peer = %addr, ?phase, "dropping traffic outside session phases");
            }
        }
    }

    fn on_identity(&mut self, addr: LinkAddr, payload: &[u8], now: Instant) {
        let announce = match IdentityAnnounce::from_bytes(payload) {
            Ok(announce) => announce,
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "malformed identity announce");
                self.fail_link(addr, "malformed identity announce");
                return;
            }
        };

        let peer_id = PeerId(announce.public_key);
        let mut record = match self.identity_store.load_peer(&peer_id) {
            Ok(Some(record)) => record,
            Ok(None) => PeerRecord::new(peer_id),
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "peer record load failed");
                PeerRecord::new(peer_id)
            }
        };
        if let Some(ephemeral) = announce.ephemeral_id {
            record.begin_session(ephemeral);
        }
        if !announce.display_name.is_empty() {
            record.display_name = Some(announce.display_name.clone());
        }
        if let Err(error) = self.identity_store.save_peer(&record) {
            tracing::warn!(peer = %addr, %error, "peer record save failed");
        }

        let chat = record.chat_id();
        let session_key = record.session_key();
        // Deterministic role assignment: the lexicographically smaller
        // public key initiates.
        let initiator = self.keypair.public().as_slice() < announce.public_key.as_slice();

        let handshake_timeout = self.config.handshake_timeout;
        if let Some(ctx) = self.links.get_mut(&addr) {
            ctx.peer = Some(record);
            ctx.phase = LinkPhase::NoiseHandshake;
            ctx.deadline = Some(now + handshake_timeout);
        }
        self.chat_to_addr.insert(chat, addr);

        let role = if initiator {
            Role::Initiator
        } else {
            Role::Responder
        };
        let session = match Session::begin(
            Pattern::Xx,
            role,
            self.keypair.clone(),
            None,
            now,
            handshake_timeout,
        ) {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "handshake init failed");
                self.fail_link(addr, "handshake init failed");
                return;
            }
        };
        self.registry.insert(session_key, chat, session);

        if initiator {
            self.advance_handshake(addr);
        }
        tracing::debug!(peer = %addr, chat = %chat, initiator, "identity exchanged");
    }

    fn on_handshake_message(
        &mut self,
        addr: LinkAddr,
        payload: &[u8],
        now: Instant,
        now_sys: SystemTime,
    ) {
        let Some(session_key) = self.links.get(&addr).and_then(LinkContext::session_key) else {
            self.fail_link(addr, "handshake before identity");
            return;
        };
        let read = match self.registry.get(&session_key) {
            Some(session) => match session.lock() {
                Ok(mut guard) => guard.read_handshake(payload).map(|_| ()),
                Err(_) => Err(crate::error::SessionError::NotEstablished),
            },
            None => {
                self.fail_link(addr, "handshake without session");
                return;
            }
        };
        if let Err(error) = read {
            tracing::warn!(peer = %addr, %error, "handshake message rejected");
            self.registry.remove(&session_key);
            self.fail_link(addr, "handshake failed");
            return;
        }

        self.advance_handshake(addr);
        self.try_establish(addr, now, now_sys);
    }

    /// Write and send our next handshake message if it is our turn.
    fn advance_handshake(&mut self, addr: LinkAddr) {
        let Some(session_key) = self.links.get(&addr).and_then(LinkContext::session_key) else {
            return;
        };
        let message = match self.registry.get(&session_key) {
            Some(session) => match session.lock() {
                Ok(mut guard) => {
                    if !guard.handshake_wants_write() {
                        return;
                    }
                    guard.write_handshake(&[], &mut rand::rngs::OsRng)
                }
                Err(_) => return,
            },
            None => return,
        };
        match message {
            Ok(bytes) => {
                if let Err(error) = self.send_packet(addr, PacketType::Handshake, &bytes) {
                    tracing::warn!(peer = %addr, %error, "handshake send failed");
                    self.registry.remove(&session_key);
                    self.fail_link(addr, "handshake send failed");
                }
            }
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "handshake write failed");
                self.registry.remove(&session_key);
                self.fail_link(addr, "handshake write failed");
            }
        }
    }

    fn try_establish(&mut self, addr: LinkAddr, now: Instant, now_sys: SystemTime) {
        let Some(session_key) = self.links.get(&addr).and_then(LinkContext::session_key) else {
            return;
        };
        let Some(chat) = self.links.get(&addr).and_then(LinkContext::chat_id) else {
            return;
        };

        let complete = match self.registry.get(&session_key) {
            Some(session) => session
                .lock()
                .map(|guard| guard.handshake_complete())
                .unwrap_or(false),
            None => false,
        };
        if !complete {
            return;
        }

        // Swap the handshake for the established session atomically. The
        // registry handle is the only live reference at this point.
        let Some(handle) = self.registry.remove(&session_key) else {
            return;
        };
        let Ok(inner) = Arc::try_unwrap(handle) else {
            self.fail_link(addr, "session still borrowed at establishment");
            return;
        };
        let handshaking = match inner.into_inner() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        };
        let established = match handshaking.establish(now) {
            Ok(established) => established,
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "session split failed");
                self.fail_link(addr, "session split failed");
                return;
            }
        };

        // The XX handshake authenticated the peer's static key; record
        // the verified upgrade.
        if let Some(remote_static) = established.remote_static() {
            let mut save = None;
            if let Some(ctx) = self.links.get_mut(&addr) {
                if let Some(record) = ctx.peer.as_mut() {
                    if record.upgrade_security(remote_static).is_err() {
                        tracing::warn!(peer = %addr, "peer presented a different static key");
                    } else {
                        save = Some(record.clone());
                    }
                }
            }
            if let Some(record) = save {
                if let Err(error) = self.identity_store.save_peer(&record) {
                    tracing::warn!(peer = %addr, %error, "peer record save failed");
                }
            }
        }

        // The security upgrade may have moved the chat identity from the
        // first-observed key to the persistent static key.
        let chat = match self.links.get(&addr).and_then(LinkContext::chat_id) {
            Some(current) if current != chat => {
                self.chat_to_addr.remove(&chat);
                self.chat_to_addr.insert(current, addr);
                current
            }
            _ => chat,
        };

        self.registry.insert(session_key, chat, established);
        if let Some(ctx) = self.links.get_mut(&addr) {
            ctx.phase = LinkPhase::Ready;
            ctx.deadline = None;
        }
        tracing::info!(peer = %addr, chat = %chat, "session established");
        self.on_ready(addr, chat, now, now_sys);
    }

    fn on_ready(&mut self, addr: LinkAddr, chat: ChatId, now: Instant, now_sys: SystemTime) {
        self.oracle.note_connected(chat, now);

        // (a) flush queued traffic for this peer.
        let batch = self.outbox.flush_for_peer(&chat, now_sys);
        for entry in batch {
            self.dispatch_entry(&entry, now_sys);
        }

        // (b) start queue reconciliation.
        let request = self.sync.request(&self.outbox);
        self.send_sync_message(&chat, &request);

        // (c) replay anything held during the handshake.
        let held = self
            .links
            .get_mut(&addr)
            .map(|ctx| std::mem::take(&mut ctx.held_inbound))
            .unwrap_or_default();
        for bytes in held {
            self.on_ready_inbound(addr, &bytes, now, now_sys);
        }

        // Share our adjacency with the new neighbor.
        self.send_adjacency_report(&chat);
    }

    fn on_ready_inbound(
        &mut self,
        addr: LinkAddr,
        bytes: &[u8],
        now: Instant,
        now_sys: SystemTime,
    ) {
        let Some(chat) = self.links.get(&addr).and_then(LinkContext::chat_id) else {
            return;
        };
        self.oracle.record_receive(&chat);

        if fragment::is_fragment(bytes) {
            let peer = self
                .links
                .get(&addr)
                .and_then(|ctx| ctx.peer.as_ref())
                .map_or_else(|| placeholder_peer(addr), |record| record.peer_id);
            match self.reassembler.accept(peer, bytes, now) {
                Ok(Some(complete)) => {
                    self.on_sealed_payload(
                        addr,
                        chat,
                        complete.inner_type,
                        &complete.payload,
                        now,
                        now_sys,
                    );
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(peer = %addr, %error, "fragment rejected");
                }
            }
            return;
        }

        match wire::decode_packet(bytes) {
            Ok((packet_type, payload)) => {
                let payload = payload.to_vec();
                self.on_sealed_payload(addr, chat, packet_type as u8, &payload, now, now_sys);
            }
            Err(error) => {
                tracing::debug!(peer = %addr, %error, "malformed packet");
            }
        }
    }

    /// Decrypt a sealed per-hop payload and route it by inner type.
    fn on_sealed_payload(
        &mut self,
        addr: LinkAddr,
        chat: ChatId,
        inner_type: u8,
        sealed: &[u8],
        now: Instant,
        now_sys: SystemTime,
    ) {
        let Ok(packet_type) = PacketType::try_from(inner_type) else {
            tracing::debug!(peer = %addr, inner_type, "unknown inner type");
            return;
        };

        let Some(plaintext) = self.decrypt_from(&chat, sealed) else {
            tracing::debug!(peer = %addr, "payload failed to decrypt, dropping packet");
            return;
        };

        match packet_type {
            PacketType::UserMessage => self.on_user_message(addr, chat, &plaintext, now, now_sys),
            PacketType::RelayAck => self.on_relay_ack(&plaintext, now),
            PacketType::QueueSync => self.on_queue_sync(&chat, &plaintext, now_sys),
            PacketType::Ping => self.on_ping(&chat, &plaintext, now),
            PacketType::Identity | PacketType::Handshake => {
                tracing::debug!(peer = %addr, "session-phase packet after READY ignored");
            }
        }
    }

    fn on_user_message(
        &mut self,
        addr: LinkAddr,
        from: ChatId,
        plaintext: &[u8],
        now: Instant,
        now_sys: SystemTime,
    ) {
        let envelope = match RelayEnvelope::from_bytes(plaintext) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::debug!(peer = %addr, %error, "malformed relay envelope");
                return;
            }
        };
        let id = envelope.metadata.original_message_id;
        let available = self.ready_chats();
        let decision = self
            .relay
            .classify(envelope, Some(&from), &self.oracle, &available, now);

        match decision {
            RelayDecision::DeliverLocal(envelope) => {
                let sender = envelope.metadata.original_sender;
                let payload = if envelope.end_to_end {
                    match self.decrypt_from(&sender, &envelope.payload) {
                        Some(payload) => payload,
                        None => {
                            tracing::warn!(
                                peer = %addr,
                                id = %id,
                                "end-to-end layer failed to open, message lost"
                            );
                            return;
                        }
                    }
                } else {
                    envelope.payload
                };
                let _ = self.delivery.send(DeliveredMessage {
                    id,
                    sender,
                    payload,
                });
                self.seen.mark_delivered(id.fingerprint(), now);
                self.send_ack(&from, &id);
            }
            RelayDecision::Forward { next_hop, envelope } => {
                if self.emit_envelope(&next_hop, &envelope) {
                    self.send_ack(&from, &id);
                } else if self.park_envelope(envelope, now_sys) {
                    self.send_ack(&from, &id);
                }
            }
            RelayDecision::Park(envelope) => {
                if self.park_envelope(envelope, now_sys) {
                    self.send_ack(&from, &id);
                }
            }
            RelayDecision::Drop(reason) => {
                if reason == RelayDrop::Duplicate {
                    // Already handled once; ack so the peer stops resending.
                    self.send_ack(&from, &id);
                }
                tracing::trace!(peer = %addr, ?reason, "relay drop");
            }
        }
    }

    fn on_relay_ack(&mut self, payload: &[u8], now: Instant) {
        if payload.len() != 16 {
            return;
        }
        let mut raw = [0u8; 16];
        raw.copy_from_slice(payload);
        let id = MessageId(raw);
        self.seen.mark_delivered(id.fingerprint(), now);
        match self.outbox.mark_delivered(&id) {
            Ok(()) => tracing::debug!(id = %id, "delivery acknowledged"),
            Err(OutboxError::UnknownMessage) => {}
            Err(error) => tracing::debug!(id = %id, %error, "ack not applied"),
        }
    }

    fn on_queue_sync(&mut self, from: &ChatId, payload: &[u8], now_sys: SystemTime) {
        let message = match QueueSyncMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(peer = %from, %error, "malformed sync message");
                return;
            }
        };
        match self.sync.handle(message, &self.outbox, now_sys) {
            Ok(Some(reply)) => self.send_sync_message(from, &reply),
            Ok(None) => {}
            Err(error) => tracing::debug!(peer = %from, %error, "sync exchange failed"),
        }
    }

    fn on_ping(&mut self, from: &ChatId, payload: &[u8], now: Instant) {
        // Keepalives double as adjacency gossip.
        if let Ok(neighbors) = bincode::deserialize::<Vec<ChatId>>(payload) {
            self.oracle.update_adjacency(*from, &neighbors, now);
        }
    }

    fn on_disconnected(&mut self, addr: LinkAddr) {
        let Some(ctx) = self.links.remove(&addr) else {
            return;
        };
        if let Some(mut record) = ctx.peer {
            let session_key = record.session_key();
            let chat = record.chat_id();

            // Sessions survive link loss for offline end-to-end sealing;
            // they are destroyed only on explicit peer removal and
            // replaced by the next handshake. Only an unfinished
            // handshake is discarded here.
            let established = self
                .registry
                .get(&session_key)
                .and_then(|session| {
                    session
                        .lock()
                        .ok()
                        .map(|guard| guard.is_established())
                })
                .unwrap_or(false);
            if established {
                self.registry
                    .rebind(&session_key, SessionKey::Static(record.peer_id), chat);
            } else {
                self.registry.remove(&session_key);
            }

            self.chat_to_addr.remove(&chat);
            self.oracle.note_disconnected(&chat);
            record.end_session();
            if let Err(error) = self.identity_store.save_peer(&record) {
                tracing::warn!(peer = %addr, %error, "peer record save failed");
            }
        }
        tracing::info!(peer = %addr, "link down");
    }

    fn fail_link(&mut self, addr: LinkAddr, reason: &str) {
        tracing::warn!(peer = %addr, reason, "link failed");
        if let Some(ctx) = self.links.get_mut(&addr) {
            ctx.phase = LinkPhase::Disconnecting;
        }
        self.link.disconnect(addr);
        self.on_disconnected(addr);
    }

    // ---- outbound paths ----

    /// Scan ready outbox entries and dispatch what routes exist.
    fn dispatch_ready(&mut self, _now: Instant, now_sys: SystemTime) {
        for entry in self.outbox.dequeue_ready(now_sys) {
            self.dispatch_entry(&entry, now_sys);
        }
    }

    fn dispatch_entry(&mut self, entry: &OutboxEntry, now_sys: SystemTime) {
        let ready = self.ready_chats();
        if ready.is_empty() {
            return;
        }

        // Prefer the recipient directly, otherwise ask the oracle.
        let direct = ready.contains(&entry.recipient);
        let target = if direct {
            Some(entry.recipient)
        } else {
            self.oracle
                .choose_next_hop(&entry.recipient, &ready, entry.priority)
        };
        let Some(target) = target else {
            return;
        };

        // Resolve the payload for the chosen path. A direct deferred body
        // rides under the hop seal alone; a relayed one needs the inner
        // end-to-end seal first, which needs a session with the
        // recipient.
        let (payload, end_to_end) = match (&entry.body, direct) {
            (MessageBody::Deferred(plaintext), true) => (plaintext.clone(), false),
            (MessageBody::Deferred(plaintext), false) => {
                let Some(ciphertext) = self.encrypt_for(&entry.recipient, plaintext) else {
                    // No session with the recipient yet; stays deferred.
                    return;
                };
                if let Err(error) = self.outbox.attach_ciphertext(&entry.id, ciphertext.clone()) {
                    tracing::warn!(id = %entry.id, %error, "ciphertext attach failed");
                    return;
                }
                (ciphertext, true)
            }
            (MessageBody::Ciphertext(ciphertext), _) => (ciphertext.clone(), true),
        };

        let Some(metadata) = entry.relay.clone() else {
            tracing::warn!(id = %entry.id, "entry without relay metadata, skipping");
            return;
        };
        // Forwarding parked foreign traffic counts as a hop; locally
        // originated messages leave at hop zero.
        let metadata = if metadata.original_sender == self.local_chat {
            metadata
        } else {
            let mut forwarded = metadata;
            forwarded.hop_count = forwarded.hop_count.saturating_add(1);
            forwarded
        };

        let envelope = RelayEnvelope {
            metadata,
            end_to_end,
            payload,
        };

        if self.outbox.mark_sending(&entry.id).is_err() {
            return;
        }
        if self.emit_envelope(&target, &envelope) {
            let _ = self.outbox.mark_awaiting_ack(&entry.id);
        } else if let Err(error) = self.outbox.mark_failed(&entry.id, "send failed", now_sys) {
            tracing::debug!(id = %entry.id, %error, "failure not recorded");
        }
    }

    /// Seal an envelope for a hop peer and put it on the wire, fragmented
    /// to the link MTU when needed.
    fn emit_envelope(&mut self, hop: &ChatId, envelope: &RelayEnvelope) -> bool {
        let Ok(plaintext) = envelope.to_bytes() else {
            return false;
        };
        let ttl = envelope
            .metadata
            .max_hops
            .saturating_sub(envelope.metadata.hop_count);
        self.send_sealed(hop, PacketType::UserMessage, &plaintext, ttl)
    }

    fn park_envelope(&mut self, envelope: RelayEnvelope, now_sys: SystemTime) -> bool {
        if !envelope.end_to_end {
            // Foreign plaintext is never held; a conforming sender seals
            // anything that enters the mesh.
            self.relay.record_no_route();
            return false;
        }
        let draft = Draft {
            chat_id: envelope.metadata.original_sender,
            recipient: envelope.metadata.final_recipient,
            sender: envelope.metadata.original_sender,
            body: MessageBody::Ciphertext(envelope.payload),
            priority: Priority::Normal,
            id: Some(envelope.metadata.original_message_id),
            relay: Some(envelope.metadata),
        };
        match self.outbox.enqueue(draft, now_sys) {
            Ok(id) => {
                tracing::debug!(id = %id, "relay parked for later");
                true
            }
            Err(error) => {
                tracing::debug!(%error, "relay could not be parked");
                self.relay.record_no_route();
                false
            }
        }
    }

    fn send_ack(&mut self, to: &ChatId, id: &MessageId) {
        let payload = *id.as_bytes();
        if !self.send_sealed(to, PacketType::RelayAck, &payload, 1) {
            tracing::debug!(peer = %to, id = %id, "ack not sent");
        }
    }

    fn send_sync_message(&mut self, to: &ChatId, message: &QueueSyncMessage) {
        match message.to_bytes() {
            Ok(payload) => {
                if !self.send_sealed(to, PacketType::QueueSync, &payload, 1) {
                    tracing::debug!(peer = %to, "sync message not sent");
                }
            }
            Err(error) => tracing::debug!(peer = %to, %error, "sync encode failed"),
        }
    }

    fn send_adjacency_report(&mut self, to: &ChatId) {
        let neighbors: Vec<ChatId> = self
            .ready_chats()
            .into_iter()
            .filter(|chat| chat != to)
            .collect();
        match bincode::serialize(&neighbors) {
            Ok(payload) => {
                let _ = self.send_sealed(to, PacketType::Ping, &payload, 1);
            }
            Err(error) => tracing::debug!(%error, "adjacency encode failed"),
        }
    }

    /// Encrypt under the hop session and frame for the link: one packet
    /// when it fits the MTU, a fragment stream otherwise.
    fn send_sealed(
        &mut self,
        to: &ChatId,
        packet_type: PacketType,
        plaintext: &[u8],
        ttl: u8,
    ) -> bool {
        let Some(addr) = self.chat_to_addr.get(to).copied() else {
            return false;
        };
        let Some(sealed) = self.encrypt_for(to, plaintext) else {
            return false;
        };
        let mtu = self
            .links
            .get(&addr)
            .map_or(drift_link::mtu::DEFAULT_MTU, |ctx| ctx.mtu);

        let ok = if sealed.len() + wire::HEADER_LEN <= mtu as usize {
            match wire::encode_packet(packet_type, &sealed) {
                Ok(packet) => self.link.send(addr, &packet).is_ok(),
                Err(_) => false,
            }
        } else {
            let fragment_id: u64 = rand::thread_rng().r#gen();
            match fragment::fragment(&sealed, mtu, fragment_id, ttl, packet_type as u8, &to.0) {
                Ok(fragments) => fragments
                    .iter()
                    .all(|packet| self.link.send(addr, packet).is_ok()),
                Err(error) => {
                    tracing::debug!(peer = %to, %error, "fragmentation failed");
                    false
                }
            }
        };
        self.oracle.record_send_result(to, ok);
        ok
    }

    fn send_packet(
        &mut self,
        addr: LinkAddr,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), Error> {
        let packet = wire::encode_packet(packet_type, payload)?;
        self.link.send(addr, &packet)?;
        Ok(())
    }

    // ---- session helpers ----

    fn encrypt_for(&self, chat: &ChatId, plaintext: &[u8]) -> Option<Vec<u8>> {
        let session = self.registry.get_by_chat(chat)?;
        let mut guard = session.lock().ok()?;
        guard.encrypt(b"", plaintext).ok()
    }

    fn decrypt_from(&self, chat: &ChatId, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let session = self.registry.get_by_chat(chat)?;
        let mut guard = session.lock().ok()?;
        guard.decrypt(b"", ciphertext).ok()
    }

    fn maintain_sessions(&mut self, now: Instant) {
        let chats: Vec<ChatId> = self.registry.established_chats();
        for chat in chats {
            let Some(session) = self.registry.get_by_chat(&chat) else {
                continue;
            };
            let Ok(mut guard) = session.lock() else {
                continue;
            };
            if guard.needs_counter_rekey(self.config.rekey_messages) {
                if let Err(error) = guard.rekey(now) {
                    tracing::warn!(chat = %chat, %error, "rekey failed");
                }
            } else if guard.needs_age_rekey(now, self.config.rekey_age) {
                drop(guard);
                // Wall clocks do not ratchet in lockstep; replace the
                // session with a fresh handshake instead.
                if let Some(addr) = self.chat_to_addr.get(&chat).copied() {
                    tracing::info!(chat = %chat, "session aged out, re-handshaking");
                    self.fail_link(addr, "session age rekey");
                }
            }
        }
    }

    fn hold_inbound(&mut self, addr: LinkAddr, bytes: Vec<u8>) {
        if let Some(ctx) = self.links.get_mut(&addr) {
            ctx.held_inbound.push(bytes);
        }
    }
}

fn placeholder_peer(addr: LinkAddr) -> PeerId {
    let mut bytes = [0u8; 32];
    bytes[..6].copy_from_slice(addr.as_bytes());
    PeerId(bytes)
}

/// Drive the engine until shutdown is signalled: link events as they
/// arrive, the deadline/outbox tick at the configured cadence.
pub async fn run(
    mut engine: Orchestrator,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    let scan_interval = engine.config.outbox_scan_interval;
    let mut ticker = tokio::time::interval(scan_interval);
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => engine.handle_event(event, Instant::now(), SystemTime::now()),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                engine.tick(Instant::now(), SystemTime::now());
            }
            _ = &mut shutdown => {
                break;
            }
        }
    }
    engine.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryIdentityStore, MemoryStore};
    use drift_link::memory::MemoryLink;
    use std::time::Duration;

    fn addr(tag: u8) -> LinkAddr {
        LinkAddr([tag; 6])
    }

    struct Node {
        engine: Orchestrator,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        delivered: mpsc::UnboundedReceiver<DeliveredMessage>,
        link: Arc<MemoryLink>,
    }

    fn node(tag: u8) -> Node {
        let (link, events) = MemoryLink::new(addr(tag));
        let (engine, delivered, _outbox_events) = Orchestrator::new(
            Config::default(),
            format!("node-{tag}"),
            link.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryIdentityStore::new()),
        )
        .unwrap();
        Node {
            engine,
            events,
            delivered,
            link,
        }
    }

    /// Pump queued link events through both engines until quiescent.
    fn pump(a: &mut Node, b: &mut Node, now: Instant, now_sys: SystemTime) {
        for _ in 0..64 {
            let mut progressed = false;
            while let Ok(event) = a.events.try_recv() {
                a.engine.handle_event(event, now, now_sys);
                progressed = true;
            }
            while let Ok(event) = b.events.try_recv() {
                b.engine.handle_event(event, now, now_sys);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn connect(a: &mut Node, b: &mut Node, now: Instant, now_sys: SystemTime) {
        MemoryLink::connect(&a.link, &b.link, 185);
        pump(a, b, now, now_sys);
    }

    #[test]
    fn test_two_nodes_reach_ready() {
        let mut a = node(1);
        let mut b = node(2);
        let now = Instant::now();
        let now_sys = SystemTime::now();

        connect(&mut a, &mut b, now, now_sys);

        assert_eq!(a.engine.link_phase(addr(2)), LinkPhase::Ready);
        assert_eq!(b.engine.link_phase(addr(1)), LinkPhase::Ready);
        assert_eq!(a.engine.ready_chats(), vec![b.engine.local_chat()]);
        assert_eq!(a.engine.stats().sessions, 1);
        assert_eq!(a.engine.stats().ready_links, 1);
    }

    #[test]
    fn test_direct_message_delivery() {
        let mut a = node(1);
        let mut b = node(2);
        let now = Instant::now();
        let now_sys = SystemTime::now();
        connect(&mut a, &mut b, now, now_sys);

        let recipient = b.engine.local_chat();
        let id = a
            .engine
            .send_message(recipient, b"hello drift", Priority::Normal, now, now_sys)
            .unwrap();
        pump(&mut a, &mut b, now, now_sys);

        let delivered = b.delivered.try_recv().unwrap();
        assert_eq!(delivered.id, id);
        assert_eq!(delivered.sender, a.engine.local_chat());
        assert_eq!(delivered.payload, b"hello drift");

        // The ack flowed back and the entry is terminal.
        assert_eq!(
            a.engine.outbox.get(&id).unwrap().status,
            crate::outbox::Status::Delivered
        );
    }

    #[test]
    fn test_offline_queue_flush_in_priority_order() {
        let mut a = node(1);
        let mut b = node(2);
        let now = Instant::now();
        let now_sys = SystemTime::now();

        // B's chat identity is known out of band (QR); no link exists.
        let recipient = b.engine.local_chat();
        a.engine
            .send_message(recipient, b"urgent", Priority::Urgent, now, now_sys)
            .unwrap();
        a.engine
            .send_message(recipient, b"normal", Priority::Normal, now, now_sys)
            .unwrap();
        a.engine
            .send_message(recipient, b"low", Priority::Low, now, now_sys)
            .unwrap();

        // Disconnected: nothing transmitted, three entries held.
        assert_eq!(a.engine.stats().outbox.held, 3);
        assert!(a.engine.ready_chats().is_empty());

        connect(&mut a, &mut b, now, now_sys);

        let mut payloads = Vec::new();
        while let Ok(message) = b.delivered.try_recv() {
            payloads.push(message.payload);
        }
        assert_eq!(
            payloads,
            vec![b"urgent".to_vec(), b"normal".to_vec(), b"low".to_vec()]
        );
    }

    #[test]
    fn test_large_payload_fragments_and_reassembles() {
        let mut a = node(1);
        let mut b = node(2);
        let now = Instant::now();
        let now_sys = SystemTime::now();
        connect(&mut a, &mut b, now, now_sys);

        let recipient = b.engine.local_chat();
        let big: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        a.engine
            .send_message(recipient, &big, Priority::Normal, now, now_sys)
            .unwrap();
        pump(&mut a, &mut b, now, now_sys);

        let delivered = b.delivered.try_recv().unwrap();
        assert_eq!(delivered.payload, big);
    }

    #[test]
    fn test_disconnect_parks_session_and_clears_link() {
        let mut a = node(1);
        let mut b = node(2);
        let now = Instant::now();
        let now_sys = SystemTime::now();
        connect(&mut a, &mut b, now, now_sys);
        assert_eq!(a.engine.stats().sessions, 1);

        a.link.disconnect(addr(2));
        pump(&mut a, &mut b, now, now_sys);

        assert_eq!(a.engine.link_phase(addr(2)), LinkPhase::Disconnected);
        assert!(a.engine.ready_chats().is_empty());
        // The established session survives under the stable key for
        // offline end-to-end sealing.
        assert_eq!(a.engine.stats().sessions, 1);
        assert!(
            a.engine
                .registry
                .get_by_chat(&b.engine.local_chat())
                .is_some()
        );
    }

    #[test]
    fn test_shutdown_drains_and_zeroizes() {
        let mut a = node(1);
        let mut b = node(2);
        let now = Instant::now();
        let now_sys = SystemTime::now();
        connect(&mut a, &mut b, now, now_sys);

        a.engine
            .send_message(
                b.engine.local_chat(),
                b"parked",
                Priority::Normal,
                now,
                now_sys,
            )
            .unwrap();
        a.engine.shutdown();
        assert_eq!(a.engine.stats().sessions, 0);
        assert!(a.engine.ready_chats().is_empty());
    }

    #[test]
    fn test_link_capacity_bound() {
        let mut hub = node(0);
        let now = Instant::now();
        let now_sys = SystemTime::now();

        // Discoveries beyond the cap are ignored.
        for tag in 1..=9u8 {
            hub.engine
                .handle_event(LinkEvent::PeerDiscovered { addr: addr(tag) }, now, now_sys);
        }
        let connecting = (1..=9u8)
            .filter(|tag| hub.engine.link_phase(addr(*tag)) == LinkPhase::Connecting)
            .count();
        assert_eq!(connecting, Config::default().max_links);
    }

    #[test]
    fn test_phase_deadline_fails_link() {
        let mut hub = node(0);
        let now = Instant::now();
        let now_sys = SystemTime::now();

        hub.engine
            .handle_event(LinkEvent::PeerDiscovered { addr: addr(1) }, now, now_sys);
        assert_eq!(hub.engine.link_phase(addr(1)), LinkPhase::Connecting);

        // Connect deadline is 10 s.
        hub.engine.tick(
            now + Duration::from_secs(11),
            now_sys + Duration::from_secs(11),
        );
        assert_eq!(hub.engine.link_phase(addr(1)), LinkPhase::Disconnected);
    }
}
