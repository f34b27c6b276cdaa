//! # Drift Core
//!
//! The messaging engine of Drift: at-most-once delivery of end-to-end
//! encrypted messages across a multi-hop mesh of intermittently connected
//! peers, with no central infrastructure.
//!
//! Subsystems:
//! - [`fragment`]: MTU-bounded fragmentation and reassembly
//! - [`seen`]: bounded duplicate suppression
//! - [`outbox`]: durable priority queue with retry scheduling
//! - [`relay`]: forward/deliver/drop decisions and per-hop re-encryption
//! - [`routing`]: observed topology and next-hop selection
//! - [`sync`]: Golomb-coded-set queue reconciliation
//! - [`registry`] + [`session`]: peer sessions over `drift-crypto`
//! - [`orchestrator`]: connection lifecycle, wiring link events to all
//!   of the above
//!
//! The radio link, storage engines and identity keystore are external
//! collaborators consumed through the contracts in [`store`] and
//! `drift-link`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod fragment;
pub mod identity;
pub mod orchestrator;
pub mod outbox;
pub mod registry;
pub mod relay;
pub mod routing;
pub mod seen;
pub mod session;
pub mod store;
pub mod sync;
pub mod wire;

pub use config::Config;
pub use error::Error;
pub use identity::{ChatId, EphemeralId, IdentityAnnounce, PeerId, PeerRecord, SessionKey};
pub use orchestrator::{DeliveredMessage, LinkPhase, NodeStats, Orchestrator};
pub use outbox::{MessageId, Outbox, OutboxEvent, Priority};
pub use registry::SessionRegistry;
pub use relay::{RelayDecision, RelayDrop, RelayEngine, RelayEnvelope};
pub use routing::RoutingOracle;
pub use seen::SeenStore;
pub use session::Session;
pub use store::{IdentityStore, KvStore, MemoryIdentityStore, MemoryStore};
pub use sync::{GcsFilter, QueueSync, QueueSyncMessage};
