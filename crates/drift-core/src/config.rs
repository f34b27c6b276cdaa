//! Engine configuration.
//!
//! Every knob has a documented default; hosts deserialize overrides from
//! their own config surface and pass the result in at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the messaging engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hop ceiling for relay forwarding.
    pub max_hops: u8,

    /// Duplicate-suppression window of the seen-store.
    pub seen_window: Duration,

    /// Maximum seen-store entries.
    pub seen_capacity: usize,

    /// Outbox hard ceiling; oldest low-priority entries are evicted first
    /// when exceeded.
    pub outbox_capacity: usize,

    /// Per-session send count that triggers an in-place rekey.
    pub rekey_messages: u64,

    /// Session age that triggers a replacement handshake.
    pub rekey_age: Duration,

    /// Wall-clock budget for a handshake in progress.
    pub handshake_timeout: Duration,

    /// Reassembly buffer deadline.
    pub fragment_timeout: Duration,

    /// Maximum reassembly buffers held concurrently.
    pub reassembly_max_buffers: usize,

    /// Total reassembly memory budget across all peers.
    pub reassembly_budget_bytes: usize,

    /// Target false-positive rate of the queue-sync filter.
    pub sync_fpr: f64,

    /// Size cap of a serialized queue-sync filter.
    pub sync_envelope_bytes: usize,

    /// Deleted-id tombstones retained for queue sync.
    pub tombstone_capacity: usize,

    /// Concurrent links allowed (platform-driven bound).
    pub max_links: usize,

    /// Link connect deadline.
    pub connect_timeout: Duration,

    /// MTU negotiation deadline.
    pub mtu_timeout: Duration,

    /// Identity exchange deadline.
    pub identity_timeout: Duration,

    /// Sustained per-sender relay rate (messages per minute).
    pub spam_rate_per_minute: u32,

    /// First retry backoff.
    pub retry_initial: Duration,

    /// Backoff ceiling.
    pub retry_max: Duration,

    /// Minimum gap between attempts (clock-jitter guard).
    pub retry_floor: Duration,

    /// Base retry budget before the priority bonus.
    pub base_retries: u32,

    /// Relay metadata time-to-live for locally originated messages.
    pub relay_ttl: Duration,

    /// Cadence of the outbox worker scan.
    pub outbox_scan_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_hops: 5,
            seen_window: Duration::from_secs(5 * 60),
            seen_capacity: 10_000,
            outbox_capacity: 10_000,
            rekey_messages: 10_000,
            rekey_age: Duration::from_secs(60 * 60),
            handshake_timeout: Duration::from_secs(5),
            fragment_timeout: Duration::from_secs(30),
            reassembly_max_buffers: 64,
            reassembly_budget_bytes: 1024 * 1024,
            sync_fpr: 0.01,
            sync_envelope_bytes: 512,
            tombstone_capacity: 1000,
            max_links: 7,
            connect_timeout: Duration::from_secs(10),
            mtu_timeout: Duration::from_millis(500),
            identity_timeout: Duration::from_secs(5),
            spam_rate_per_minute: 30,
            retry_initial: Duration::from_secs(2),
            retry_max: Duration::from_secs(10 * 60),
            retry_floor: Duration::from_secs(5),
            base_retries: 3,
            relay_ttl: Duration::from_secs(3600),
            outbox_scan_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.max_hops, 5);
        assert_eq!(config.seen_window, Duration::from_secs(300));
        assert_eq!(config.outbox_capacity, 10_000);
        assert_eq!(config.rekey_messages, 10_000);
        assert_eq!(config.rekey_age, Duration::from_secs(3600));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.fragment_timeout, Duration::from_secs(30));
        assert!((config.sync_fpr - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.sync_envelope_bytes, 512);
        assert_eq!(config.max_links, 7);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_hops, config.max_hops);
        assert_eq!(parsed.retry_initial, config.retry_initial);
    }

    #[test]
    fn test_partial_overrides_fill_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"max_hops": 3}"#).unwrap();
        assert_eq!(parsed.max_hops, 3);
        assert_eq!(parsed.outbox_capacity, 10_000);
    }
}
