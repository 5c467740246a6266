//! Every cadence and timeout constant, defined exactly once.

use std::time::Duration;

/// How often `announce` is (re-)broadcast while discovering peers.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3);
/// Minimum time since announce start before the steady-state exit applies.
pub const ANNOUNCE_STEADY_STATE_MIN_ELAPSED: Duration = Duration::from_secs(60);

/// Heartbeat sweep interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// A peer is pinged if nothing has been heard from it in this long.
pub const PEER_STALE_THRESHOLD: Duration = Duration::from_secs(10);

/// Grace period after ICE goes `disconnected` before restart/teardown begins.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(15);

/// Maximum ICE-restart attempts per peer before giving up.
pub const ICE_RESTART_MAX_ATTEMPTS: u32 = 3;

/// MQTT CONNECT timeout.
pub const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// MQTT keep-alive PINGREQ cadence.
pub const MQTT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// MQTT keep-alive value declared in CONNECT.
pub const MQTT_KEEPALIVE_DECLARED: u16 = 60;

/// Per-broker reconnect backoff parameters.
pub const BROKER_BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const BROKER_BACKOFF_FACTOR: f64 = 1.5;
pub const BROKER_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const BROKER_BACKOFF_JITTER: f64 = 0.15;
pub const BROKER_BACKOFF_MAX_ATTEMPTS: u32 = 5;

/// Deduplicator retention.
pub const DEDUP_CAPACITY: usize = 500;
pub const DEDUP_TTL: Duration = Duration::from_secs(30);

/// Chat message content size cap, in bytes.
pub const CHAT_CONTENT_MAX_BYTES: usize = 500;
