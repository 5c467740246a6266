//! Peer/session/room identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A 16-char lowercase-hex peer identifier, generated once per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh, random 16-char peer id from a UUIDv4's hex digits.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonically increasing, process-local session id. Advanced on every
/// `join`; every outbound envelope is stamped with the value at send time.
#[derive(Debug, Default)]
pub struct SessionCounter(AtomicU64);

impl SessionCounter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Advance to a new session id and return it.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A validated room identifier: at least 4 chars, `[A-Za-z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

#[derive(Debug, thiserror::Error)]
#[error("room id must be at least 4 characters of [A-Za-z0-9_-]")]
pub struct InvalidRoomId;

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, InvalidRoomId> {
        if raw.len() < 4
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(InvalidRoomId);
        }
        Ok(Self(raw.to_string()))
    }

    /// The MQTT topic this room is signaled on: `p2p-conf/<roomId>`.
    pub fn topic(&self) -> String {
        format!("p2p-conf/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Generate a random 16-hex-char message id.
pub fn generate_msg_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[16..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_16_alphanumeric_chars() {
        let id = PeerId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn room_id_boundary() {
        assert!(RoomId::parse("abcd").is_ok());
        assert!(RoomId::parse("abc").is_err());
        assert!(RoomId::parse("room-abc_123").is_ok());
        assert!(RoomId::parse("room abc").is_err());
    }

    #[test]
    fn room_topic_format() {
        let r = RoomId::parse("room-abc").unwrap();
        assert_eq!(r.topic(), "p2p-conf/room-abc");
    }

    #[test]
    fn session_counter_advances_monotonically() {
        let c = SessionCounter::new();
        assert_eq!(c.advance(), 1);
        assert_eq!(c.advance(), 2);
        assert_eq!(c.current(), 2);
    }

    #[test]
    fn msg_id_is_16_hex_chars() {
        let id = generate_msg_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
