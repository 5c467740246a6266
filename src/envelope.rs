//! Signal envelope — the JSON control object carried over MQTT or the
//! same-host local channel.

use serde::{Deserialize, Serialize};

use crate::ids::{generate_msg_id, PeerId};

/// Host platform, carried so peers can show a platform-appropriate UI hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Win,
    Mac,
    Linux,
}

/// Mute/video/screenshare status broadcast alongside `mute-status` envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteStatus {
    pub mic_muted: bool,
    pub speaker_muted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

/// Payload carried by an `ice-candidate` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Type-tagged payload carried by a signal envelope. Unknown `type` values
/// fail to deserialize at the envelope boundary and are dropped by the
/// caller rather than treated as a fatal transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalPayload {
    Announce,
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidatePayload),
    Leave,
    Ping,
    Pong,
    MuteStatus(MuteStatus),
    RoomLock { locked: bool },
    RoomLocked { locked: bool, owner: PeerId },
}

impl SignalPayload {
    /// The `type` discriminant as carried on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Leave => "leave",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::MuteStatus(_) => "mute-status",
            Self::RoomLock { .. } => "room-lock",
            Self::RoomLocked { .. } => "room-locked",
        }
    }

    /// Types whose traffic is noisy enough that transport-level debug
    /// logging should be suppressed for them.
    pub fn suppresses_debug_log(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::MuteStatus(_))
    }
}

/// The full signal envelope, flattened to this wire shape:
/// `{v, type, from, to?, msgId, sessionId, ts, userName?, platform?, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub v: u8,
    #[serde(flatten)]
    pub payload: SignalPayload,
    pub from: PeerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    #[serde(rename = "msgId")]
    pub msg_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: u64,
    pub ts: i64,
    #[serde(rename = "userName", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl SignalEnvelope {
    /// Build a new envelope from `self_id`, stamping a fresh `msgId` and
    /// current timestamp. Callers set `to`/`session_id` as needed.
    pub fn new(from: PeerId, session_id: u64, payload: SignalPayload) -> Self {
        Self {
            v: 1,
            payload,
            from,
            to: None,
            msg_id: generate_msg_id(),
            session_id,
            ts: chrono::Utc::now().timestamp_millis(),
            user_name: None,
            platform: None,
        }
    }

    pub fn with_to(mut self, to: PeerId) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_identity(mut self, user_name: String, platform: Platform) -> Self {
        self.user_name = Some(user_name);
        self.platform = Some(platform);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_round_trips_through_json() {
        let env = SignalEnvelope::new(PeerId::from("AAAA0000AAAA0000".to_string()), 1, SignalPayload::Announce);
        let json = serde_json::to_string(&env).unwrap();
        let back: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.from, env.from);
        assert!(matches!(back.payload, SignalPayload::Announce));
    }

    #[test]
    fn offer_carries_sdp_and_type_name() {
        let env = SignalEnvelope::new(
            PeerId::from("AAAA0000AAAA0000".to_string()),
            1,
            SignalPayload::Offer { sdp: "v=0".to_string() },
        );
        assert_eq!(env.payload.type_name(), "offer");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["data"]["sdp"], "v=0");
    }

    #[test]
    fn ping_pong_mute_suppress_debug_log() {
        assert!(SignalPayload::Ping.suppresses_debug_log());
        assert!(SignalPayload::Pong.suppresses_debug_log());
        assert!(SignalPayload::MuteStatus(MuteStatus::default()).suppresses_debug_log());
        assert!(!SignalPayload::Announce.suppresses_debug_log());
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let raw = r#"{"v":1,"type":"bogus","from":"AAAA0000AAAA0000","msgId":"x","sessionId":1,"ts":0}"#;
        assert!(serde_json::from_str::<SignalEnvelope>(raw).is_err());
    }
}
