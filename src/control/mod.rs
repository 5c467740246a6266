//! Control channel: the protocol carried over the `control` WebRTC data
//! channel (remote-mic handoff, moderation) plus the audio-routing policy
//! it drives. Chat (carried over the separate `chat` data channel) lives
//! in its own submodule since it shares no wire shape with the others.

pub mod chat;
pub mod moderation;
pub mod remote_mic;
pub mod routing;

pub use chat::ChatPayload;
pub use moderation::{ModerationEvent, ModerationMessage, ModerationState};
pub use remote_mic::{normalize_stop_reason, RemoteMicEvent, RemoteMicMessage, RemoteMicState};
pub use routing::{AudioRouting, AudioRoutingTarget, RoutingMode};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::ids::PeerId;

/// Tagged union of every payload carried over the `control` data channel.
/// Decode failures (wrong shape, unknown `type`) are the caller's
/// responsibility to log and drop — this type simply fails to deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
    RemoteMic(RemoteMicMessage),
    Moderation(ModerationMessage),
}

/// A control-layer event to surface through the facade's event hub.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    RemoteMic(RemoteMicEvent),
    Moderation(ModerationEvent),
}

/// Owns every piece of control-layer state for one node: the remote-mic
/// handoff state machine, moderation state, and audio-routing policy.
pub struct ControlRouter {
    self_id: PeerId,
    self_name: Mutex<String>,
    pub remote_mic: Mutex<RemoteMicState>,
    pub moderation: Mutex<ModerationState>,
    pub routing: Mutex<AudioRouting>,
}

impl ControlRouter {
    pub fn new(self_id: PeerId, self_name: String) -> Self {
        Self {
            self_id,
            self_name: Mutex::new(self_name),
            remote_mic: Mutex::new(RemoteMicState::default()),
            moderation: Mutex::new(ModerationState::default()),
            routing: Mutex::new(AudioRouting::default()),
        }
    }

    pub async fn set_self_name(&self, name: String) {
        *self.self_name.lock().await = name;
    }

    /// Parse and react to a message received on the `control` channel from
    /// `from`. Returns the (target, message) reply to send, if any, plus an
    /// event to surface.
    pub async fn handle_inbound(
        &self,
        from: PeerId,
        bytes: &[u8],
    ) -> (Option<(PeerId, ControlMessage)>, Option<ControlEvent>) {
        let message: ControlMessage = match serde_json::from_slice(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping malformed control message from {from}: {e}");
                return (None, None);
            }
        };

        match message {
            ControlMessage::RemoteMic(msg) => self.handle_remote_mic(from, msg).await,
            ControlMessage::Moderation(msg) => self.handle_moderation(from, msg).await,
        }
    }

    async fn handle_remote_mic(
        &self,
        from: PeerId,
        msg: RemoteMicMessage,
    ) -> (Option<(PeerId, ControlMessage)>, Option<ControlEvent>) {
        let mut state = self.remote_mic.lock().await;
        match msg {
            RemoteMicMessage::RmRequest { request_id, source_peer_id, source_name, .. } => {
                if state.has_any_role() {
                    let reply = RemoteMicMessage::RmResponse {
                        request_id,
                        accepted: false,
                        reason: Some("busy".to_string()),
                        ts: chrono::Utc::now().timestamp_millis(),
                    };
                    return (Some((from, ControlMessage::RemoteMic(reply))), None);
                }
                state.record_incoming(request_id.clone(), source_peer_id.clone());
                (
                    None,
                    Some(ControlEvent::RemoteMic(RemoteMicEvent::IncomingRequest {
                        request_id,
                        source_peer: source_peer_id,
                        source_name,
                    })),
                )
            }
            RemoteMicMessage::RmResponse { request_id, accepted, reason, .. } => {
                let event = state.handle_response(&request_id, accepted, reason, from);
                (None, event.map(ControlEvent::RemoteMic))
            }
            RemoteMicMessage::RmStart { request_id, .. } => {
                let event = state.handle_start(&request_id);
                (None, event.map(ControlEvent::RemoteMic))
            }
            RemoteMicMessage::RmHeartbeat { .. } => (None, None),
            RemoteMicMessage::RmStop { request_id, reason, .. } => {
                let event = state.handle_stop(&request_id, &reason);
                (None, event.map(ControlEvent::RemoteMic))
            }
        }
    }

    async fn handle_moderation(
        &self,
        from: PeerId,
        msg: ModerationMessage,
    ) -> (Option<(PeerId, ControlMessage)>, Option<ControlEvent>) {
        let mut state = self.moderation.lock().await;
        let event = match msg {
            ModerationMessage::MuteAllRequest { request_id, muted } => {
                state.record_mute_all_request(request_id, muted, from)
            }
            ModerationMessage::MuteAllResponse { request_id, accepted } => {
                state.record_mute_all_response(request_id, accepted, from)
            }
            ModerationMessage::HandRaise { raised } => {
                state.set_hand_raised(from, raised, chrono::Utc::now().timestamp_millis())
            }
        };
        (None, Some(ControlEvent::Moderation(event)))
    }

    /// Reset every piece of control-layer state, per `leave`'s teardown.
    pub async fn reset(&self) {
        self.remote_mic.lock().await.clear();
        self.moderation.lock().await.reset();
        self.routing.lock().await.reset();
    }
}
