//! Typed event hub fired by the facade, plus the legacy single-callback
//! block mirrored alongside it per the component design.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::control::{ModerationEvent, RemoteMicEvent};
use crate::envelope::{MuteStatus, Platform};
use crate::error::Error;
use crate::ids::PeerId;

/// Network reachability transition, carried by the `networkStatus` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub was_in_room_when_offline: bool,
    pub reconnect_attempts: u32,
}

/// Overall signaling state, surfaced as `signalingState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    Joining,
    Announcing,
    Connected,
    Failed,
}

/// One received chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: PeerId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: i64,
}

/// Every event the core can emit. `#[non_exhaustive]` so new variants don't
/// break downstream matches.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    SignalingState(SignalingState),
    PeerJoin { peer: PeerId, user_name: Option<String>, platform: Option<Platform> },
    PeerLeave { peer: PeerId },
    RemoteStream { peer: PeerId },
    Error { error: Arc<Error>, context: &'static str },
    PeerMuteChange { peer: PeerId, status: MuteStatus },
    ChatMessage(ChatMessage),
    RemoteMicControl(RemoteMicEvent),
    ModerationControl(ModerationEvent),
    NetworkStatus(NetworkStatus),
}

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// A narrower set of one-callback-per-concern slots, fired immediately
/// after the corresponding typed `Event`, mirroring the delegate-style
/// interface real UI layers in this corpus are built against.
#[derive(Default)]
pub struct LegacyCallbacks {
    pub on_peer_join: Option<Box<dyn Fn(&PeerId, Option<&str>, Option<Platform>) + Send + Sync>>,
    pub on_peer_leave: Option<Box<dyn Fn(&PeerId) + Send + Sync>>,
    pub on_remote_stream: Option<Box<dyn Fn(&PeerId) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&Error, &str) + Send + Sync>>,
    pub on_chat_message: Option<Box<dyn Fn(&ChatMessage) + Send + Sync>>,
}

impl LegacyCallbacks {
    fn fire(&self, event: &Event) {
        match event {
            Event::PeerJoin { peer, user_name, platform } => {
                if let Some(cb) = &self.on_peer_join {
                    cb(peer, user_name.as_deref(), *platform);
                }
            }
            Event::PeerLeave { peer } => {
                if let Some(cb) = &self.on_peer_leave {
                    cb(peer);
                }
            }
            Event::RemoteStream { peer } => {
                if let Some(cb) = &self.on_remote_stream {
                    cb(peer);
                }
            }
            Event::Error { error, context } => {
                if let Some(cb) = &self.on_error {
                    cb(error, context);
                }
            }
            Event::ChatMessage(msg) => {
                if let Some(cb) = &self.on_chat_message {
                    cb(msg);
                }
            }
            _ => {}
        }
    }
}

/// Owns the list of typed-event subscribers plus the legacy callback block;
/// both fire on every event, in that order.
pub struct EventHub {
    listeners: RwLock<Vec<EventCallback>>,
    legacy: RwLock<LegacyCallbacks>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            legacy: RwLock::new(LegacyCallbacks::default()),
        }
    }

    pub async fn subscribe(&self, cb: EventCallback) {
        self.listeners.write().await.push(cb);
    }

    pub async fn set_legacy_callbacks(&self, legacy: LegacyCallbacks) {
        *self.legacy.write().await = legacy;
    }

    /// Drop every typed subscriber and the legacy callback block. Used by
    /// `dispose` so a torn-down facade stops holding UI-side closures alive.
    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        *self.legacy.write().await = LegacyCallbacks::default();
    }

    pub async fn emit(&self, event: Event) {
        for listener in self.listeners.read().await.iter() {
            listener(&event);
        }
        self.legacy.read().await.fire(&event);
    }
}
