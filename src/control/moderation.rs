//! Room lock, mute-all request/response, and hand-raise — a thin pub/sub
//! layer carried over the control data channel (room lock is additionally
//! broadcast over the signal transport so peers not yet connected observe
//! it too; see `crate::envelope::SignalPayload::RoomLock`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::PeerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModerationMessage {
    MuteAllRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        muted: bool,
    },
    MuteAllResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        accepted: bool,
    },
    HandRaise {
        raised: bool,
    },
}

/// Surfaced to the event hub as `moderationControl`.
#[derive(Debug, Clone)]
pub enum ModerationEvent {
    RoomLockChanged { locked: bool, owner: Option<PeerId> },
    MuteAllRequested { request_id: String, muted: bool, from: PeerId },
    MuteAllResponded { request_id: String, accepted: bool, from: PeerId },
    HandRaiseChanged { peer: PeerId, raised: bool },
}

#[derive(Default)]
pub struct ModerationState {
    pub room_locked: bool,
    pub room_lock_owner: Option<PeerId>,
    pub raised_hands: HashMap<PeerId, i64>,
    pub local_hand_raised: bool,
    pub pending_mute_all_requests: HashMap<String, PeerId>,
}

impl ModerationState {
    pub fn set_room_lock(&mut self, locked: bool, owner: Option<PeerId>) -> ModerationEvent {
        self.room_locked = locked;
        self.room_lock_owner = if locked { owner.clone() } else { None };
        ModerationEvent::RoomLockChanged { locked, owner }
    }

    pub fn record_mute_all_request(&mut self, request_id: String, muted: bool, from: PeerId) -> ModerationEvent {
        self.pending_mute_all_requests.insert(request_id.clone(), from.clone());
        ModerationEvent::MuteAllRequested { request_id, muted, from }
    }

    /// Drops the pending entry whether or not it existed (unmatched
    /// responses are a logic-guard failure, ignored per §7 — but the event
    /// still surfaces so the UI can show a denial from an unexpected peer).
    pub fn record_mute_all_response(&mut self, request_id: String, accepted: bool, from: PeerId) -> ModerationEvent {
        self.pending_mute_all_requests.remove(&request_id);
        ModerationEvent::MuteAllResponded { request_id, accepted, from }
    }

    pub fn set_hand_raised(&mut self, peer: PeerId, raised: bool, now_ms: i64) -> ModerationEvent {
        if raised {
            self.raised_hands.insert(peer.clone(), now_ms);
        } else {
            self.raised_hands.remove(&peer);
        }
        ModerationEvent::HandRaiseChanged { peer, raised }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_lock_clears_owner_when_unlocked() {
        let mut state = ModerationState::default();
        let owner = PeerId::from("A".repeat(16));
        state.set_room_lock(true, Some(owner.clone()));
        assert_eq!(state.room_lock_owner, Some(owner));
        state.set_room_lock(false, None);
        assert_eq!(state.room_lock_owner, None);
    }

    #[test]
    fn hand_raise_tracks_timestamp_and_clears_on_lower() {
        let mut state = ModerationState::default();
        let peer = PeerId::from("A".repeat(16));
        state.set_hand_raised(peer.clone(), true, 1000);
        assert_eq!(state.raised_hands.get(&peer), Some(&1000));
        state.set_hand_raised(peer.clone(), false, 2000);
        assert!(!state.raised_hands.contains_key(&peer));
    }
}
