//! Remote-microphone handoff: one peer ("source") uses another peer's
//! ("target") audio output as the source of its own outbound audio.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{generate_msg_id, PeerId};

/// Normalizes to `stopped-by-source` for anything not in this set, per the
/// legal-reason list.
const LEGAL_STOP_REASONS: &[&str] = &[
    "busy",
    "virtual-device-missing",
    "virtual-device-install-failed",
    "virtual-device-restart-required",
    "user-cancelled",
    "rejected",
    "stopped-by-source",
    "unknown",
];

pub fn normalize_stop_reason(reason: &str) -> String {
    if LEGAL_STOP_REASONS.contains(&reason) {
        reason.to_string()
    } else {
        "stopped-by-source".to_string()
    }
}

/// Control-channel wire messages for the handoff protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteMicMessage {
    RmRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "sourcePeerId")]
        source_peer_id: PeerId,
        #[serde(rename = "sourceName")]
        source_name: String,
        #[serde(rename = "targetPeerId")]
        target_peer_id: PeerId,
        ts: i64,
    },
    RmResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        accepted: bool,
        #[serde(default)]
        reason: Option<String>,
        ts: i64,
    },
    RmStart {
        #[serde(rename = "requestId")]
        request_id: String,
        ts: i64,
    },
    RmHeartbeat {
        #[serde(rename = "requestId")]
        request_id: String,
        ts: i64,
    },
    RmStop {
        #[serde(rename = "requestId")]
        request_id: String,
        reason: String,
        ts: i64,
    },
}

/// Surfaced to the event hub as `remoteMicControl`.
#[derive(Debug, Clone)]
pub enum RemoteMicEvent {
    IncomingRequest { request_id: String, source_peer: PeerId, source_name: String },
    Accepted { request_id: String, target_peer: PeerId },
    Rejected { request_id: String, reason: String },
    Started { request_id: String },
    Stopped { request_id: String, reason: String },
}

/// All remote-mic state kept on one node, per the data model in §3.
#[derive(Default)]
pub struct RemoteMicState {
    pub pending_incoming: HashMap<String, PeerId>,
    pub pending_outgoing_request_id: Option<String>,
    pub active_target_peer_id: Option<PeerId>,
    pub active_source_peer_id: Option<PeerId>,
    pub active_request_id: Option<String>,
}

impl RemoteMicState {
    pub fn has_any_role(&self) -> bool {
        self.pending_outgoing_request_id.is_some()
            || self.active_target_peer_id.is_some()
            || self.active_source_peer_id.is_some()
            || !self.pending_incoming.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Begin requesting `target`'s microphone. Returns the outbound message
    /// to send to `target`.
    pub fn start_request(&mut self, self_id: &PeerId, self_name: &str, target: PeerId) -> RemoteMicMessage {
        let request_id = generate_msg_id();
        self.pending_outgoing_request_id = Some(request_id.clone());
        RemoteMicMessage::RmRequest {
            request_id,
            source_peer_id: self_id.clone(),
            source_name: self_name.to_string(),
            target_peer_id: target,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Handle an inbound request. If we already hold any role, the caller
    /// must immediately reply with a `busy` response instead of recording
    /// it; this records the request only when we are free.
    pub fn record_incoming(&mut self, request_id: String, source_peer: PeerId) {
        self.pending_incoming.insert(request_id, source_peer);
    }

    /// Handle an inbound `rm_response`. Returns `Some(event)` to surface, or
    /// `None` if the response doesn't match our outstanding request.
    pub fn handle_response(
        &mut self,
        request_id: &str,
        accepted: bool,
        reason: Option<String>,
        responder: PeerId,
    ) -> Option<RemoteMicEvent> {
        if self.pending_outgoing_request_id.as_deref() != Some(request_id) {
            return None;
        }
        if accepted {
            self.active_target_peer_id = Some(responder.clone());
            self.active_request_id = Some(request_id.to_string());
            Some(RemoteMicEvent::Accepted { request_id: request_id.to_string(), target_peer: responder })
        } else {
            self.pending_outgoing_request_id = None;
            Some(RemoteMicEvent::Rejected {
                request_id: request_id.to_string(),
                reason: reason.unwrap_or_else(|| "unknown".to_string()),
            })
        }
    }

    pub fn handle_start(&mut self, request_id: &str) -> Option<RemoteMicEvent> {
        if self.pending_outgoing_request_id.as_deref() != Some(request_id) {
            return None;
        }
        Some(RemoteMicEvent::Started { request_id: request_id.to_string() })
    }

    /// Tear down any state matching `request_id`, wherever it's held, and
    /// return the normalized reason to surface.
    pub fn handle_stop(&mut self, request_id: &str, reason: &str) -> Option<RemoteMicEvent> {
        let normalized = normalize_stop_reason(reason);
        let mut matched = false;

        if self.pending_outgoing_request_id.as_deref() == Some(request_id) {
            self.pending_outgoing_request_id = None;
            matched = true;
        }
        if self.active_request_id.as_deref() == Some(request_id) {
            self.active_request_id = None;
            self.active_target_peer_id = None;
            self.active_source_peer_id = None;
            matched = true;
        }
        if self.pending_incoming.remove(request_id).is_some() {
            matched = true;
        }

        matched.then(|| RemoteMicEvent::Stopped { request_id: request_id.to_string(), reason: normalized })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_stop_reason_normalizes_to_stopped_by_source() {
        assert_eq!(normalize_stop_reason("busy"), "busy");
        assert_eq!(normalize_stop_reason("made-up-reason"), "stopped-by-source");
    }

    #[test]
    fn response_for_unmatched_request_is_ignored() {
        let mut state = RemoteMicState::default();
        let event = state.handle_response("unknown-id", true, None, PeerId::from("B".repeat(16)));
        assert!(event.is_none());
    }

    #[test]
    fn accepted_response_enters_exclusive_role() {
        let mut state = RemoteMicState::default();
        let target = PeerId::from("B".repeat(16));
        state.pending_outgoing_request_id = Some("req-1".to_string());
        let event = state.handle_response("req-1", true, None, target.clone());
        assert!(matches!(event, Some(RemoteMicEvent::Accepted { .. })));
        assert_eq!(state.active_target_peer_id, Some(target));
    }

    #[test]
    fn full_cycle_clears_all_state_on_stop() {
        let mut state = RemoteMicState::default();
        let target = PeerId::from("B".repeat(16));
        state.pending_outgoing_request_id = Some("req-1".to_string());
        state.handle_response("req-1", true, None, target);
        state.handle_start("req-1");
        let event = state.handle_stop("req-1", "stopped-by-source");
        assert!(matches!(event, Some(RemoteMicEvent::Stopped { .. })));
        assert!(!state.has_any_role());
    }
}
