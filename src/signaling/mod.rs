//! Per-peer WebRTC signaling state machine: discovery tie-breaking,
//! offer/answer negotiation, ICE candidate queueing, and connection-state
//! outcomes. Cadences (announce/heartbeat/ICE-restart-ladder) are driven
//! by `crate::session::SessionManager`, which calls back into this engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::control::{AudioRoutingTarget, ChatPayload, ControlEvent, ControlMessage, ControlRouter, RemoteMicEvent, RoutingMode};
use crate::envelope::{IceCandidatePayload, MuteStatus, Platform, SignalEnvelope, SignalPayload};
use crate::error::{ControlError, SignalingError};
use crate::events::{ChatMessage, Event, EventHub};
use crate::ids::PeerId;
use crate::stats::{ConnectionStats, RawStatsSample};
use crate::transport::SignalTransport;
use crate::webrtc_peer::{
    DataChannelHandle, IceConnState, PeerConnState, PeerConnectionFactory, PeerConnectionHandle,
};

/// Per-peer lifecycle state, named per the glossary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Offering,
    Answering,
    IceGathering,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
    Left,
}

pub struct PeerRecord {
    pub pc: Arc<dyn PeerConnectionHandle>,
    pub chat_dc: Mutex<Option<Arc<dyn DataChannelHandle>>>,
    pub control_dc: Mutex<Option<Arc<dyn DataChannelHandle>>>,
    pub user_name: Mutex<Option<String>>,
    pub platform: Mutex<Option<Platform>>,
    pub is_connected: AtomicBool,
    pub mute_status: Mutex<MuteStatus>,
    pub ice_restart_attempts: AtomicU32,
    pub pending_candidates: Mutex<Vec<IceCandidatePayload>>,
    pub last_seen_ms: Mutex<i64>,
    pub state: Mutex<PeerState>,
    pub disconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl PeerRecord {
    fn new(pc: Arc<dyn PeerConnectionHandle>) -> Self {
        Self {
            pc,
            chat_dc: Mutex::new(None),
            control_dc: Mutex::new(None),
            user_name: Mutex::new(None),
            platform: Mutex::new(None),
            is_connected: AtomicBool::new(false),
            mute_status: Mutex::new(MuteStatus::default()),
            ice_restart_attempts: AtomicU32::new(0),
            pending_candidates: Mutex::new(Vec::new()),
            last_seen_ms: Mutex::new(chrono::Utc::now().timestamp_millis()),
            state: Mutex::new(PeerState::New),
            disconnect_timer: Mutex::new(None),
        }
    }

    async fn set_state(&self, peer_id: &PeerId, new: PeerState) {
        let mut state = self.state.lock().await;
        if *state != new {
            debug!("peer {peer_id}: {:?} -> {:?}", *state, new);
            *state = new;
        }
    }
}

type IceTroubleHook = Arc<dyn Fn(PeerId) + Send + Sync>;

pub struct SignalingEngine {
    self_id: PeerId,
    transport: Arc<SignalTransport>,
    factory: Arc<dyn PeerConnectionFactory>,
    hub: Arc<EventHub>,
    control: Arc<ControlRouter>,
    peers: RwLock<HashMap<PeerId, Arc<PeerRecord>>>,
    ice_trouble_hook: RwLock<Option<IceTroubleHook>>,
    audio_targets: RwLock<HashMap<PeerId, Arc<dyn AudioRoutingTarget>>>,
}

impl SignalingEngine {
    pub fn new(
        self_id: PeerId,
        transport: Arc<SignalTransport>,
        factory: Arc<dyn PeerConnectionFactory>,
        hub: Arc<EventHub>,
        control: Arc<ControlRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            transport,
            factory,
            hub,
            control,
            peers: RwLock::new(HashMap::new()),
            ice_trouble_hook: RwLock::new(None),
            audio_targets: RwLock::new(HashMap::new()),
        })
    }

    /// Register the audio-routing hook for `peer_id` (a host application
    /// wraps its own `RTCRtpSender::replace_track` call), then immediately
    /// apply the current routing mode to it so a target registered after
    /// the peer already connected doesn't miss the current mode.
    pub async fn register_audio_routing_target(&self, peer_id: PeerId, target: Arc<dyn AudioRoutingTarget>) {
        self.audio_targets.write().await.insert(peer_id, target);
        self.apply_routing_mode().await;
    }

    async fn apply_routing_mode(&self) {
        let targets = self.audio_targets.read().await.clone();
        if let Err(e) = self.control.routing.lock().await.apply(&targets).await {
            debug!("failed to apply audio routing: {e}");
        }
    }

    pub async fn set_routing_mode(&self, mode: RoutingMode, target: Option<PeerId>) -> Result<(), ControlError> {
        let targets = self.audio_targets.read().await.clone();
        self.control.routing.lock().await.set_mode(mode, target, &targets).await
    }

    /// Current connection-quality stats for `peer_id`, sampled from its
    /// underlying `RTCPeerConnection`. `previous` (if supplied) is the prior
    /// sample, used to compute a delta packet-loss rate instead of the
    /// noisier cumulative one. Returns the fresh raw sample alongside the
    /// computed stats so the caller can keep it for the next poll's delta.
    pub async fn connection_stats(
        &self,
        peer_id: &PeerId,
        previous: Option<RawStatsSample>,
    ) -> Result<(ConnectionStats, RawStatsSample), SignalingError> {
        let record = self
            .peer_record(peer_id)
            .await
            .ok_or_else(|| SignalingError::UnknownPeer(peer_id.to_string()))?;
        let sample = record.pc.stats().await?;
        Ok((crate::stats::compute_stats(sample, previous), sample))
    }

    /// Register the callback invoked whenever a peer's ICE connection state
    /// becomes `disconnected` or `failed`. The session manager uses this to
    /// start its disconnect-grace timer and restart ladder.
    pub async fn set_ice_trouble_hook(&self, hook: IceTroubleHook) {
        *self.ice_trouble_hook.write().await = Some(hook);
    }

    pub async fn healthy_peer_count(&self) -> usize {
        let peers = self.peers.read().await;
        let mut count = 0;
        for peer in peers.values() {
            if peer.is_connected.load(Ordering::SeqCst) {
                count += 1;
            }
        }
        count
    }

    pub async fn known_peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer_record(&self, peer_id: &PeerId) -> Option<Arc<PeerRecord>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Dispatch one inbound envelope (already passed through the transport's
    /// filter) to the appropriate handler.
    pub async fn handle_envelope(self: &Arc<Self>, envelope: SignalEnvelope) {
        let from = envelope.from.clone();
        if let Some(record) = self.peer_record(&from).await {
            *record.last_seen_ms.lock().await = envelope.ts;
        }

        match envelope.payload {
            SignalPayload::Announce => self.handle_announce(from).await,
            SignalPayload::Offer { sdp } => self.handle_offer(from, sdp).await,
            SignalPayload::Answer { sdp } => self.handle_answer(from, sdp).await,
            SignalPayload::IceCandidate(candidate) => self.handle_ice_candidate(from, candidate).await,
            SignalPayload::Leave => self.handle_leave(from).await,
            SignalPayload::Ping => {
                self.transport.send_to_peer(from, SignalPayload::Pong).await;
            }
            SignalPayload::Pong => {}
            SignalPayload::MuteStatus(status) => self.handle_mute_status(from, status).await,
            SignalPayload::RoomLock { locked } => {
                let owner = locked.then_some(from);
                let event = self.control.moderation.lock().await.set_room_lock(locked, owner);
                self.hub.emit(Event::ModerationControl(event)).await;
            }
            SignalPayload::RoomLocked { locked, owner } => {
                let event = self.control.moderation.lock().await.set_room_lock(locked, Some(owner));
                self.hub.emit(Event::ModerationControl(event)).await;
            }
        }
    }

    async fn handle_announce(self: &Arc<Self>, from: PeerId) {
        if self.peer_record(&from).await.is_some() {
            return;
        }

        if self.self_id.as_str() < from.as_str() {
            if let Err(e) = self.create_as_initiator(from.clone()).await {
                self.emit_error(e, "signaling.create_as_initiator").await;
            }
        } else if let Err(e) = self.create_as_responder(from.clone()).await {
            self.emit_error(e, "signaling.create_as_responder").await;
        } else {
            // Announce back so the peer (lexicographically smaller) observes
            // us and becomes the initiator.
            self.transport.broadcast(SignalPayload::Announce).await;
        }
    }

    async fn create_as_initiator(self: &Arc<Self>, peer_id: PeerId) -> Result<(), SignalingError> {
        let pc = self.factory.create().await?;
        let record = Arc::new(PeerRecord::new(pc.clone()));
        self.wire_common_callbacks(peer_id.clone(), pc.clone(), record.clone());
        self.peers.write().await.insert(peer_id.clone(), record.clone());

        record.set_state(&peer_id, PeerState::Offering).await;
        let chat = pc.create_data_channel("chat").await?;
        self.wire_chat_channel(peer_id.clone(), chat.clone());
        *record.chat_dc.lock().await = Some(chat);
        let control = pc.create_data_channel("control").await?;
        self.wire_control_channel(peer_id.clone(), control.clone());
        *record.control_dc.lock().await = Some(control);

        let sdp = pc.create_offer(false).await?;
        pc.set_local_description(sdp.clone(), true).await?;
        self.transport.send_to_peer(peer_id, SignalPayload::Offer { sdp }).await;
        Ok(())
    }

    async fn create_as_responder(self: &Arc<Self>, peer_id: PeerId) -> Result<(), SignalingError> {
        self.ensure_responder(peer_id).await.map(|_| ())
    }

    async fn ensure_responder(self: &Arc<Self>, peer_id: PeerId) -> Result<Arc<PeerRecord>, SignalingError> {
        if let Some(existing) = self.peer_record(&peer_id).await {
            return Ok(existing);
        }
        let pc = self.factory.create().await?;
        let record = Arc::new(PeerRecord::new(pc.clone()));
        self.wire_common_callbacks(peer_id.clone(), pc.clone(), record.clone());

        let record_for_dc = record.clone();
        let engine_for_dc = self.clone();
        let peer_for_dc = peer_id.clone();
        pc.on_data_channel(Arc::new(move |dc: Arc<dyn DataChannelHandle>| {
            let label = dc.label().to_string();
            let record = record_for_dc.clone();
            let engine = engine_for_dc.clone();
            let peer_id = peer_for_dc.clone();
            tokio::spawn(async move {
                match label.as_str() {
                    "chat" => {
                        engine.wire_chat_channel(peer_id, dc.clone());
                        *record.chat_dc.lock().await = Some(dc);
                    }
                    "control" => {
                        engine.wire_control_channel(peer_id, dc.clone());
                        *record.control_dc.lock().await = Some(dc);
                    }
                    _ => {}
                }
            });
        }));

        self.peers.write().await.insert(peer_id, record.clone());
        Ok(record)
    }

    async fn handle_offer(self: &Arc<Self>, from: PeerId, sdp: String) {
        let record = match self.ensure_responder(from.clone()).await {
            Ok(r) => r,
            Err(e) => {
                self.emit_error(e, "signaling.handle_offer").await;
                return;
            }
        };
        record.set_state(&from, PeerState::Answering).await;

        if let Err(e) = self.negotiate_answer(&from, &record, sdp).await {
            self.emit_error(e, "signaling.negotiate_answer").await;
        }
    }

    async fn negotiate_answer(
        self: &Arc<Self>,
        from: &PeerId,
        record: &Arc<PeerRecord>,
        sdp: String,
    ) -> Result<(), SignalingError> {
        record.pc.set_remote_description(sdp, true).await?;
        self.drain_pending_candidates(record).await;

        let answer = record.pc.create_answer().await?;
        record.pc.set_local_description(answer.clone(), false).await?;
        self.transport.send_to_peer(from.clone(), SignalPayload::Answer { sdp: answer }).await;
        Ok(())
    }

    async fn handle_answer(self: &Arc<Self>, from: PeerId, sdp: String) {
        let Some(record) = self.peer_record(&from).await else {
            return;
        };
        if let Err(e) = record.pc.set_remote_description(sdp, false).await {
            self.emit_error(e, "signaling.handle_answer").await;
            return;
        }
        self.drain_pending_candidates(&record).await;
    }

    async fn drain_pending_candidates(&self, record: &Arc<PeerRecord>) {
        let queued: Vec<_> = record.pending_candidates.lock().await.drain(..).collect();
        for candidate in queued {
            if let Err(e) = record.pc.add_ice_candidate(candidate).await {
                debug!("failed to add queued ice candidate: {e}");
            }
        }
    }

    async fn handle_ice_candidate(&self, from: PeerId, candidate: IceCandidatePayload) {
        let Some(record) = self.peer_record(&from).await else {
            return;
        };
        if record.pc.has_remote_description() {
            if let Err(e) = record.pc.add_ice_candidate(candidate).await {
                debug!("failed to add ice candidate from {from}: {e}");
            }
        } else {
            record.pending_candidates.lock().await.push(candidate);
        }
    }

    async fn handle_mute_status(&self, from: PeerId, status: MuteStatus) {
        if let Some(record) = self.peer_record(&from).await {
            *record.mute_status.lock().await = status;
            self.hub.emit(Event::PeerMuteChange { peer: from, status }).await;
        }
    }

    /// Remove a peer entirely: close its connection, drop it from the map,
    /// and emit `peerLeave`. If no healthy peers remain, trigger discovery
    /// restart via `on_discovery_restart`.
    pub async fn teardown_peer(self: &Arc<Self>, peer_id: &PeerId) {
        let Some(record) = self.peers.write().await.remove(peer_id) else {
            return;
        };
        self.audio_targets.write().await.remove(peer_id);
        if let Some(t) = record.disconnect_timer.lock().await.take() {
            t.abort();
        }
        let _ = record.pc.close().await;
        record.set_state(peer_id, PeerState::Left).await;
        self.hub.emit(Event::PeerLeave { peer: peer_id.clone() }).await;
    }

    async fn handle_leave(self: &Arc<Self>, from: PeerId) {
        self.teardown_peer(&from).await;
    }

    /// Attempt an ICE restart for `peer_id`: returns the new attempt count
    /// (the session manager compares this against the configured cap).
    pub async fn ice_restart(&self, peer_id: &PeerId) -> Result<u32, SignalingError> {
        let record = self.peer_record(peer_id).await.ok_or_else(|| SignalingError::UnknownPeer(peer_id.to_string()))?;
        let attempt = record.ice_restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let sdp = record.pc.create_offer(true).await?;
        record.pc.set_local_description(sdp.clone(), true).await?;
        self.transport.send_to_peer(peer_id.clone(), SignalPayload::Offer { sdp }).await;
        Ok(attempt)
    }

    pub async fn reset_ice_restart_attempts(&self, peer_id: &PeerId) {
        if let Some(record) = self.peer_record(peer_id).await {
            record.ice_restart_attempts.store(0, Ordering::SeqCst);
        }
    }

    fn wire_chat_channel(self: &Arc<Self>, peer_id: PeerId, dc: Arc<dyn DataChannelHandle>) {
        let hub = self.hub.clone();
        dc.on_message(Arc::new(move |data: Vec<u8>| {
            let hub = hub.clone();
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                match serde_json::from_slice::<ChatPayload>(&data) {
                    Ok(payload) => {
                        hub.emit(Event::ChatMessage(ChatMessage {
                            id: payload.id,
                            sender_id: payload.sender_id,
                            sender_name: payload.sender_name,
                            content: payload.content,
                            timestamp: payload.timestamp,
                        }))
                        .await;
                    }
                    Err(e) => debug!("dropping malformed chat payload from {peer_id}: {e}"),
                }
            });
        }));
    }

    fn wire_control_channel(self: &Arc<Self>, peer_id: PeerId, dc: Arc<dyn DataChannelHandle>) {
        let engine = self.clone();
        let dc_for_reply = dc.clone();
        dc.on_message(Arc::new(move |data: Vec<u8>| {
            let engine = engine.clone();
            let peer_id = peer_id.clone();
            let dc = dc_for_reply.clone();
            tokio::spawn(async move {
                let (reply, event) = engine.control.handle_inbound(peer_id.clone(), &data).await;
                if let Some((_, message)) = reply {
                    if let Ok(bytes) = serde_json::to_vec(&message) {
                        if let Err(e) = dc.send(&bytes).await {
                            debug!("failed to send control reply to {peer_id}: {e}");
                        }
                    }
                }
                if let Some(event) = event {
                    engine.emit_control_event(event).await;
                }
            });
        }));
    }

    async fn emit_control_event(&self, event: ControlEvent) {
        if let ControlEvent::RemoteMic(rm) = &event {
            match rm {
                RemoteMicEvent::Accepted { target_peer, .. } => {
                    if let Err(e) = self.set_routing_mode(RoutingMode::Exclusive, Some(target_peer.clone())).await {
                        debug!("failed to switch audio routing to exclusive: {e}");
                    }
                }
                RemoteMicEvent::Stopped { .. } => {
                    if let Err(e) = self.set_routing_mode(RoutingMode::Broadcast, None).await {
                        debug!("failed to switch audio routing back to broadcast: {e}");
                    }
                }
                _ => {}
            }
        }
        match event {
            ControlEvent::RemoteMic(e) => self.hub.emit(Event::RemoteMicControl(e)).await,
            ControlEvent::Moderation(e) => self.hub.emit(Event::ModerationControl(e)).await,
        }
    }

    /// Send a chat message over every connected peer's `chat` channel.
    pub async fn send_chat_message(&self, self_id: PeerId, sender_name: String, content: &str) -> ChatPayload {
        let payload = ChatPayload::new(self_id, sender_name, content);
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            for record in self.peers.read().await.values() {
                if let Some(dc) = record.chat_dc.lock().await.clone() {
                    let _ = dc.send(&bytes).await;
                }
            }
        }
        payload
    }

    /// Send a control message to a single peer's `control` channel.
    pub async fn send_control_message(&self, peer_id: &PeerId, message: &ControlMessage) -> Result<(), ControlError> {
        let record = self
            .peer_record(peer_id)
            .await
            .ok_or_else(|| ControlError::ChannelNotOpen(peer_id.to_string()))?;
        let dc = record
            .control_dc
            .lock()
            .await
            .clone()
            .ok_or_else(|| ControlError::ChannelNotOpen(peer_id.to_string()))?;
        let bytes = serde_json::to_vec(message).map_err(|e| ControlError::SendFailed(e.to_string()))?;
        dc.send(&bytes).await.map_err(|e| ControlError::SendFailed(e.to_string()))
    }

    /// Send a control message to every connected peer's `control` channel
    /// (used by moderation's room-wide broadcasts).
    pub async fn broadcast_control_message(&self, message: &ControlMessage) {
        let Ok(bytes) = serde_json::to_vec(message) else { return };
        for record in self.peers.read().await.values() {
            if let Some(dc) = record.control_dc.lock().await.clone() {
                let _ = dc.send(&bytes).await;
            }
        }
    }

    fn wire_common_callbacks(self: &Arc<Self>, peer_id: PeerId, pc: Arc<dyn PeerConnectionHandle>, record: Arc<PeerRecord>) {
        let engine = self.clone();
        let transport = self.transport.clone();
        let candidate_peer = peer_id.clone();
        pc.on_ice_candidate(Arc::new(move |candidate| {
            let transport = transport.clone();
            let peer_id = candidate_peer.clone();
            tokio::spawn(async move {
                transport.send_to_peer(peer_id, SignalPayload::IceCandidate(candidate)).await;
            });
        }));

        let engine2 = engine.clone();
        let record2 = record.clone();
        let conn_peer = peer_id.clone();
        pc.on_connection_state_change(Arc::new(move |state| {
            let engine = engine2.clone();
            let record = record2.clone();
            let peer_id = conn_peer.clone();
            tokio::spawn(async move {
                engine.on_connection_state_change(peer_id, record, state).await;
            });
        }));

        let engine3 = engine.clone();
        let record3 = record.clone();
        let ice_peer = peer_id.clone();
        pc.on_ice_connection_state_change(Arc::new(move |state| {
            let engine = engine3.clone();
            let record = record3.clone();
            let peer_id = ice_peer.clone();
            tokio::spawn(async move {
                engine.on_ice_connection_state_change(peer_id, record, state).await;
            });
        }));
    }

    async fn on_connection_state_change(self: Arc<Self>, peer_id: PeerId, record: Arc<PeerRecord>, state: PeerConnState) {
        match state {
            PeerConnState::Connected => {
                let was_connected = record.is_connected.swap(true, Ordering::SeqCst);
                if !was_connected {
                    record.ice_restart_attempts.store(0, Ordering::SeqCst);
                    if let Some(t) = record.disconnect_timer.lock().await.take() {
                        t.abort();
                    }
                    record.set_state(&peer_id, PeerState::Connected).await;
                    let user_name = record.user_name.lock().await.clone();
                    let platform = *record.platform.lock().await;
                    self.hub
                        .emit(Event::PeerJoin { peer: peer_id.clone(), user_name, platform })
                        .await;
                    self.hub.emit(Event::RemoteStream { peer: peer_id }).await;
                    self.apply_routing_mode().await;
                }
            }
            PeerConnState::Failed | PeerConnState::Closed => {
                record.is_connected.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    async fn on_ice_connection_state_change(self: Arc<Self>, peer_id: PeerId, record: Arc<PeerRecord>, state: IceConnState) {
        debug!("peer {peer_id}: ice connection state -> {:?}", state);
        if matches!(state, IceConnState::Disconnected | IceConnState::Failed) {
            record.set_state(&peer_id, PeerState::Reconnecting).await;
            if let Some(hook) = self.ice_trouble_hook.read().await.clone() {
                hook(peer_id);
            }
        }
    }

    async fn emit_error(&self, error: SignalingError, context: &'static str) {
        self.hub
            .emit(Event::Error { error: Arc::new(crate::error::Error::Signaling(error)), context })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerFabric;
    use crate::envelope::Platform;
    use crate::local_channel::InProcessLocalChannel;
    use std::sync::Mutex as StdMutex;

    struct CapturingDataChannel {
        label: String,
        on_message: StdMutex<Option<Arc<dyn Fn(Vec<u8>) + Send + Sync>>>,
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl CapturingDataChannel {
        fn new(label: &str) -> Self {
            Self { label: label.to_string(), on_message: StdMutex::new(None), sent: StdMutex::new(Vec::new()) }
        }

        fn deliver(&self, data: &[u8]) {
            let cb = self.on_message.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(data.to_vec());
            }
        }
    }

    #[async_trait]
    impl DataChannelHandle for CapturingDataChannel {
        fn label(&self) -> &str {
            &self.label
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn send(&self, data: &[u8]) -> Result<(), SignalingError> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }
        fn on_open(&self, _cb: Arc<dyn Fn() + Send + Sync>) {}
        fn on_close(&self, _cb: Arc<dyn Fn() + Send + Sync>) {}
        fn on_message(&self, cb: Arc<dyn Fn(Vec<u8>) + Send + Sync>) {
            *self.on_message.lock().unwrap() = Some(cb);
        }
    }

    /// Records every data channel it creates so the test can reach back in
    /// and simulate an inbound message on it.
    #[derive(Default)]
    struct RecordingPeerConnection {
        channels: StdMutex<HashMap<String, Arc<CapturingDataChannel>>>,
    }

    #[async_trait]
    impl PeerConnectionHandle for RecordingPeerConnection {
        async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>, SignalingError> {
            let dc = Arc::new(CapturingDataChannel::new(label));
            self.channels.lock().unwrap().insert(label.to_string(), dc.clone());
            Ok(dc)
        }
        async fn create_offer(&self, _ice_restart: bool) -> Result<String, SignalingError> {
            Ok("sdp-offer".to_string())
        }
        async fn create_answer(&self) -> Result<String, SignalingError> {
            Ok("sdp-answer".to_string())
        }
        async fn set_local_description(&self, _sdp: String, _is_offer: bool) -> Result<(), SignalingError> {
            Ok(())
        }
        async fn set_remote_description(&self, _sdp: String, _is_offer: bool) -> Result<(), SignalingError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _candidate: IceCandidatePayload) -> Result<(), SignalingError> {
            Ok(())
        }
        fn has_remote_description(&self) -> bool {
            true
        }
        async fn close(&self) -> Result<(), SignalingError> {
            Ok(())
        }
        async fn stats(&self) -> Result<crate::stats::RawStatsSample, SignalingError> {
            Ok(crate::stats::RawStatsSample::default())
        }
        fn on_ice_candidate(&self, _cb: Arc<dyn Fn(IceCandidatePayload) + Send + Sync>) {}
        fn on_connection_state_change(&self, _cb: Arc<dyn Fn(PeerConnState) + Send + Sync>) {}
        fn on_ice_connection_state_change(&self, _cb: Arc<dyn Fn(IceConnState) + Send + Sync>) {}
        fn on_data_channel(&self, _cb: DataChannelCallback) {}
    }

    /// Remembers every peer connection it creates so a test can reach back
    /// in and simulate inbound data-channel traffic on it.
    #[derive(Default)]
    struct RecordingFactory {
        created: StdMutex<Vec<Arc<RecordingPeerConnection>>>,
    }

    impl RecordingFactory {
        fn last(&self) -> Arc<RecordingPeerConnection> {
            self.created.lock().unwrap().last().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for RecordingFactory {
        async fn create(&self) -> Result<Arc<dyn PeerConnectionHandle>, SignalingError> {
            let pc = Arc::new(RecordingPeerConnection::default());
            self.created.lock().unwrap().push(pc.clone());
            Ok(pc)
        }
    }

    fn build_engine(self_id: &str) -> (Arc<SignalingEngine>, Arc<RecordingFactory>, Arc<EventHub>) {
        let local = Arc::new(InProcessLocalChannel::new());
        let fabric = Arc::new(BrokerFabric::new());
        let transport = SignalTransport::new(
            crate::ids::RoomId::parse("room-test").unwrap(),
            PeerId::from(self_id.to_string()),
            "tester".to_string(),
            Platform::Linux,
            fabric,
            local,
        );
        let hub = Arc::new(EventHub::new());
        let control = Arc::new(ControlRouter::new(PeerId::from(self_id.to_string()), "tester".to_string()));
        let factory = Arc::new(RecordingFactory::default());
        let engine = SignalingEngine::new(
            PeerId::from(self_id.to_string()),
            transport,
            factory.clone(),
            hub.clone(),
            control,
        );
        (engine, factory, hub)
    }

    #[tokio::test]
    async fn smaller_self_id_becomes_initiator_on_announce() {
        let (engine, _factory, _hub) = build_engine("AAAA0000AAAA0000");
        engine.clone().handle_announce(PeerId::from("ZZZZ0000ZZZZ0000".to_string())).await;

        let record = engine.peer_record(&PeerId::from("ZZZZ0000ZZZZ0000".to_string())).await.unwrap();
        assert_eq!(*record.state.lock().await, PeerState::Offering);
        assert!(record.chat_dc.lock().await.is_some());
        assert!(record.control_dc.lock().await.is_some());
    }

    #[tokio::test]
    async fn larger_self_id_becomes_responder_and_reannounces() {
        let (engine, _factory, _hub) = build_engine("ZZZZ0000ZZZZ0000");
        engine.clone().handle_announce(PeerId::from("AAAA0000AAAA0000".to_string())).await;

        let record = engine.peer_record(&PeerId::from("AAAA0000AAAA0000".to_string())).await.unwrap();
        assert_eq!(*record.state.lock().await, PeerState::New);
    }

    #[tokio::test]
    async fn valid_chat_payload_on_chat_channel_emits_chat_message_event() {
        let (engine, factory, hub) = build_engine("AAAA0000AAAA0000");
        let peer = PeerId::from("ZZZZ0000ZZZZ0000".to_string());

        let received = Arc::new(StdMutex::new(None));
        let r = received.clone();
        hub.subscribe(Box::new(move |event| {
            if let Event::ChatMessage(msg) = event {
                *r.lock().unwrap() = Some(msg.content.clone());
            }
        }))
        .await;

        engine.clone().handle_announce(peer).await;
        let pc = factory.last();
        let chat_dc = pc.channels.lock().unwrap().get("chat").unwrap().clone();

        let payload = ChatPayload::new(PeerId::from("ZZZZ0000ZZZZ0000".to_string()), "Bob".to_string(), "hello");
        chat_dc.deliver(&serde_json::to_vec(&payload).unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(received.lock().unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn malformed_chat_payload_does_not_emit_an_event() {
        let (engine, factory, hub) = build_engine("AAAA0000AAAA0000");
        let peer = PeerId::from("ZZZZ0000ZZZZ0000".to_string());

        let count = Arc::new(StdMutex::new(0usize));
        let c = count.clone();
        hub.subscribe(Box::new(move |event| {
            if matches!(event, Event::ChatMessage(_)) {
                *c.lock().unwrap() += 1;
            }
        }))
        .await;

        engine.clone().handle_announce(peer).await;
        let pc = factory.last();
        let chat_dc = pc.channels.lock().unwrap().get("chat").unwrap().clone();
        chat_dc.deliver(b"not json");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn busy_rm_request_on_control_channel_gets_an_immediate_reply() {
        let (engine, factory, _hub) = build_engine("AAAA0000AAAA0000");
        let peer = PeerId::from("ZZZZ0000ZZZZ0000".to_string());
        engine.control.remote_mic.lock().await.pending_outgoing_request_id = Some("existing".to_string());

        engine.clone().handle_announce(peer.clone()).await;
        let pc = factory.last();
        let control_dc = pc.channels.lock().unwrap().get("control").unwrap().clone();

        let request = ControlMessage::RemoteMic(crate::control::RemoteMicMessage::RmRequest {
            request_id: "r1".to_string(),
            source_peer_id: peer,
            source_name: "Bob".to_string(),
            target_peer_id: PeerId::from("AAAA0000AAAA0000".to_string()),
            ts: 0,
        });
        control_dc.deliver(&serde_json::to_vec(&request).unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let sent = control_dc.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let reply: ControlMessage = serde_json::from_slice(&sent[0]).unwrap();
        let ControlMessage::RemoteMic(crate::control::RemoteMicMessage::RmResponse { accepted, .. }) = reply else {
            panic!("expected an rm_response");
        };
        assert!(!accepted);
    }
}
