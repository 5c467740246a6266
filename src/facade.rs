//! Top-level facade: the `init`/`join`/`leave`/`dispose` lifecycle that
//! wires transport, broker fabric, signaling engine, session manager and
//! control router into one handle, plus the snapshot accessor UIs poll.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::warn;

use crate::broker::{BrokerFabric, BrokerStatus};
use crate::config::{resolve_brokers, resolve_ice_servers, Config, CredentialLoader};
use crate::control::{AudioRoutingTarget, ControlMessage, ControlRouter, ModerationMessage, RemoteMicMessage, RoutingMode};
use crate::envelope::SignalPayload;
use crate::error::FacadeError;
use crate::events::{ChatMessage, Event, EventHub, NetworkStatus, SignalingState};
use crate::ids::{generate_msg_id, PeerId, RoomId, SessionCounter};
use crate::local_channel::LocalChannel;
use crate::session::{NetworkMonitor, SessionManager};
use crate::signaling::SignalingEngine;
use crate::stats::{ConnectionStats, RawStatsSample};
use crate::transport::SignalTransport;
use crate::webrtc_peer::{IceServerConfig, PeerConnectionFactory, WebRtcPeerConnectionFactory};

/// Point-in-time state, read by `getSnapshot`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub peer_count: usize,
    pub signaling_state: SignalingState,
    pub network: NetworkStatus,
    pub debug_info: Vec<BrokerStatus>,
}

/// Everything constructed fresh on `join` and torn down on `leave`.
struct JoinedState {
    transport: Arc<SignalTransport>,
    fabric: Arc<BrokerFabric>,
    engine: Arc<SignalingEngine>,
    session: Arc<SessionManager>,
    control: Arc<ControlRouter>,
    self_name: String,
}

/// Entry point a host application embeds: one `Facade` per local peer.
pub struct Facade {
    config: Config,
    credential_loader: Arc<dyn CredentialLoader>,
    network: Arc<dyn NetworkMonitor>,
    local_channel: Arc<dyn LocalChannel>,
    hub: Arc<EventHub>,
    self_id: PeerId,
    session_counter: SessionCounter,
    credentials: Mutex<Option<(Vec<String>, Vec<IceServerConfig>)>>,
    signaling_state: Arc<StdMutex<SignalingState>>,
    wired: std::sync::atomic::AtomicBool,
    joined: Mutex<Option<JoinedState>>,
    last_stats: Mutex<std::collections::HashMap<PeerId, RawStatsSample>>,
}

impl Facade {
    pub fn new(
        config: Config,
        credential_loader: Arc<dyn CredentialLoader>,
        network: Arc<dyn NetworkMonitor>,
        local_channel: Arc<dyn LocalChannel>,
    ) -> Self {
        Self {
            config,
            credential_loader,
            network,
            local_channel,
            hub: Arc::new(EventHub::new()),
            self_id: PeerId::generate(),
            session_counter: SessionCounter::new(),
            credentials: Mutex::new(None),
            signaling_state: Arc::new(StdMutex::new(SignalingState::Idle)),
            wired: std::sync::atomic::AtomicBool::new(false),
            joined: Mutex::new(None),
            last_stats: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Preload credentials (ICE servers, broker list) and register the
    /// internal signaling-state tracker. Safe to call more than once; the
    /// second call is a no-op.
    pub async fn init(&self) {
        if !self.wired.swap(true, Ordering::SeqCst) {
            let tracker = self.signaling_state.clone();
            self.hub
                .subscribe(Box::new(move |event| {
                    if let Event::SignalingState(state) = event {
                        *tracker.lock().unwrap_or_else(|p| p.into_inner()) = *state;
                    }
                }))
                .await;
        }

        let mut creds = self.credentials.lock().await;
        if creds.is_none() {
            let brokers = resolve_brokers(&self.config, self.credential_loader.as_ref()).await;
            let ice_servers = resolve_ice_servers(&self.config, self.credential_loader.as_ref()).await;
            *creds = Some((brokers, ice_servers));
        }
    }

    /// Join `room_id`, standing up a fresh transport/fabric/engine/session
    /// quad for it. Rejects synchronously if already in a room or the room
    /// id fails validation; the signaling state is left/returned to idle
    /// in both cases.
    pub async fn join(&self, room_id: &str, user_name: Option<String>) -> Result<(), FacadeError> {
        let room = RoomId::parse(room_id).map_err(|_| FacadeError::InvalidRoomId(room_id.to_string()))?;

        // `try_lock` so a concurrent `join` (or one already in a room)
        // rejects synchronously instead of queueing behind this one.
        let mut joined = self.joined.try_lock().map_err(|_| FacadeError::JoinInProgress)?;
        if joined.is_some() {
            return Err(FacadeError::JoinInProgress);
        }

        self.init().await;
        self.set_signaling_state(SignalingState::Joining).await;

        let session_id = self.session_counter.advance();
        let (brokers, ice_servers) = self.credentials.lock().await.clone().unwrap_or_default();
        let display_name = user_name.unwrap_or_else(|| self.config.display_name.clone());

        let fabric = Arc::new(BrokerFabric::new());
        let transport = SignalTransport::new(
            room,
            self.self_id.clone(),
            display_name.clone(),
            self.config.platform,
            fabric.clone(),
            self.local_channel.clone(),
        );
        transport.set_session_id(session_id);

        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(WebRtcPeerConnectionFactory::new(ice_servers));
        let control = Arc::new(ControlRouter::new(self.self_id.clone(), display_name.clone()));
        let engine = SignalingEngine::new(self.self_id.clone(), transport.clone(), factory, self.hub.clone(), control.clone());

        let session = SessionManager::new(transport.clone(), engine.clone(), fabric.clone(), self.hub.clone(), self.network.clone());
        session.wire().await;
        session.set_broker_urls(brokers.clone()).await;

        let connected = fabric.connect_all(&brokers).await;
        if brokers.is_empty() {
            warn!("no mqtt brokers configured, falling back to same-host signaling only");
        } else if connected.is_empty() {
            warn!("no configured mqtt broker could be reached, continuing with same-host signaling only");
        }

        let dispatch_engine = engine.clone();
        transport
            .start(Arc::new(move |envelope| {
                let engine = dispatch_engine.clone();
                Box::pin(async move { engine.handle_envelope(envelope).await })
            }))
            .await;

        session.start_discovery().await;

        *joined = Some(JoinedState { transport, fabric, engine, session, control, self_name: display_name });
        Ok(())
    }

    /// Leave the current room, if any. Best-effort and infallible: stops
    /// the announce/heartbeat cadences, broadcasts a `leave` envelope, tears
    /// down every peer connection, disconnects the broker fabric and the
    /// local channel, resets control/moderation state, and returns the
    /// signaling state to idle.
    pub async fn leave(&self) {
        let Some(state) = self.joined.lock().await.take() else {
            return;
        };

        state.session.stop().await;
        state.transport.broadcast(SignalPayload::Leave).await;

        for peer_id in state.engine.known_peer_ids().await {
            state.engine.teardown_peer(&peer_id).await;
        }

        state.fabric.disconnect().await;
        self.local_channel.close().await;
        state.control.reset().await;
        self.last_stats.lock().await.clear();

        self.set_signaling_state(SignalingState::Idle).await;
    }

    /// `leave` plus dropping every event subscriber. Once disposed, the
    /// facade is still safe to `join` again, but existing listeners are gone.
    pub async fn dispose(&self) {
        self.leave().await;
        self.hub.clear_listeners().await;
        self.wired.store(false, Ordering::SeqCst);
    }

    /// Bypass the offline latch and force a reconnect attempt now; a no-op
    /// outside a room.
    pub async fn manual_reconnect(&self) {
        if let Some(state) = self.joined.lock().await.as_ref() {
            state.session.manual_reconnect().await;
        }
    }

    /// Send a chat message to every connected peer over the `chat` data
    /// channel and echo it locally as a `chatMessage` event.
    pub async fn send_chat_message(&self, content: &str) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let payload = state.engine.send_chat_message(self.self_id.clone(), state.self_name.clone(), content).await;
        self.hub
            .emit(Event::ChatMessage(ChatMessage {
                id: payload.id,
                sender_id: payload.sender_id,
                sender_name: payload.sender_name,
                content: payload.content,
                timestamp: payload.timestamp,
            }))
            .await;
        Ok(())
    }

    /// Register the host's per-peer audio-routing hook. Called once per
    /// peer as connections come up; re-registering replaces the prior hook
    /// and re-applies the current routing mode to it.
    pub async fn register_audio_routing_target(&self, peer_id: PeerId, target: Arc<dyn AudioRoutingTarget>) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        state.engine.register_audio_routing_target(peer_id, target).await;
        Ok(())
    }

    /// Switch audio routing mode (broadcast, or exclusive to one peer)
    /// across every registered target.
    pub async fn set_audio_routing_mode(&self, mode: RoutingMode, target: Option<PeerId>) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        state.engine.set_routing_mode(mode, target).await.map_err(|e| FacadeError::Control(e.to_string()))
    }

    /// Request `target`'s microphone for the remote-mic handoff.
    pub async fn request_remote_mic(&self, target: PeerId) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let message = state.control.remote_mic.lock().await.start_request(&self.self_id, &state.self_name, target.clone());
        state
            .engine
            .send_control_message(&target, &ControlMessage::RemoteMic(message))
            .await
            .map_err(|e| FacadeError::Control(e.to_string()))
    }

    /// Accept or reject an incoming `RemoteMicControl::IncomingRequest`.
    pub async fn respond_remote_mic_request(&self, request_id: String, accept: bool, reason: Option<String>) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;

        let source_peer = {
            let mut remote_mic = state.control.remote_mic.lock().await;
            let source_peer = remote_mic
                .pending_incoming
                .remove(&request_id)
                .ok_or_else(|| FacadeError::Control("no pending remote-mic request with that id".to_string()))?;
            if accept {
                remote_mic.active_source_peer_id = Some(source_peer.clone());
                remote_mic.active_request_id = Some(request_id.clone());
            }
            source_peer
        };

        let message = RemoteMicMessage::RmResponse { request_id, accepted: accept, reason, ts: chrono::Utc::now().timestamp_millis() };
        state
            .engine
            .send_control_message(&source_peer, &ControlMessage::RemoteMic(message))
            .await
            .map_err(|e| FacadeError::Control(e.to_string()))
    }

    /// End whichever remote-mic session (outgoing or incoming) is active or
    /// pending, notifying the peer and surfacing the `Stopped` event locally.
    pub async fn stop_remote_mic(&self, reason: &str) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;

        let (request_id, peer) = {
            let remote_mic = state.control.remote_mic.lock().await;
            let request_id = remote_mic
                .active_request_id
                .clone()
                .or_else(|| remote_mic.pending_outgoing_request_id.clone())
                .ok_or_else(|| FacadeError::Control("no active remote-mic session".to_string()))?;
            let peer = remote_mic
                .active_target_peer_id
                .clone()
                .or_else(|| remote_mic.active_source_peer_id.clone())
                .ok_or_else(|| FacadeError::Control("no active remote-mic peer".to_string()))?;
            (request_id, peer)
        };

        let normalized = crate::control::normalize_stop_reason(reason);
        let message = RemoteMicMessage::RmStop { request_id: request_id.clone(), reason: normalized.clone(), ts: chrono::Utc::now().timestamp_millis() };
        let send_result = state.engine.send_control_message(&peer, &ControlMessage::RemoteMic(message)).await;

        if let Some(event) = state.control.remote_mic.lock().await.handle_stop(&request_id, &normalized) {
            self.hub.emit(Event::RemoteMicControl(event)).await;
        }

        send_result.map_err(|e| FacadeError::Control(e.to_string()))
    }

    /// Lock or unlock the room, owning the lock as self when locking.
    /// Broadcast over the signal transport so peers not yet connected over
    /// a data channel still observe it.
    pub async fn set_room_lock(&self, locked: bool) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let owner = locked.then(|| self.self_id.clone());
        let event = state.control.moderation.lock().await.set_room_lock(locked, owner);
        self.hub.emit(Event::ModerationControl(event)).await;
        state.transport.broadcast(SignalPayload::RoomLock { locked }).await;
        Ok(())
    }

    /// Ask every connected peer to mute (or unmute) all.
    pub async fn request_mute_all(&self, muted: bool) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let message = ControlMessage::Moderation(ModerationMessage::MuteAllRequest { request_id: generate_msg_id(), muted });
        state.engine.broadcast_control_message(&message).await;
        Ok(())
    }

    /// Respond to an inbound `MuteAllRequested` event.
    pub async fn respond_mute_all(&self, request_id: String, accepted: bool) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let requester = state
            .control
            .moderation
            .lock()
            .await
            .pending_mute_all_requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| FacadeError::Control("no pending mute-all request with that id".to_string()))?;
        let message = ControlMessage::Moderation(ModerationMessage::MuteAllResponse { request_id, accepted });
        state
            .engine
            .send_control_message(&requester, &message)
            .await
            .map_err(|e| FacadeError::Control(e.to_string()))
    }

    /// Raise or lower the local hand, broadcasting it to every peer.
    pub async fn set_hand_raised(&self, raised: bool) -> Result<(), FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let now = chrono::Utc::now().timestamp_millis();
        let event = state.control.moderation.lock().await.set_hand_raised(self.self_id.clone(), raised, now);
        self.hub.emit(Event::ModerationControl(event)).await;
        let message = ControlMessage::Moderation(ModerationMessage::HandRaise { raised });
        state.engine.broadcast_control_message(&message).await;
        Ok(())
    }

    /// Sample connection quality for one peer. Keeps the previous sample
    /// per peer so packet loss is computed as a delta between polls rather
    /// than a cumulative ratio since connect.
    pub async fn get_connection_stats(&self, peer_id: &PeerId) -> Result<ConnectionStats, FacadeError> {
        let joined = self.joined.lock().await;
        let state = joined.as_ref().ok_or(FacadeError::NotInRoom)?;
        let previous = self.last_stats.lock().await.get(peer_id).copied();
        let (stats, sample) = state
            .engine
            .connection_stats(peer_id, previous)
            .await
            .map_err(|e| FacadeError::Signaling(e.to_string()))?;
        self.last_stats.lock().await.insert(peer_id.clone(), sample);
        Ok(stats)
    }

    pub async fn get_snapshot(&self) -> Snapshot {
        let signaling_state = *self.signaling_state.lock().unwrap_or_else(|p| p.into_inner());
        let is_online = self.network.is_online().await;
        let joined = self.joined.lock().await;
        match joined.as_ref() {
            Some(state) => {
                let (was_in_room_when_offline, reconnect_attempts) = state.session.network_snapshot();
                Snapshot {
                    peer_count: state.engine.healthy_peer_count().await,
                    signaling_state,
                    network: NetworkStatus { is_online, was_in_room_when_offline, reconnect_attempts },
                    debug_info: state.fabric.status().await,
                }
            }
            None => Snapshot {
                peer_count: 0,
                signaling_state,
                network: NetworkStatus { is_online, was_in_room_when_offline: false, reconnect_attempts: 0 },
                debug_info: Vec::new(),
            },
        }
    }

    async fn set_signaling_state(&self, state: SignalingState) {
        *self.signaling_state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        self.hub.emit(Event::SignalingState(state)).await;
    }
}
