//! Session/liveness manager: announce and heartbeat cadences, the
//! disconnect-grace timer and ICE-restart ladder, and full reconnect on
//! device-level network loss. Drives `crate::signaling::SignalingEngine`
//! rather than owning peer state itself.

pub mod network;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{backoff_delay, BrokerFabric};
use crate::envelope::SignalPayload;
use crate::events::{EventHub, NetworkStatus, SignalingState};
use crate::ids::PeerId;
use crate::signaling::{PeerState, SignalingEngine};
use crate::timing::{
    ANNOUNCE_INTERVAL, ANNOUNCE_STEADY_STATE_MIN_ELAPSED, BROKER_BACKOFF_MAX_ATTEMPTS,
    DISCONNECT_GRACE, HEARTBEAT_INTERVAL, ICE_RESTART_MAX_ATTEMPTS, PEER_STALE_THRESHOLD,
};
use crate::events::Event;
use crate::transport::SignalTransport;

pub use network::{ManualNetworkMonitor, NetworkMonitor};

pub struct SessionManager {
    transport: Arc<SignalTransport>,
    engine: Arc<SignalingEngine>,
    fabric: Arc<BrokerFabric>,
    hub: Arc<EventHub>,
    network: Arc<dyn NetworkMonitor>,
    broker_urls: Mutex<Vec<String>>,
    in_room: AtomicBool,
    announce_start: Mutex<Option<Instant>>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    was_in_room_when_offline: AtomicBool,
    network_reconnect_attempts: AtomicU32,
}

impl SessionManager {
    pub fn new(
        transport: Arc<SignalTransport>,
        engine: Arc<SignalingEngine>,
        fabric: Arc<BrokerFabric>,
        hub: Arc<EventHub>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            engine,
            fabric,
            hub,
            network,
            broker_urls: Mutex::new(Vec::new()),
            in_room: AtomicBool::new(false),
            announce_start: Mutex::new(None),
            announce_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            was_in_room_when_offline: AtomicBool::new(false),
            network_reconnect_attempts: AtomicU32::new(0),
        })
    }

    /// Wire the signaling engine's ICE-trouble hook and the network monitor's
    /// change listener back into this manager. Call once, before `join`.
    pub async fn wire(self: &Arc<Self>) {
        let this = self.clone();
        self.engine
            .set_ice_trouble_hook(Arc::new(move |peer_id| {
                let this = this.clone();
                tokio::spawn(async move { this.on_ice_trouble(peer_id).await });
            }))
            .await;

        let this = self.clone();
        self.network
            .on_change(Arc::new(move |online| {
                let this = this.clone();
                tokio::spawn(async move { this.on_network_change(online).await });
            }))
            .await;
    }

    pub async fn set_broker_urls(&self, urls: Vec<String>) {
        *self.broker_urls.lock().await = urls;
    }

    /// `(was_in_room_when_offline, network_reconnect_attempts)`, for the
    /// facade's snapshot accessor.
    pub fn network_snapshot(&self) -> (bool, u32) {
        (
            self.was_in_room_when_offline.load(Ordering::SeqCst),
            self.network_reconnect_attempts.load(Ordering::SeqCst),
        )
    }

    /// Enter discovery: reset `announce_start`, (re)start the announce loop,
    /// and ensure the heartbeat loop is running.
    pub async fn start_discovery(self: &Arc<Self>) {
        self.in_room.store(true, Ordering::SeqCst);
        *self.announce_start.lock().await = Some(Instant::now());
        self.hub.emit(Event::SignalingState(SignalingState::Announcing)).await;

        if let Some(old) = self.announce_task.lock().await.take() {
            old.abort();
        }
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_announce_loop().await });
        *self.announce_task.lock().await = Some(handle);

        let mut heartbeat = self.heartbeat_task.lock().await;
        if heartbeat.is_none() {
            let this = self.clone();
            *heartbeat = Some(tokio::spawn(async move { this.run_heartbeat_loop().await }));
        }
    }

    /// Stop every cadence this manager owns. Called on `leave`/`dispose`.
    pub async fn stop(&self) {
        self.in_room.store(false, Ordering::SeqCst);
        if let Some(t) = self.announce_task.lock().await.take() {
            t.abort();
        }
        if let Some(t) = self.heartbeat_task.lock().await.take() {
            t.abort();
        }
        *self.announce_start.lock().await = None;
        self.was_in_room_when_offline.store(false, Ordering::SeqCst);
        self.network_reconnect_attempts.store(0, Ordering::SeqCst);
    }

    async fn run_announce_loop(self: Arc<Self>) {
        self.transport.broadcast(SignalPayload::Announce).await;
        loop {
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
            let elapsed = self.announce_start.lock().await.map(|t| t.elapsed());
            let healthy = self.engine.healthy_peer_count().await;
            if healthy >= 1 && elapsed.is_some_and(|e| e >= ANNOUNCE_STEADY_STATE_MIN_ELAPSED) {
                debug!("announce loop reached steady state with {healthy} healthy peer(s)");
                self.hub.emit(Event::SignalingState(SignalingState::Connected)).await;
                return;
            }
            self.transport.broadcast(SignalPayload::Announce).await;
        }
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let now = chrono::Utc::now().timestamp_millis();
            for peer_id in self.engine.known_peer_ids().await {
                let Some(record) = self.engine.peer_record(&peer_id).await else { continue };
                let last_seen = *record.last_seen_ms.lock().await;
                if now - last_seen > PEER_STALE_THRESHOLD.as_millis() as i64 {
                    self.transport.send_to_peer(peer_id, SignalPayload::Ping).await;
                }
            }
        }
    }

    /// Invoked by the signaling engine whenever a peer's ICE connection
    /// state becomes `disconnected` or `failed`.
    async fn on_ice_trouble(self: Arc<Self>, peer_id: PeerId) {
        let Some(record) = self.engine.peer_record(&peer_id).await else { return };
        let mut slot = record.disconnect_timer.lock().await;
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        let pid = peer_id.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE).await;
            this.run_ice_restart_ladder(pid).await;
        }));
    }

    async fn run_ice_restart_ladder(self: Arc<Self>, peer_id: PeerId) {
        let Some(record) = self.engine.peer_record(&peer_id).await else { return };
        record.disconnect_timer.lock().await.take();

        loop {
            if record.is_connected.load(Ordering::SeqCst) {
                return;
            }
            let attempts_so_far = record.ice_restart_attempts.load(Ordering::SeqCst);
            if attempts_so_far >= ICE_RESTART_MAX_ATTEMPTS {
                warn!("peer {peer_id} exhausted ice restart attempts, tearing down");
                self.engine.teardown_peer(&peer_id).await;
                self.maybe_restart_discovery().await;
                return;
            }
            if let Err(e) = self.engine.ice_restart(&peer_id).await {
                warn!("ice restart failed for {peer_id}: {e}");
                self.engine.teardown_peer(&peer_id).await;
                self.maybe_restart_discovery().await;
                return;
            }
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        }
    }

    async fn maybe_restart_discovery(self: &Arc<Self>) {
        if self.in_room.load(Ordering::SeqCst) && self.engine.healthy_peer_count().await == 0 {
            self.start_discovery().await;
        }
    }

    async fn on_network_change(self: Arc<Self>, online: bool) {
        if !online {
            let was_in_room = self.in_room.load(Ordering::SeqCst);
            self.was_in_room_when_offline.store(was_in_room, Ordering::SeqCst);
            self.hub
                .emit(Event::NetworkStatus(NetworkStatus {
                    is_online: false,
                    was_in_room_when_offline: was_in_room,
                    reconnect_attempts: 0,
                }))
                .await;
            return;
        }

        if !self.was_in_room_when_offline.load(Ordering::SeqCst) {
            self.hub
                .emit(Event::NetworkStatus(NetworkStatus {
                    is_online: true,
                    was_in_room_when_offline: false,
                    reconnect_attempts: 0,
                }))
                .await;
            return;
        }

        self.reconnect_after_network_loss().await;
    }

    /// The manual reconnect entry point exposed to the UI: identical to the
    /// automatic offline->online path but bypasses the offline latch.
    pub async fn manual_reconnect(self: &Arc<Self>) {
        self.reconnect_after_network_loss().await;
    }

    async fn reconnect_after_network_loss(self: &Arc<Self>) {
        let urls = self.broker_urls.lock().await.clone();
        let mut attempt = 0u32;
        if !urls.is_empty() {
            loop {
                attempt += 1;
                self.network_reconnect_attempts.store(attempt, Ordering::SeqCst);
                self.fabric.connect_all(&urls).await;
                if self.fabric.any_connected().await {
                    break;
                }
                if attempt >= BROKER_BACKOFF_MAX_ATTEMPTS {
                    warn!("network reconnect exhausted {attempt} attempts, giving up on mqtt");
                    break;
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        self.was_in_room_when_offline.store(false, Ordering::SeqCst);
        self.hub
            .emit(Event::NetworkStatus(NetworkStatus {
                is_online: true,
                was_in_room_when_offline: true,
                reconnect_attempts: self.network_reconnect_attempts.load(Ordering::SeqCst),
            }))
            .await;

        for peer_id in self.engine.known_peer_ids().await {
            let Some(record) = self.engine.peer_record(&peer_id).await else { continue };
            let troubled = matches!(*record.state.lock().await, PeerState::Reconnecting | PeerState::Disconnected | PeerState::Failed);
            if troubled {
                self.engine.reset_ice_restart_attempts(&peer_id).await;
                if let Err(e) = self.engine.ice_restart(&peer_id).await {
                    warn!("post-reconnect ice restart failed for {peer_id}: {e}");
                }
            }
        }

        self.start_discovery().await;
    }
}
