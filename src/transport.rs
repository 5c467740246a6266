//! Signal transport: topic naming, envelope construction, and the inbound
//! filter that turns broker/local-channel traffic into a single, deduped
//! stream of envelopes destined for the signaling state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::broker::BrokerFabric;
use crate::dedup::Deduplicator;
use crate::envelope::{Platform, SignalEnvelope, SignalPayload};
use crate::ids::{PeerId, RoomId};
use crate::local_channel::LocalChannel;

/// Returns a future rather than firing fully synchronously so the caller's
/// dispatch can be awaited by the single worker in [`SignalTransport::start`]
/// without losing arrival order.
pub type EnvelopeHandler = Arc<dyn Fn(SignalEnvelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Broadcasts and targeted-sends signal envelopes over both the broker
/// fabric and the same-host local channel, and filters inbound traffic
/// down to what the signaling engine should actually see.
pub struct SignalTransport {
    room: RoomId,
    self_id: PeerId,
    self_name: Mutex<String>,
    platform: Platform,
    session_id: AtomicU64,
    fabric: Arc<BrokerFabric>,
    local: Arc<dyn LocalChannel>,
    dedup: Mutex<Deduplicator>,
}

impl SignalTransport {
    pub fn new(
        room: RoomId,
        self_id: PeerId,
        self_name: String,
        platform: Platform,
        fabric: Arc<BrokerFabric>,
        local: Arc<dyn LocalChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room,
            self_id,
            self_name: Mutex::new(self_name),
            platform,
            session_id: AtomicU64::new(0),
            fabric,
            local,
            dedup: Mutex::new(Deduplicator::default()),
        })
    }

    /// The session id envelopes are currently stamped with and filtered
    /// against. Advanced by the caller (session manager) on every `join`.
    pub fn set_session_id(&self, session_id: u64) {
        self.session_id.store(session_id, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    fn topic(&self) -> String {
        self.room.topic()
    }

    /// Subscribe both the fabric and the local channel to the room topic.
    /// Both sources feed a single worker task that processes payloads one
    /// at a time, in the order they arrive — a per-envelope detached task
    /// would let two ICE-candidate payloads for the same peer race each
    /// other and reach the handler out of order.
    pub async fn start(self: &Arc<Self>, on_envelope: EnvelopeHandler) {
        let topic = self.topic();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                this.process_inbound(payload, &on_envelope).await;
            }
        });

        let fabric_tx = tx.clone();
        self.fabric
            .subscribe_all(
                &topic,
                Arc::new(move |_topic, payload| {
                    let _ = fabric_tx.send(payload.to_string());
                }),
            )
            .await;

        self.local
            .subscribe(
                &topic,
                Arc::new(move |payload: &str| {
                    let _ = tx.send(payload.to_string());
                }),
            )
            .await;
    }

    async fn process_inbound(&self, payload: String, handler: &EnvelopeHandler) {
        let envelope: SignalEnvelope = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(e) => {
                warn!("dropping malformed signal envelope: {e}");
                return;
            }
        };

        if envelope.from == self.self_id {
            return;
        }
        if let Some(to) = &envelope.to {
            if *to != self.self_id {
                return;
            }
        }
        let current_session = self.session_id();
        if envelope.session_id != current_session {
            debug!(
                "dropping stale-session envelope from {} (session {} != {})",
                envelope.from, envelope.session_id, current_session
            );
            return;
        }
        if !self.dedup.lock().await.check_and_insert(&envelope.msg_id) {
            return;
        }

        if !envelope.payload.suppresses_debug_log() {
            debug!("dispatching {} from {}", envelope.payload.type_name(), envelope.from);
        }
        handler(envelope).await;
    }

    /// Broadcast `payload` to the whole room: publish to the fabric and
    /// post to the local channel. Local-channel delivery failures are not
    /// possible by construction (the trait's `post` is infallible) but are
    /// treated as best-effort regardless.
    pub async fn broadcast(&self, payload: SignalPayload) -> SignalEnvelope {
        let envelope = self.build_envelope(payload).await;
        self.send(&envelope).await;
        envelope
    }

    /// Send `payload` to a single peer: stamp `to` and the current session
    /// id, then broadcast (the inbound filter on the receiver's side does
    /// the actual targeting).
    pub async fn send_to_peer(&self, peer: PeerId, payload: SignalPayload) -> SignalEnvelope {
        let envelope = self.build_envelope(payload).await.with_to(peer);
        self.send(&envelope).await;
        envelope
    }

    pub async fn set_self_name(&self, name: String) {
        *self.self_name.lock().await = name;
    }

    async fn build_envelope(&self, payload: SignalPayload) -> SignalEnvelope {
        let self_name = self.self_name.lock().await.clone();
        SignalEnvelope::new(self.self_id.clone(), self.session_id(), payload)
            .with_identity(self_name, self.platform)
    }

    async fn send(&self, envelope: &SignalEnvelope) {
        let json = match serde_json::to_string(envelope) {
            Ok(j) => j,
            Err(e) => {
                warn!("failed to encode outbound envelope: {e}");
                return;
            }
        };
        if !envelope.payload.suppresses_debug_log() {
            debug!("broadcasting {} to {:?}", envelope.payload.type_name(), envelope.to);
        }
        let topic = self.topic();
        self.fabric.publish(&topic, &json).await;
        self.local.post(&topic, &json).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_channel::InProcessLocalChannel;
    use std::sync::atomic::AtomicUsize;

    fn test_room() -> RoomId {
        RoomId::parse("room-test").unwrap()
    }

    fn test_transport(
        id: &str,
        fabric: Arc<BrokerFabric>,
        local: Arc<dyn LocalChannel>,
    ) -> Arc<SignalTransport> {
        SignalTransport::new(
            test_room(),
            PeerId::from(id.to_string()),
            "tester".to_string(),
            Platform::Linux,
            fabric,
            local,
        )
    }

    #[tokio::test]
    async fn broadcast_is_delivered_via_local_channel_to_another_peer() {
        let local = Arc::new(InProcessLocalChannel::new());
        let fabric = Arc::new(BrokerFabric::new());

        let a = test_transport("AAAA0000AAAA0000", fabric.clone(), local.clone());
        let b = test_transport("ZZZZ0000ZZZZ0000", fabric, local);

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        b.start(Arc::new(move |env| {
            let r2 = r2.clone();
            Box::pin(async move {
                assert!(matches!(env.payload, SignalPayload::Announce));
                r2.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;
        a.start(Arc::new(|_| Box::pin(async {}))).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        a.broadcast(SignalPayload::Announce).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn self_originated_envelope_is_not_dispatched_back() {
        let local = Arc::new(InProcessLocalChannel::new());
        let fabric = Arc::new(BrokerFabric::new());
        let a = test_transport("AAAA0000AAAA0000", fabric, local);

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        a.start(Arc::new(move |_| {
            let r2 = r2.clone();
            Box::pin(async move {
                r2.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        a.broadcast(SignalPayload::Announce).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn targeted_envelope_to_other_peer_is_dropped() {
        let local = Arc::new(InProcessLocalChannel::new());
        let fabric = Arc::new(BrokerFabric::new());

        let a = test_transport("AAAA0000AAAA0000", fabric.clone(), local.clone());
        let b = test_transport("ZZZZ0000ZZZZ0000", fabric.clone(), local.clone());
        let c = test_transport("CCCC0000CCCC0000", fabric, local);

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        c.start(Arc::new(move |_| {
            let r2 = r2.clone();
            Box::pin(async move {
                r2.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;
        a.start(Arc::new(|_| Box::pin(async {}))).await;
        b.start(Arc::new(|_| Box::pin(async {}))).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        a.send_to_peer(
            PeerId::from("ZZZZ0000ZZZZ0000".to_string()),
            SignalPayload::Ping,
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_msg_id_is_dispatched_once() {
        let local = Arc::new(InProcessLocalChannel::new());
        let fabric = Arc::new(BrokerFabric::new());

        let a = test_transport("AAAA0000AAAA0000", fabric.clone(), local.clone());
        let b = test_transport("ZZZZ0000ZZZZ0000", fabric, local);

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        b.start(Arc::new(move |_| {
            let r2 = r2.clone();
            Box::pin(async move {
                r2.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;
        a.start(Arc::new(|_| Box::pin(async {}))).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let topic = test_room().topic();
        let payload = r#"{"v":1,"type":"announce","from":"AAAA0000AAAA0000","msgId":"dup-1","sessionId":0,"ts":0}"#;
        a.local.post(&topic, payload).await;
        a.local.post(&topic, payload).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
