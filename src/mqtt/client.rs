//! A single-broker MQTT client: connect, keep-alive, subscribe registry,
//! publish.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::{self, Frame, MqttError};
use super::transport::{FrameAccumulator, MqttTransport, TransportError, TransportReader, TransportWriter};
use crate::timing::{MQTT_CONNECT_TIMEOUT, MQTT_KEEPALIVE_DECLARED, MQTT_KEEPALIVE_INTERVAL};

pub type PublishHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Subscription {
    handler: PublishHandler,
}

/// One broker connection. Subscriptions (topic + handler) are retained
/// across disconnects so callers can resubscribe on reconnect.
pub struct MqttClient {
    url: String,
    credentials: Option<(String, String)>,
    writer: Arc<Mutex<Option<Box<dyn TransportWriter>>>>,
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
    next_packet_id: Arc<Mutex<u16>>,
    pending_suback: Arc<Mutex<HashMap<u16, mpsc::Sender<u8>>>>,
    on_disconnect: Arc<RwLock<Option<Box<dyn Fn() + Send + Sync>>>>,
    last_send: Arc<Mutex<std::time::Instant>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<RwLock<bool>>,
    disconnect_notified: Arc<RwLock<bool>>,
}

impl MqttClient {
    pub fn new(url: impl Into<String>, credentials: Option<(String, String)>) -> Self {
        Self {
            url: url.into(),
            credentials,
            writer: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            next_packet_id: Arc::new(Mutex::new(1)),
            pending_suback: Arc::new(Mutex::new(HashMap::new())),
            on_disconnect: Arc::new(RwLock::new(None)),
            last_send: Arc::new(Mutex::new(std::time::Instant::now())),
            keepalive_task: Mutex::new(None),
            reader_task: Mutex::new(None),
            connected: Arc::new(RwLock::new(false)),
            disconnect_notified: Arc::new(RwLock::new(true)),
        }
    }

    pub async fn set_on_disconnect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_disconnect.write().await = Some(Box::new(callback));
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    /// Open the transport, send CONNECT, wait (up to 10s) for CONNACK=0,
    /// then start the keep-alive loop and the inbound reader loop.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let transport = super::transport::WebSocketTransport::connect(&self.url)
            .await
            .map_err(transport_to_mqtt_err)?;
        self.connect_with(transport).await
    }

    /// Connect using an already-constructed transport (used directly by
    /// tests to inject an in-memory duplex).
    pub async fn connect_with(&self, transport: impl MqttTransport + 'static) -> Result<(), MqttError> {
        let mut transport: Box<dyn MqttTransport> = Box::new(transport);

        let client_id = crate::ids::generate_msg_id();
        let username = self.credentials.as_ref().map(|c| c.0.clone());
        let password = self.credentials.as_ref().map(|c| c.1.clone());

        let connect_frame = Frame::Connect {
            client_id,
            keep_alive: MQTT_KEEPALIVE_DECLARED,
            username,
            password,
            clean_session: true,
        };
        transport
            .send(codec::encode(&connect_frame)?.to_vec())
            .await
            .map_err(transport_to_mqtt_err)?;

        let connack = tokio::time::timeout(MQTT_CONNECT_TIMEOUT, wait_for_connack(&mut *transport))
            .await
            .map_err(|_| MqttError::MalformedFrame("CONNECT timed out".to_string()))??;
        codec::check_connack(connack)?;

        let (writer, reader) = transport.into_split();

        *self.connected.write().await = true;
        *self.disconnect_notified.write().await = false;
        *self.writer.lock().await = Some(writer);
        *self.last_send.lock().await = std::time::Instant::now();

        self.spawn_keepalive().await;
        self.spawn_reader(reader).await;
        Ok(())
    }

    async fn spawn_keepalive(&self) {
        let writer = self.writer.clone();
        let last_send = self.last_send.clone();
        let connected = self.connected.clone();
        let on_disconnect = self.on_disconnect.clone();
        let disconnect_notified = self.disconnect_notified.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(MQTT_KEEPALIVE_INTERVAL).await;
                if !*connected.read().await {
                    return;
                }
                if last_send.lock().await.elapsed() < MQTT_KEEPALIVE_INTERVAL {
                    continue;
                }
                let mut guard = writer.lock().await;
                let Some(t) = guard.as_mut() else { return };
                let Ok(bytes) = codec::encode(&Frame::PingReq) else { continue };
                if t.send(bytes.to_vec()).await.is_err() {
                    drop(guard);
                    fire_disconnect(&connected, &on_disconnect, &disconnect_notified).await;
                    return;
                }
                *last_send.lock().await = std::time::Instant::now();
            }
        });

        if let Some(old) = self.keepalive_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Run the inbound loop over its own read half, never touching the
    /// writer lock — a reader that blocked on `recv` while holding that
    /// lock would starve every concurrent `publish`/`subscribe`/keep-alive.
    async fn spawn_reader(&self, mut reader: Box<dyn TransportReader>) {
        let subscriptions = self.subscriptions.clone();
        let pending_suback = self.pending_suback.clone();
        let connected = self.connected.clone();
        let on_disconnect = self.on_disconnect.clone();
        let disconnect_notified = self.disconnect_notified.clone();

        let handle = tokio::spawn(async move {
            let mut acc = FrameAccumulator::default();
            loop {
                let chunk = reader.recv().await;
                match chunk {
                    Some(Ok(bytes)) => {
                        acc.push(&bytes);
                        match acc.drain_frames() {
                            Ok(frames) => {
                                for frame in frames {
                                    handle_inbound_frame(frame, &subscriptions, &pending_suback).await;
                                }
                            }
                            Err(e) => warn!("mqtt codec error: {e}"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!("mqtt transport error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            fire_disconnect(&connected, &on_disconnect, &disconnect_notified).await;
        });

        if let Some(old) = self.reader_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Allocate the next packet id, wrapping 1..=65535 (0 is reserved).
    async fn next_packet_id(&self) -> u16 {
        let mut guard = self.next_packet_id.lock().await;
        let id = *guard;
        *guard = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    pub async fn subscribe(&self, topic: &str, handler: PublishHandler) -> Result<(), MqttError> {
        let packet_id = self.next_packet_id().await;
        let (tx, mut rx) = mpsc::channel(1);
        self.pending_suback.lock().await.insert(packet_id, tx);

        self.subscriptions
            .write()
            .await
            .insert(topic.to_string(), Subscription { handler });

        let frame = Frame::Subscribe {
            packet_id,
            topic: topic.to_string(),
        };
        self.send_frame(&frame).await?;

        let return_code = rx
            .recv()
            .await
            .ok_or_else(|| MqttError::MalformedFrame("suback channel closed".to_string()))?;
        codec::check_suback(return_code)
    }

    /// Topics this client is registered against, for fabric-driven resubscribe.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> bool {
        let frame = Frame::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        self.send_frame(&frame).await.is_ok()
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), MqttError> {
        let mut guard = self.writer.lock().await;
        let Some(t) = guard.as_mut() else {
            return Err(MqttError::MalformedFrame("transport not open".to_string()));
        };
        let bytes = codec::encode(frame)?;
        t.send(bytes.to_vec()).await.map_err(transport_to_mqtt_err)?;
        drop(guard);
        *self.last_send.lock().await = std::time::Instant::now();
        Ok(())
    }

    /// Send DISCONNECT best-effort, stop keep-alive, close the transport.
    /// The on-disconnect callback fires exactly once per session: marking
    /// `disconnect_notified` here suppresses the reader/keep-alive loops'
    /// own disconnect notice for this deliberate shutdown.
    pub async fn disconnect(&self) {
        *self.disconnect_notified.write().await = true;
        *self.connected.write().await = false;
        if let Some(t) = self.keepalive_task.lock().await.take() {
            t.abort();
        }
        if let Some(t) = self.reader_task.lock().await.take() {
            t.abort();
        }
        let mut guard = self.writer.lock().await;
        if let Some(t) = guard.as_mut() {
            if let Ok(bytes) = codec::encode(&Frame::Disconnect) {
                let _ = t.send(bytes.to_vec()).await;
            }
            t.close().await;
        }
        *guard = None;
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn fire_disconnect(
    connected: &Arc<RwLock<bool>>,
    on_disconnect: &Arc<RwLock<Option<Box<dyn Fn() + Send + Sync>>>>,
    disconnect_notified: &Arc<RwLock<bool>>,
) {
    let mut notified = disconnect_notified.write().await;
    if *notified {
        return;
    }
    *notified = true;
    *connected.write().await = false;
    drop(notified);
    if let Some(cb) = on_disconnect.read().await.as_ref() {
        cb();
    }
}

async fn handle_inbound_frame(
    frame: Frame,
    subscriptions: &Arc<RwLock<HashMap<String, Subscription>>>,
    pending_suback: &Arc<Mutex<HashMap<u16, mpsc::Sender<u8>>>>,
) {
    match frame {
        Frame::Publish { topic, payload } => {
            let subs = subscriptions.read().await;
            if let Some(sub) = subs.get(&topic) {
                debug!("mqtt publish received on {topic}");
                (sub.handler)(&topic, &payload);
            }
        }
        Frame::Suback { packet_id, return_code } => {
            if let Some(tx) = pending_suback.lock().await.remove(&packet_id) {
                let _ = tx.send(return_code).await;
            }
        }
        Frame::PingResp | Frame::Disconnect => {}
        _ => {}
    }
}

async fn wait_for_connack(transport: &mut dyn MqttTransport) -> Result<u8, MqttError> {
    let mut acc = FrameAccumulator::default();
    loop {
        match transport.recv().await {
            Some(Ok(bytes)) => {
                acc.push(&bytes);
                for frame in acc.drain_frames()? {
                    if let Frame::Connack { return_code } = frame {
                        return Ok(return_code);
                    }
                }
            }
            Some(Err(e)) => return Err(transport_to_mqtt_err(e)),
            None => {
                return Err(MqttError::MalformedFrame(
                    "transport closed before CONNACK".to_string(),
                ))
            }
        }
    }
}

fn transport_to_mqtt_err(e: TransportError) -> MqttError {
    MqttError::MalformedFrame(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc as tmpsc;

    /// An in-memory transport pair for exercising the client without a
    /// real socket. `server_rx`/`server_tx` let the test act as the
    /// broker side.
    struct FakeTransport {
        to_server: tmpsc::Sender<Vec<u8>>,
        from_server: tmpsc::Receiver<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl MqttTransport for FakeTransport {
        async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.to_server
                .send(bytes)
                .await
                .map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
            self.from_server.recv().await.map(Ok)
        }

        async fn close(&mut self) {}

        fn into_split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>) {
            (
                Box::new(FakeWriter { to_server: self.to_server }),
                Box::new(FakeReader { from_server: self.from_server }),
            )
        }
    }

    struct FakeWriter {
        to_server: tmpsc::Sender<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl TransportWriter for FakeWriter {
        async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.to_server
                .send(bytes)
                .await
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) {}
    }

    struct FakeReader {
        from_server: tmpsc::Receiver<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl TransportReader for FakeReader {
        async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
            self.from_server.recv().await.map(Ok)
        }
    }

    fn fake_broker_pair() -> (FakeTransport, tmpsc::Receiver<Vec<u8>>, tmpsc::Sender<Vec<u8>>) {
        let (to_server_tx, to_server_rx) = tmpsc::channel(16);
        let (from_server_tx, from_server_rx) = tmpsc::channel(16);
        (
            FakeTransport {
                to_server: to_server_tx,
                from_server: from_server_rx,
            },
            to_server_rx,
            from_server_tx,
        )
    }

    #[tokio::test]
    async fn connect_resolves_on_connack_zero() {
        let (transport, mut to_server, from_server) = fake_broker_pair();
        let client = MqttClient::new("wss://example.test", None);

        let connect_task = tokio::spawn(async move { client_connect(client, transport).await });

        // Consume CONNECT, answer CONNACK.
        let _connect_bytes = to_server.recv().await.unwrap();
        let ack = codec::encode(&Frame::Connack { return_code: 0 }).unwrap();
        from_server.send(ack.to_vec()).await.unwrap();

        let client = connect_task.await.unwrap();
        assert!(client.is_connected().await);
    }

    async fn client_connect(client: MqttClient, transport: FakeTransport) -> MqttClient {
        client.connect_with(transport).await.unwrap();
        client
    }

    #[tokio::test]
    async fn connect_rejected_returns_error() {
        let (transport, mut to_server, from_server) = fake_broker_pair();
        let client = MqttClient::new("wss://example.test", None);

        let handle = tokio::spawn(async move { client.connect_with(transport).await });
        let _ = to_server.recv().await.unwrap();
        let ack = codec::encode(&Frame::Connack { return_code: 5 }).unwrap();
        from_server.send(ack.to_vec()).await.unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(MqttError::ConnackRejected(5)));
    }

    #[tokio::test]
    async fn publish_dispatches_to_matching_handler_only() {
        let (transport, mut to_server, from_server) = fake_broker_pair();
        let client = Arc::new(MqttClient::new("wss://example.test", None));

        let c2 = client.clone();
        let connect_task = tokio::spawn(async move { c2.connect_with(transport).await });
        let _ = to_server.recv().await.unwrap();
        from_server
            .send(codec::encode(&Frame::Connack { return_code: 0 }).unwrap().to_vec())
            .await
            .unwrap();
        connect_task.await.unwrap().unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub_task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .subscribe(
                        "p2p-conf/room",
                        Arc::new(move |_topic, _payload| {
                            c.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .await
            })
        };
        let _sub_bytes = to_server.recv().await.unwrap();
        from_server
            .send(
                codec::encode(&Frame::Suback {
                    packet_id: 1,
                    return_code: 0,
                })
                .unwrap()
                .to_vec(),
            )
            .await
            .unwrap();
        sub_task.await.unwrap().unwrap();

        // Matching topic: dispatched.
        from_server
            .send(
                codec::encode(&Frame::Publish {
                    topic: "p2p-conf/room".to_string(),
                    payload: "hi".to_string(),
                })
                .unwrap()
                .to_vec(),
            )
            .await
            .unwrap();
        // Non-matching topic: ignored.
        from_server
            .send(
                codec::encode(&Frame::Publish {
                    topic: "p2p-conf/other".to_string(),
                    payload: "hi".to_string(),
                })
                .unwrap()
                .to_vec(),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
