//! Multi-broker fan-out: owns N MQTT clients, publishes to all, dedups
//! inbound by `msgId`, and reconnects each broker independently with
//! exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::mqtt::{client::PublishHandler, MqttClient};
use crate::timing::{
    BROKER_BACKOFF_BASE, BROKER_BACKOFF_FACTOR, BROKER_BACKOFF_JITTER, BROKER_BACKOFF_MAX,
    BROKER_BACKOFF_MAX_ATTEMPTS,
};

/// Snapshot of one broker's connection health, for the facade's debug info.
#[derive(Debug, Clone)]
pub struct BrokerStatus {
    pub url: String,
    pub connected: bool,
    pub reconnect_attempts: u32,
}

struct BrokerEntry {
    client: Arc<MqttClient>,
    reconnect_attempts: Arc<Mutex<u32>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// A registered subscription, remembered so it can be re-issued on any
/// broker that (re)connects.
#[derive(Clone)]
struct RememberedSubscription {
    topic: String,
    handler: PublishHandler,
}

pub struct BrokerFabric {
    brokers: RwLock<HashMap<String, BrokerEntry>>,
    subscriptions: RwLock<Vec<RememberedSubscription>>,
    dedup: Arc<Mutex<crate::dedup::Deduplicator>>,
}

impl Default for BrokerFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerFabric {
    pub fn new() -> Self {
        Self {
            brokers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            dedup: Arc::new(Mutex::new(crate::dedup::Deduplicator::default())),
        }
    }

    /// Connect to every broker URL concurrently; returns the subset that
    /// succeeded (possibly empty).
    pub async fn connect_all(self: &Arc<Self>, urls: &[String]) -> Vec<String> {
        let mut handles = Vec::new();
        for url in urls {
            let url = url.clone();
            let fabric = self.clone();
            handles.push(tokio::spawn(async move {
                let client = Arc::new(MqttClient::new(&url, None));
                match client.connect().await {
                    Ok(()) => {
                        fabric.register_broker(url.clone(), client).await;
                        Some(url)
                    }
                    Err(e) => {
                        warn!("failed to connect broker {url}: {e}");
                        None
                    }
                }
            }));
        }

        let mut connected = Vec::new();
        for h in handles {
            if let Ok(Some(url)) = h.await {
                connected.push(url);
            }
        }
        connected
    }

    fn register_broker<'a>(
        self: &'a Arc<Self>,
        url: String,
        client: Arc<MqttClient>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let reconnect_attempts = Arc::new(Mutex::new(0u32));

            let fabric = self.clone();
            let url_for_cb = url.clone();
            let client_for_cb = client.clone();
            let attempts_for_cb = reconnect_attempts.clone();
            client
                .set_on_disconnect(move || {
                    let fabric = fabric.clone();
                    let url = url_for_cb.clone();
                    let client = client_for_cb.clone();
                    let attempts = attempts_for_cb.clone();
                    tokio::spawn(async move {
                        fabric.on_broker_disconnected(url, client, attempts).await;
                    });
                })
                .await;

            // Re-issue every remembered subscription on this (newly connected)
            // broker.
            let subs = self.subscriptions.read().await.clone();
            for sub in &subs {
                let _ = client.subscribe(&sub.topic, sub.handler.clone()).await;
            }

            self.brokers.write().await.insert(
                url,
                BrokerEntry {
                    client,
                    reconnect_attempts,
                    reconnect_task: Mutex::new(None),
                },
            );
        })
    }

    fn on_broker_disconnected(
        self: Arc<Self>,
        url: String,
        client: Arc<MqttClient>,
        attempts: Arc<Mutex<u32>>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut count = attempts.lock().await;
            *count += 1;
            let attempt = *count;
            drop(count);

            if attempt > BROKER_BACKOFF_MAX_ATTEMPTS {
                warn!("broker {url} exhausted reconnect attempts, leaving it dead");
                return;
            }

            let delay = backoff_delay(attempt);
            info!("broker {url} disconnected, reconnecting in {delay:?} (attempt {attempt})");

            let fabric = self.clone();
            let task_url = url.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match client.connect().await {
                    Ok(()) => {
                        *attempts.lock().await = 0;
                        fabric.register_broker(task_url.clone(), client).await;
                        info!("broker {task_url} reconnected");
                    }
                    Err(e) => {
                        warn!("broker {task_url} reconnect attempt {attempt} failed: {e}");
                        fabric.on_broker_disconnected(task_url, client, attempts).await;
                    }
                }
            });

            if let Some(entry) = self.brokers.read().await.get(&url) {
                if let Some(old) = entry.reconnect_task.lock().await.replace(handle) {
                    old.abort();
                }
            }
        })
    }

    /// Subscribe every currently-connected client to `topic`; inbound
    /// deliveries are deduplicated by `msgId` before `handler` runs. Every
    /// delivery (from any broker) funnels through one worker task that
    /// dedups and calls `handler` in arrival order — spawning a detached
    /// task per delivery would let two PUBLISHes for the same topic (e.g.
    /// consecutive ICE candidates) reach `handler` out of order.
    pub async fn subscribe_all(self: &Arc<Self>, topic: &str, handler: PublishHandler) {
        let dedup = self.dedup.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
        tokio::spawn(async move {
            while let Some((topic, payload)) = rx.recv().await {
                let Some(msg_id) = extract_msg_id(&payload) else {
                    handler(&topic, &payload);
                    continue;
                };
                if dedup.lock().await.check_and_insert(&msg_id) {
                    handler(&topic, &payload);
                }
            }
        });

        let wrapped: PublishHandler = Arc::new(move |t, payload| {
            let _ = tx.send((t.to_string(), payload.to_string()));
        });

        self.subscriptions.write().await.push(RememberedSubscription {
            topic: topic.to_string(),
            handler: wrapped.clone(),
        });

        let brokers = self.brokers.read().await;
        for entry in brokers.values() {
            let _ = entry.client.subscribe(topic, wrapped.clone()).await;
        }
    }

    /// Publish to every connected client; per-broker failures are ignored.
    pub async fn publish(&self, topic: &str, payload: &str) {
        let brokers = self.brokers.read().await;
        for entry in brokers.values() {
            let _ = entry.client.publish(topic, payload).await;
        }
    }

    pub async fn any_connected(&self) -> bool {
        let brokers = self.brokers.read().await;
        for entry in brokers.values() {
            if entry.client.is_connected().await {
                return true;
            }
        }
        false
    }

    pub async fn status(&self) -> Vec<BrokerStatus> {
        let brokers = self.brokers.read().await;
        let mut out = Vec::new();
        for (url, entry) in brokers.iter() {
            out.push(BrokerStatus {
                url: url.clone(),
                connected: entry.client.is_connected().await,
                reconnect_attempts: *entry.reconnect_attempts.lock().await,
            });
        }
        out
    }

    /// Cancel all reconnect timers, close all clients, clear subscriptions
    /// and the deduplicator.
    pub async fn disconnect(&self) {
        let mut brokers = self.brokers.write().await;
        for entry in brokers.values() {
            if let Some(t) = entry.reconnect_task.lock().await.take() {
                t.abort();
            }
            entry.client.disconnect().await;
        }
        brokers.clear();
        self.subscriptions.write().await.clear();
        self.dedup.lock().await.clear();
    }
}

fn extract_msg_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("msgId")?.as_str().map(str::to_string)
}

pub(crate) fn backoff_delay(attempt: u32) -> std::time::Duration {
    let base = BROKER_BACKOFF_BASE.as_secs_f64() * BROKER_BACKOFF_FACTOR.powi(attempt as i32 - 1);
    let capped = base.min(BROKER_BACKOFF_MAX.as_secs_f64());
    let jitter_span = capped * BROKER_BACKOFF_JITTER;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    std::time::Duration::from_secs_f64((capped + jitter).max(0.0))
}
