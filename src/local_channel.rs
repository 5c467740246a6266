//! Same-host delivery path: lets peers on the same machine exchange signal
//! envelopes without round-tripping through an MQTT broker. Modeled as a
//! trait so a real deployment can back it with whatever OS-level IPC it
//! has available; the default implementation is an in-process broadcast
//! registry, useful for same-machine multi-instance setups and for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::broadcast;

#[async_trait]
pub trait LocalChannel: Send + Sync {
    async fn post(&self, topic: &str, payload: &str);
    async fn subscribe(&self, topic: &str, handler: Arc<dyn for<'a> Fn(&'a str) + Send + Sync + 'static>);
    async fn close(&self);
}

fn registry() -> &'static StdMutex<HashMap<String, broadcast::Sender<String>>> {
    static REGISTRY: OnceLock<StdMutex<HashMap<String, broadcast::Sender<String>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// In-process same-host channel backed by a process-wide broadcast
/// registry keyed by topic. Every `InProcessLocalChannel` in the same
/// process that posts/subscribes to the same topic observes the traffic.
pub struct InProcessLocalChannel {
    subscribed_topics: StdMutex<Vec<String>>,
}

impl Default for InProcessLocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessLocalChannel {
    pub fn new() -> Self {
        Self {
            subscribed_topics: StdMutex::new(Vec::new()),
        }
    }

    fn sender_for(topic: &str) -> broadcast::Sender<String> {
        let mut reg = registry().lock().unwrap_or_else(|p| p.into_inner());
        reg.entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl LocalChannel for InProcessLocalChannel {
    async fn post(&self, topic: &str, payload: &str) {
        // No receivers is not an error for a broadcast-style local channel.
        let _ = Self::sender_for(topic).send(payload.to_string());
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn for<'a> Fn(&'a str) + Send + Sync + 'static>) {
        self.subscribed_topics.lock().unwrap_or_else(|p| p.into_inner()).push(topic.to_string());
        let mut rx = Self::sender_for(topic).subscribe();
        tokio::spawn(async move {
            while let Ok(payload) = rx.recv().await {
                handler(&payload);
            }
        });
    }

    async fn close(&self) {
        self.subscribed_topics.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn post_is_delivered_to_subscriber_on_same_topic() {
        let topic = format!("test-topic-{}", rand::random::<u64>());
        let a = InProcessLocalChannel::new();
        let b = InProcessLocalChannel::new();

        let received = Arc::new(AtomicUsize::new(0));
        let r2 = received.clone();
        b.subscribe(&topic, Arc::new(move |_payload| {
            r2.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

        // Give the subscription task a moment to register before posting.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        a.post(&topic, "hello").await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_with_no_subscribers_does_not_error() {
        let topic = format!("test-topic-empty-{}", rand::random::<u64>());
        let a = InProcessLocalChannel::new();
        a.post(&topic, "hello").await;
    }
}
