//! Device-level network reachability, abstracted behind a trait since
//! actual online/offline notification is a platform concern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_online(&self) -> bool;
    async fn on_change(&self, cb: Arc<dyn Fn(bool) + Send + Sync>);
}

/// Test/manual double: starts online, and only changes state when told to.
#[derive(Default)]
pub struct ManualNetworkMonitor {
    online: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn Fn(bool) + Send + Sync>>>,
}

impl ManualNetworkMonitor {
    pub fn new() -> Self {
        Self { online: AtomicBool::new(true), listeners: RwLock::new(Vec::new()) }
    }

    pub async fn simulate_offline(&self) {
        self.set(false).await;
    }

    pub async fn simulate_online(&self) {
        self.set(true).await;
    }

    async fn set(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            for listener in self.listeners.read().await.iter() {
                listener(online);
            }
        }
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn on_change(&self, cb: Arc<dyn Fn(bool) + Send + Sync>) {
        self.listeners.write().await.push(cb);
    }
}
