//! Audio-routing policy: which peers receive this node's outbound audio.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ControlError;
use crate::ids::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    #[default]
    Broadcast,
    Exclusive,
}

/// Per-peer hook a real client implements over `RTCRtpSender::replace_track`
/// (falling back to `add_track` where no sender yet exists). Kept generic
/// here since local audio capture is outside this crate's scope.
#[async_trait]
pub trait AudioRoutingTarget: Send + Sync {
    async fn set_audio_enabled(&self, enabled: bool) -> Result<(), ControlError>;
}

/// Tracks the current routing mode/target and applies it across the live
/// peer set whenever either changes.
#[derive(Default)]
pub struct AudioRouting {
    mode: RoutingMode,
    target: Option<PeerId>,
}

impl AudioRouting {
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn target(&self) -> Option<&PeerId> {
        self.target.as_ref()
    }

    /// Switch mode (and optionally target), then re-apply across `peers`.
    pub async fn set_mode(
        &mut self,
        mode: RoutingMode,
        target: Option<PeerId>,
        peers: &HashMap<PeerId, Arc<dyn AudioRoutingTarget>>,
    ) -> Result<(), ControlError> {
        self.mode = mode;
        self.target = if mode == RoutingMode::Exclusive { target } else { None };
        self.apply(peers).await
    }

    pub async fn apply(&self, peers: &HashMap<PeerId, Arc<dyn AudioRoutingTarget>>) -> Result<(), ControlError> {
        for (peer_id, sender) in peers {
            let enabled = match self.mode {
                RoutingMode::Broadcast => true,
                RoutingMode::Exclusive => self.target.as_ref() == Some(peer_id),
            };
            debug!("routing: {peer_id} audio enabled = {enabled}");
            sender.set_audio_enabled(enabled).await?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.mode = RoutingMode::Broadcast;
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTarget(Arc<AtomicBool>);

    #[async_trait]
    impl AudioRoutingTarget for FakeTarget {
        async fn set_audio_enabled(&self, enabled: bool) -> Result<(), ControlError> {
            self.0.store(enabled, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn exclusive_mode_enables_only_target() {
        let a_flag = Arc::new(AtomicBool::new(false));
        let b_flag = Arc::new(AtomicBool::new(false));
        let a = PeerId::from("AAAA0000AAAA0000".to_string());
        let b = PeerId::from("BBBB0000BBBB0000".to_string());
        let mut peers: HashMap<PeerId, Arc<dyn AudioRoutingTarget>> = HashMap::new();
        peers.insert(a.clone(), Arc::new(FakeTarget(a_flag.clone())));
        peers.insert(b.clone(), Arc::new(FakeTarget(b_flag.clone())));

        let mut routing = AudioRouting::default();
        routing.set_mode(RoutingMode::Exclusive, Some(b.clone()), &peers).await.unwrap();

        assert!(!a_flag.load(Ordering::SeqCst));
        assert!(b_flag.load(Ordering::SeqCst));
        assert_eq!(routing.target(), Some(&b));
    }

    #[tokio::test]
    async fn broadcast_mode_enables_everyone() {
        let a_flag = Arc::new(AtomicBool::new(false));
        let a = PeerId::from("AAAA0000AAAA0000".to_string());
        let mut peers: HashMap<PeerId, Arc<dyn AudioRoutingTarget>> = HashMap::new();
        peers.insert(a.clone(), Arc::new(FakeTarget(a_flag.clone())));

        let mut routing = AudioRouting::default();
        routing.set_mode(RoutingMode::Broadcast, None, &peers).await.unwrap();
        assert!(a_flag.load(Ordering::SeqCst));
    }
}
