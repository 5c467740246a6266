//! Abstraction over `RTCPeerConnection`/`RTCDataChannel` so the signaling
//! engine can be driven by fakes in tests. The default implementation
//! wraps the `webrtc` crate directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

use crate::envelope::IceCandidatePayload;
use crate::error::SignalingError;
use crate::stats::RawStatsSample;

/// Mirrors `RTCPeerConnectionState`, collapsed to what the signaling state
/// machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Mirrors `RTCIceConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

pub type DataChannelCallback = Arc<dyn Fn(Arc<dyn DataChannelHandle>) + Send + Sync>;

/// Abstracts `RTCDataChannel` for the chat/control protocols.
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send(&self, data: &[u8]) -> Result<(), SignalingError>;
    fn on_open(&self, cb: Arc<dyn Fn() + Send + Sync>);
    fn on_close(&self, cb: Arc<dyn Fn() + Send + Sync>);
    fn on_message(&self, cb: Arc<dyn Fn(Vec<u8>) + Send + Sync>);
}

/// Abstracts `RTCPeerConnection` for the signaling state machine.
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>, SignalingError>;
    async fn create_offer(&self, ice_restart: bool) -> Result<String, SignalingError>;
    async fn create_answer(&self) -> Result<String, SignalingError>;
    async fn set_local_description(&self, sdp: String, is_offer: bool) -> Result<(), SignalingError>;
    async fn set_remote_description(&self, sdp: String, is_offer: bool) -> Result<(), SignalingError>;
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), SignalingError>;
    fn has_remote_description(&self) -> bool;
    async fn close(&self) -> Result<(), SignalingError>;
    /// Sample connection-quality counters from the selected candidate pair
    /// and the inbound RTP stream.
    async fn stats(&self) -> Result<RawStatsSample, SignalingError>;

    fn on_ice_candidate(&self, cb: Arc<dyn Fn(IceCandidatePayload) + Send + Sync>);
    fn on_connection_state_change(&self, cb: Arc<dyn Fn(PeerConnState) + Send + Sync>);
    fn on_ice_connection_state_change(&self, cb: Arc<dyn Fn(IceConnState) + Send + Sync>);
    fn on_data_channel(&self, cb: DataChannelCallback);
}

/// Configuration for constructing new peer connections (ICE servers).
#[derive(Debug, Clone, Default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Creates peer connections, generalized behind a trait so the engine does
/// not depend on the `webrtc` crate directly.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerConnectionHandle>, SignalingError>;
}

/// Default factory, wrapping `webrtc::api::APIBuilder` with the codec set a
/// real media client would negotiate (Opus/VP8/VP9/H264) even though this
/// crate never touches capture or encode.
pub struct WebRtcPeerConnectionFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcPeerConnectionFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn media_engine() -> Result<MediaEngine, SignalingError> {
        let mut m = MediaEngine::default();
        m.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| SignalingError::PeerConnection(e.to_string()))?;

        for (mime, pt) in [(MIME_TYPE_VP8, 96u8), (MIME_TYPE_VP9, 98), (MIME_TYPE_H264, 102)] {
            m.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: mime.to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: pt,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))?;
        }
        Ok(m)
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create(&self) -> Result<Arc<dyn PeerConnectionHandle>, SignalingError> {
        let media_engine = Self::media_engine()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let ice_servers = if self.ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }]
        } else {
            self.ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect()
        };

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))?;

        Ok(Arc::new(WebRtcPeerConnection {
            pc: Arc::new(pc),
            remote_description_set: AsyncMutex::new(false),
        }))
    }
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    remote_description_set: AsyncMutex<bool>,
}

#[async_trait]
impl PeerConnectionHandle for WebRtcPeerConnection {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannelHandle>, SignalingError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit { ordered: Some(true), ..Default::default() }))
            .await
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))?;
        Ok(Arc::new(WebRtcDataChannel { dc }))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, SignalingError> {
        let options = ice_restart.then(|| webrtc::peer_connection::offer_answer_options::RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| SignalingError::Sdp(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, SignalingError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SignalingError::Sdp(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, sdp: String, is_offer: bool) -> Result<(), SignalingError> {
        let desc = if is_offer {
            RTCSessionDescription::offer(sdp)
        } else {
            RTCSessionDescription::answer(sdp)
        }
        .map_err(|e| SignalingError::Sdp(e.to_string()))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| SignalingError::Sdp(e.to_string()))
    }

    async fn set_remote_description(&self, sdp: String, is_offer: bool) -> Result<(), SignalingError> {
        let desc = if is_offer {
            RTCSessionDescription::offer(sdp)
        } else {
            RTCSessionDescription::answer(sdp)
        }
        .map_err(|e| SignalingError::Sdp(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| SignalingError::Sdp(e.to_string()))?;
        *self.remote_description_set.lock().await = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), SignalingError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| SignalingError::Ice(e.to_string()))
    }

    fn has_remote_description(&self) -> bool {
        self.pc.remote_description().is_some()
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.pc.close().await.map_err(|e| SignalingError::PeerConnection(e.to_string()))
    }

    async fn stats(&self) -> Result<RawStatsSample, SignalingError> {
        let report = self.pc.get_stats().await;
        let mut sample = RawStatsSample::default();
        for entry in report.reports.values() {
            match entry {
                webrtc::stats::StatsReportType::CandidatePair(pair) => {
                    if pair.state == webrtc::ice::candidate::CandidatePairState::Succeeded {
                        sample.round_trip_time_s = pair.current_round_trip_time;
                    }
                }
                webrtc::stats::StatsReportType::InboundRTP(inbound) => {
                    sample.packets_lost = inbound.packets_lost.max(0) as u64;
                    sample.packets_received = inbound.packets_received;
                    sample.jitter_s = inbound.jitter;
                }
                _ => {}
            }
        }
        Ok(sample)
    }

    fn on_ice_candidate(&self, cb: Arc<dyn Fn(IceCandidatePayload) + Send + Sync>) {
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let cb = cb.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if let Ok(init) = candidate.to_json() {
                    cb(IceCandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    });
                }
            })
        }));
    }

    fn on_connection_state_change(&self, cb: Arc<dyn Fn(PeerConnState) + Send + Sync>) {
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let cb = cb.clone();
            let mapped = match state {
                RTCPeerConnectionState::New => PeerConnState::New,
                RTCPeerConnectionState::Connecting => PeerConnState::Connecting,
                RTCPeerConnectionState::Connected => PeerConnState::Connected,
                RTCPeerConnectionState::Disconnected => PeerConnState::Disconnected,
                RTCPeerConnectionState::Failed => PeerConnState::Failed,
                RTCPeerConnectionState::Closed => PeerConnState::Closed,
                RTCPeerConnectionState::Unspecified => PeerConnState::New,
            };
            Box::pin(async move { cb(mapped) })
        }));
    }

    fn on_ice_connection_state_change(&self, cb: Arc<dyn Fn(IceConnState) + Send + Sync>) {
        self.pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let cb = cb.clone();
            let mapped = match state {
                RTCIceConnectionState::New => IceConnState::New,
                RTCIceConnectionState::Checking => IceConnState::Checking,
                RTCIceConnectionState::Connected => IceConnState::Connected,
                RTCIceConnectionState::Completed => IceConnState::Completed,
                RTCIceConnectionState::Disconnected => IceConnState::Disconnected,
                RTCIceConnectionState::Failed => IceConnState::Failed,
                RTCIceConnectionState::Closed => IceConnState::Closed,
                RTCIceConnectionState::Unspecified => IceConnState::New,
            };
            Box::pin(async move { cb(mapped) })
        }));
    }

    fn on_data_channel(&self, cb: DataChannelCallback) {
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let cb = cb.clone();
            Box::pin(async move {
                cb(Arc::new(WebRtcDataChannel { dc }));
            })
        }));
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelHandle for WebRtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: &[u8]) -> Result<(), SignalingError> {
        self.dc
            .send(&bytes::Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| SignalingError::PeerConnection(e.to_string()))
    }

    fn on_open(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        self.dc.on_open(Box::new(move || {
            let cb = cb.clone();
            Box::pin(async move { cb() })
        }));
    }

    fn on_close(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        self.dc.on_close(Box::new(move || {
            let cb = cb.clone();
            Box::pin(async move { cb() })
        }));
    }

    fn on_message(&self, cb: Arc<dyn Fn(Vec<u8>) + Send + Sync>) {
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let cb = cb.clone();
            let data = msg.data.to_vec();
            Box::pin(async move { cb(data) })
        }));
    }
}
