//! Crate-wide error types.

use thiserror::Error;

use crate::mqtt::MqttError;

/// Errors surfaced by the signaling/session engine.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("sdp error: {0}")]
    Sdp(String),
    #[error("ice error: {0}")]
    Ice(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}

/// Errors surfaced by the control channel / routing layer.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("data channel not open: {0}")]
    ChannelNotOpen(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors surfaced by facade-level operations.
#[derive(Error, Debug)]
pub enum FacadeError {
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),
    #[error("join already in progress")]
    JoinInProgress,
    #[error("not currently in a room")]
    NotInRoom,
    #[error("credential load failed: {0}")]
    CredentialLoad(String),
    #[error("control operation failed: {0}")]
    Control(String),
    #[error("signaling operation failed: {0}")]
    Signaling(String),
}

/// The crate-level error type. Individual components return their own
/// narrower error enum internally; this is the type surfaced across the
/// public facade boundary and through `error` events.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Facade(#[from] FacadeError),
    #[error("no brokers reachable and local channel unavailable")]
    NoTransport,
}

pub type Result<T> = std::result::Result<T, Error>;
