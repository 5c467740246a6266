//! p2p-conf-core: serverless peer-to-peer signaling and messaging core for
//! audio/video conferencing.
//!
//! A [`Facade`] is the entry point a host application embeds, one per local
//! peer: `init` preloads credentials, `join`/`leave` drive a room's
//! lifecycle, and [`EventHub`] delivers everything that happens inside it
//! (peer join/leave, chat, remote-mic handoff, moderation, network and
//! signaling state transitions).

pub mod broker;
pub mod config;
pub mod control;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod events;
pub mod facade;
pub mod ids;
pub mod local_channel;
pub mod mqtt;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod timing;
pub mod transport;
pub mod webrtc_peer;

pub use config::{Config, CredentialLoader, HttpCredentialLoader};
pub use error::{Error, Result};
pub use events::{ChatMessage, Event, EventHub, LegacyCallbacks, NetworkStatus, SignalingState};
pub use facade::{Facade, Snapshot};
pub use ids::{PeerId, RoomId};

/// Install a `tracing` subscriber reading `RUST_LOG` (default `info`),
/// falling back to `p2p_conf_core=debug`. Host applications are free to
/// install their own subscriber instead; this is a convenience for
/// standalone binaries and examples.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "p2p_conf_core=debug".into()),
        )
        .init();
}
