//! Self-contained MQTT 3.1.1 client: binary wire codec, a single-broker
//! client, and the byte transport abstraction that carries it over
//! WebSocket.

pub mod client;
pub mod codec;
pub mod transport;

pub use client::MqttClient;
pub use codec::MqttError;
pub use transport::{MqttTransport, TransportError};
