//! MQTT byte transport: binary frames over a WebSocket stream.
//!
//! The client depends on this trait rather than `tokio_tungstenite`
//! directly so tests can run the codec/client logic over an in-memory
//! duplex instead of a real socket.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("stream closed")]
    Closed,
}

/// A byte-oriented duplex transport carrying binary MQTT frames, used only
/// for the initial CONNECT/CONNACK handshake before the connection is split
/// into independent halves (see [`MqttTransport::into_split`]) — a combined
/// read+write handle must never be held across a blocking `recv`, since the
/// client needs to write (PUBLISH, PINGREQ) while a read is parked waiting
/// for the next inbound frame.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;
    /// Returns `None` when the stream has closed.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
    async fn close(&mut self);
    /// Split into a write half and a read half that can be driven
    /// concurrently without contending on a shared lock.
    fn into_split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>);
}

/// The write half of a split [`MqttTransport`].
#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// The read half of a split [`MqttTransport`], owned exclusively by the
/// client's reader loop.
#[async_trait]
pub trait TransportReader: Send {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// Default transport: MQTT binary frames over a WebSocket, as required by
/// brokers reachable from a browser-hosted or sandboxed desktop client.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl MqttTransport for WebSocketTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.stream
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Send(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>) {
        let (sink, stream) = self.stream.split();
        (Box::new(WebSocketWriter(sink)), Box::new(WebSocketReader(stream)))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

struct WebSocketWriter(WsSink);
struct WebSocketReader(WsStream);

#[async_trait]
impl TransportWriter for WebSocketWriter {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl TransportReader for WebSocketReader {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Send(e.to_string()))),
            }
        }
    }
}

/// Byte accumulator that reassembles complete MQTT frames out of an
/// arbitrarily-chunked inbound byte stream, preserving partial frames
/// verbatim across chunks.
#[derive(Default)]
pub struct FrameAccumulator {
    buf: bytes::BytesMut,
}

impl FrameAccumulator {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Drain every complete frame currently bufferable, leaving a trailing
    /// partial frame (if any) in place for the next `push`.
    pub fn drain_frames(&mut self) -> Result<Vec<super::codec::Frame>, super::codec::MqttError> {
        use super::codec::Decoded;
        let mut frames = Vec::new();
        loop {
            match super::codec::decode(&self.buf)? {
                Decoded::Frame(frame, consumed) => {
                    let _ = self.buf.split_to(consumed);
                    frames.push(frame);
                }
                Decoded::Incomplete => break,
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::codec::{encode, Frame};

    #[test]
    fn accumulator_preserves_partial_frame_across_pushes() {
        let frame = Frame::Publish {
            topic: "p2p-conf/a".to_string(),
            payload: "hello world".to_string(),
        };
        let bytes = encode(&frame).unwrap();
        let (a, b) = bytes.split_at(bytes.len() / 2);

        let mut acc = FrameAccumulator::default();
        acc.push(a);
        assert!(acc.drain_frames().unwrap().is_empty());

        acc.push(b);
        let frames = acc.drain_frames().unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn accumulator_handles_multiple_frames_in_one_chunk() {
        let f1 = Frame::PingResp;
        let f2 = Frame::Disconnect;
        let mut bytes = encode(&f1).unwrap();
        bytes.extend_from_slice(&encode(&f2).unwrap());

        let mut acc = FrameAccumulator::default();
        acc.push(&bytes);
        assert_eq!(acc.drain_frames().unwrap(), vec![f1, f2]);
    }
}
