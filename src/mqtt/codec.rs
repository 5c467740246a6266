//! MQTT 3.1.1 binary wire codec.
//!
//! Implements CONNECT, CONNACK, PUBLISH (QoS 0), SUBSCRIBE/SUBACK,
//! PINGREQ/PINGRESP and DISCONNECT. Remaining-length uses the standard
//! 1-4 byte variable-length encoding (continuation bit 0x80, max
//! 268,435,455).

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MqttError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unsupported frame type: {0}")]
    UnsupportedFrameType(u8),
    #[error("connack rejected, return code {0}")]
    ConnackRejected(u8),
    #[error("suback rejected")]
    SubackRejected,
    #[error("keep-alive timeout")]
    KeepAliveTimeout,
}

/// Packet type nibble values (top 4 bits of the fixed header byte).
mod packet_type {
    pub const CONNECT: u8 = 1;
    pub const CONNACK: u8 = 2;
    pub const PUBLISH: u8 = 3;
    pub const SUBSCRIBE: u8 = 8;
    pub const SUBACK: u8 = 9;
    pub const PINGREQ: u8 = 12;
    pub const PINGRESP: u8 = 13;
    pub const DISCONNECT: u8 = 14;
}

/// A single decoded MQTT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect {
        client_id: String,
        keep_alive: u16,
        username: Option<String>,
        password: Option<String>,
        clean_session: bool,
    },
    Connack {
        return_code: u8,
    },
    Publish {
        topic: String,
        payload: String,
    },
    Subscribe {
        packet_id: u16,
        topic: String,
    },
    Suback {
        packet_id: u16,
        return_code: u8,
    },
    PingReq,
    PingResp,
    Disconnect,
}

/// Outcome of trying to decode one frame from an accumulator buffer.
pub enum Decoded {
    /// A complete frame was extracted; `usize` is the number of bytes
    /// consumed from the front of the buffer.
    Frame(Frame, usize),
    /// Not enough bytes buffered yet for a complete frame.
    Incomplete,
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn encode_remaining_length(mut len: usize, out: &mut BytesMut) -> Result<(), MqttError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::MalformedFrame(
            "remaining length exceeds maximum".to_string(),
        ));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
    Ok(())
}

/// Attempt to decode a remaining-length VLQ starting at `buf[offset]`.
/// Returns `(value, bytes_used)` or `None` if more bytes are needed, or
/// `Err` if the encoding is malformed (5th continuation byte).
fn decode_remaining_length(buf: &[u8], offset: usize) -> Result<Option<(usize, usize)>, MqttError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    let mut pos = offset;

    for i in 0..4 {
        if pos >= buf.len() {
            return Ok(None);
        }
        let byte = buf[pos];
        value += (byte & 0x7F) as usize * multiplier;
        pos += 1;
        if byte & 0x80 == 0 {
            return Ok(Some((value, pos - offset)));
        }
        multiplier *= 128;
        if i == 3 {
            return Err(MqttError::MalformedFrame(
                "remaining length VLQ exceeds 4 bytes".to_string(),
            ));
        }
    }
    unreachable!()
}

pub fn encode(frame: &Frame) -> Result<BytesMut, MqttError> {
    let mut variable_and_payload = BytesMut::new();
    let header_byte: u8;

    match frame {
        Frame::Connect {
            client_id,
            keep_alive,
            username,
            password,
            clean_session,
        } => {
            header_byte = packet_type::CONNECT << 4;
            put_str(&mut variable_and_payload, "MQTT");
            variable_and_payload.put_u8(4); // protocol level 3.1.1
            let mut flags: u8 = 0;
            if *clean_session {
                flags |= 0x02;
            }
            if username.is_some() {
                flags |= 0x80;
            }
            if password.is_some() {
                flags |= 0x40;
            }
            variable_and_payload.put_u8(flags);
            variable_and_payload.put_u16(*keep_alive);
            put_str(&mut variable_and_payload, client_id);
            if let Some(u) = username {
                put_str(&mut variable_and_payload, u);
            }
            if let Some(p) = password {
                put_str(&mut variable_and_payload, p);
            }
        }
        Frame::Publish { topic, payload } => {
            header_byte = packet_type::PUBLISH << 4; // QoS 0, no DUP/RETAIN
            put_str(&mut variable_and_payload, topic);
            variable_and_payload.put_slice(payload.as_bytes());
        }
        Frame::Subscribe { packet_id, topic } => {
            header_byte = (packet_type::SUBSCRIBE << 4) | 0x02; // reserved bits = 0b0010
            variable_and_payload.put_u16(*packet_id);
            put_str(&mut variable_and_payload, topic);
            variable_and_payload.put_u8(0); // requested QoS 0
        }
        Frame::PingReq => {
            header_byte = packet_type::PINGREQ << 4;
        }
        Frame::Disconnect => {
            header_byte = packet_type::DISCONNECT << 4;
        }
        Frame::Connack { .. } | Frame::Suback { .. } | Frame::PingResp => {
            return Err(MqttError::MalformedFrame(
                "encoding a server-to-client-only frame".to_string(),
            ));
        }
    }

    let mut out = BytesMut::new();
    out.put_u8(header_byte);
    encode_remaining_length(variable_and_payload.len(), &mut out)?;
    out.extend_from_slice(&variable_and_payload);
    Ok(out)
}

/// Decode exactly one frame from the front of `buf`, if a complete one is
/// present. Never consumes a partial frame.
pub fn decode(buf: &[u8]) -> Result<Decoded, MqttError> {
    if buf.is_empty() {
        return Ok(Decoded::Incomplete);
    }
    let header_byte = buf[0];
    let packet_type = header_byte >> 4;

    let Some((remaining_len, rl_bytes)) = decode_remaining_length(buf, 1)? else {
        return Ok(Decoded::Incomplete);
    };

    let frame_len = 1 + rl_bytes + remaining_len;
    if buf.len() < frame_len {
        return Ok(Decoded::Incomplete);
    }

    let mut body = &buf[1 + rl_bytes..frame_len];

    let frame = match packet_type {
        packet_type::CONNACK => {
            if body.len() < 2 {
                return Err(MqttError::MalformedFrame("short CONNACK".to_string()));
            }
            let _session_present = body.get_u8();
            let return_code = body.get_u8();
            Frame::Connack { return_code }
        }
        packet_type::PUBLISH => {
            if body.remaining() < 2 {
                return Err(MqttError::MalformedFrame("short PUBLISH".to_string()));
            }
            let topic_len = body.get_u16() as usize;
            if body.remaining() < topic_len {
                return Err(MqttError::MalformedFrame("truncated PUBLISH topic".to_string()));
            }
            let topic = std::str::from_utf8(&body[..topic_len])
                .map_err(|e| MqttError::MalformedFrame(e.to_string()))?
                .to_string();
            body.advance(topic_len);
            // QoS 0 only: no packet id, payload is the remainder.
            let payload = std::str::from_utf8(body)
                .map_err(|e| MqttError::MalformedFrame(e.to_string()))?
                .to_string();
            Frame::Publish { topic, payload }
        }
        packet_type::SUBACK => {
            if body.remaining() < 3 {
                return Err(MqttError::MalformedFrame("short SUBACK".to_string()));
            }
            let packet_id = body.get_u16();
            let return_code = body.get_u8();
            Frame::Suback {
                packet_id,
                return_code,
            }
        }
        packet_type::PINGRESP => Frame::PingResp,
        packet_type::DISCONNECT => Frame::Disconnect,
        packet_type::CONNECT | packet_type::SUBSCRIBE | packet_type::PINGREQ => {
            return Err(MqttError::UnsupportedFrameType(packet_type));
        }
        other => return Err(MqttError::UnsupportedFrameType(other)),
    };

    Ok(Decoded::Frame(frame, frame_len))
}

/// A CONNACK whose return code is non-zero is a rejection.
pub fn check_connack(return_code: u8) -> Result<(), MqttError> {
    if return_code == 0 {
        Ok(())
    } else {
        Err(MqttError::ConnackRejected(return_code))
    }
}

/// A SUBACK whose return code is `>= 0x80` is a failure.
pub fn check_suback(return_code: u8) -> Result<(), MqttError> {
    if return_code < 0x80 {
        Ok(())
    } else {
        Err(MqttError::SubackRejected)
    }
}
