//! Chat message construction and the 500-byte content cap.

use serde::{Deserialize, Serialize};

use crate::ids::PeerId;
use crate::timing::CHAT_CONTENT_MAX_BYTES;

/// Wire shape of a `chat` control message, also the payload of the
/// `chatMessage` event once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub id: String,
    #[serde(rename = "senderId")]
    pub sender_id: PeerId,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    pub content: String,
    pub timestamp: i64,
}

impl ChatPayload {
    pub fn new(self_id: PeerId, sender_name: String, content: &str) -> Self {
        Self {
            id: crate::ids::generate_msg_id(),
            sender_id: self_id,
            sender_name,
            content: truncate_to_byte_cap(content, CHAT_CONTENT_MAX_BYTES),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Truncate `s` to at most `max_bytes`, never splitting inside a UTF-8
/// character boundary.
pub fn truncate_to_byte_cap(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
