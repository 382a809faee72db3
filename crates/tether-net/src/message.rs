//! Application message envelope and its JSON codec.
//!
//! Messages travel as UTF-8 JSON objects:
//!
//! ```text
//! {"id":"msg-17","type":"chat","action":"post","timestamp":1718000000000,
//!  "payload":{...},"priority":"normal","requires_ack":false}
//! ```
//!
//! Only `type` is meaningful for routing. Missing `id` and `timestamp` are
//! filled in by the dispatcher before handlers run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery priority hint carried with each message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A single application-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Routing key. An empty type fails dispatch validation.
    #[serde(rename = "type", default)]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requires_ack: bool,
}

/// Errors produced while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(msg_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Some(next_message_id()),
            msg_type: msg_type.into(),
            action: None,
            timestamp: Some(now_ms()),
            payload,
            priority: Priority::Normal,
            requires_ack: false,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    /// Serialize to the JSON text form sent on the wire.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode(std::str::from_utf8(bytes)?)
    }
}

/// Allocate a process-unique message id.
pub fn next_message_id() -> String {
    format!("msg-{}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Wall-clock milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let msg = Message::new("chat", json!({"text": "gg"})).with_action("post");
        let text = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["action"], "post");
        assert_eq!(value["priority"], "normal");
        assert_eq!(value["payload"]["text"], "gg");
    }

    #[test]
    fn test_decode_minimal_message() {
        let msg = Message::decode(r#"{"type":"match_found"}"#).unwrap();
        assert_eq!(msg.msg_type, "match_found");
        assert!(msg.id.is_none());
        assert!(msg.timestamp.is_none());
        assert_eq!(msg.payload, serde_json::Value::Null);
        assert_eq!(msg.priority, Priority::Normal);
    }

    #[test]
    fn test_missing_type_decodes_as_empty() {
        let msg = Message::decode(r#"{"payload":{"x":1}}"#).unwrap();
        assert!(msg.msg_type.is_empty());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            Message::decode("{not json"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_binary_frame_must_be_utf8() {
        assert!(matches!(
            Message::decode_bytes(&[0xff, 0xfe, 0x00]),
            Err(CodecError::Utf8(_))
        ));
        let msg = Message::decode_bytes(br#"{"type":"state"}"#).unwrap();
        assert_eq!(msg.msg_type, "state");
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Message::new("a", json!(null));
        let b = Message::new("a", json!(null));
        assert_ne!(a.id, b.id);
    }
}
