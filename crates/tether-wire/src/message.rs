//! Wire message envelope and framing.
//!
//! Every request and response exchanged by communicators is a [`Message`].
//! Byte-stream transports prefix each JSON-encoded message with a 4-byte
//! big-endian length header.

use serde::{Deserialize, Serialize};

/// A request or response travelling over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id. A response reuses the id of its request.
    pub id: String,
    /// Route of a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Outcome of a response; absent on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<bool>,
    /// Id of the sending communicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Send time in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Payload: request arguments, a result, or a serialized error.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Message {
    /// Build a request for `path`.
    pub fn request(id: impl Into<String>, path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            path: Some(path.into()),
            succeeded: None,
            sender: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            body,
        }
    }

    /// Build a response to the request with `id`.
    pub fn response(id: impl Into<String>, succeeded: bool, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            path: None,
            succeeded: Some(succeeded),
            sender: None,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            body,
        }
    }

    /// Set the sending communicator id.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Whether this message is a request (carries no outcome).
    pub fn is_request(&self) -> bool {
        self.succeeded.is_none()
    }

    /// Milliseconds elapsed since the message was stamped, if it was.
    pub fn age_ms(&self) -> Option<i64> {
        self.timestamp
            .map(|ts| chrono::Utc::now().timestamp_millis().saturating_sub(ts))
    }
}

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a Message.
pub fn decode_message(body: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::request("msg-1", "/echo", json!({"n": 1})).with_sender("comm-a");
        let bytes = encode_message(&msg).unwrap();
        // First 4 bytes are length
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.is_request());
    }

    #[test]
    fn test_response_omits_path() {
        let msg = Message::response("r-1", false, json!({"name": "Error", "message": "x"}));
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("path").is_none());
        assert_eq!(value["succeeded"], false);
        assert!(!msg.is_request());
    }

    #[test]
    fn test_decode_minimal_message() {
        // Peers may omit everything but the id.
        let decoded = decode_message(br#"{"id":"x","path":"/p"}"#).unwrap();
        assert_eq!(decoded.path.as_deref(), Some("/p"));
        assert_eq!(decoded.body, serde_json::Value::Null);
        assert!(decoded.timestamp.is_none());
        assert!(decoded.age_ms().is_none());
    }
}
