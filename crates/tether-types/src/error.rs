//! Shared error types for the Tether runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error as it travels inside a failed response body.
///
/// Mirrors the `{ name, message, stack }` shape peers emit, so errors raised
/// by a foreign runtime still deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error class name (`TargetNotFound`, `Error`, ...).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, when the peer provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Optional machine-readable code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RemoteError {
    /// Build a remote error from a name and a message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    /// Interpret the body of a failed response.
    ///
    /// Bodies that are not an error object (a bare string, a number) are kept
    /// as the message of a generic `Error`.
    pub fn from_body(body: &serde_json::Value) -> Self {
        if let Ok(err) = serde_json::from_value::<RemoteError>(body.clone()) {
            return err;
        }
        match body {
            serde_json::Value::String(s) => Self::new("Error", s.clone()),
            serde_json::Value::Null => Self::new("Error", "Unknown remote error"),
            other => Self::new("Error", other.to_string()),
        }
    }

    /// Serialize into a response body.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Top-level error type for the Tether runtime.
#[derive(Error, Debug)]
pub enum TetherError {
    /// A caller passed an argument that cannot be used.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The object was already disposed.
    #[error("{0} already disposed.")]
    Disposed(String),

    /// The channel refused the write or closed underneath a pending call.
    #[error("Failed to send request. The remote channel may be closed.")]
    ChannelClosed,

    /// No response arrived before the communicator's timeout.
    #[error("Communicator ({communicator}): request {message_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Communicator that issued the request.
        communicator: String,
        /// Id of the unanswered message.
        message_id: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// No route on the receiving side matched the request path.
    #[error("No route matches path: {0}")]
    NoRoute(String),

    /// The peer answered with a failure.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// A reference id is unknown to the side that was asked to use it.
    #[error("Target ({0}) doesn't exist.")]
    TargetNotFound(String),

    /// Apply was requested on something that is not a function.
    #[error("Target ({0}) is not a function which cannot be applied.")]
    NotCallable(String),

    /// Property access was requested on something that is not an object.
    #[error("Target ({0}) is not an object.")]
    NotAnObject(String),

    /// Assignment to a property that cannot be written.
    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),

    /// A value of this type cannot be carried across the wire.
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// The peer violated the message protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation is not available on this platform or transport.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// An IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// Stable name of the variant, used as [`RemoteError::name`].
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Disposed(_) => "Disposed",
            Self::ChannelClosed => "ChannelClosed",
            Self::Timeout { .. } => "Timeout",
            Self::NoRoute(_) => "NoRoute",
            Self::Remote(_) => "Remote",
            Self::TargetNotFound(_) => "TargetNotFound",
            Self::NotCallable(_) => "NotCallable",
            Self::NotAnObject(_) => "NotAnObject",
            Self::ReadOnlyProperty(_) => "ReadOnlyProperty",
            Self::UnsupportedDataType(_) => "UnsupportedDataType",
            Self::Protocol(_) => "Protocol",
            Self::Serialization(_) => "Serialization",
            Self::Unsupported(_) => "Unsupported",
            Self::Io(_) => "Io",
            Self::Internal(_) => "Internal",
        }
    }

    /// Convert into the form carried by a failed response.
    ///
    /// Errors that already came from a peer pass through unchanged, so a
    /// forwarded failure keeps its original name.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Remote(err) => err.clone(),
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }

    /// Whether this is a failure reported by the peer under `name`.
    pub fn is_remote(&self, name: &str) -> bool {
        matches!(self, Self::Remote(err) if err.name == name)
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Alias for a Result with [`TetherError`].
pub type TetherResult<T> = Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_roundtrip() {
        let err = TetherError::TargetNotFound("abc".to_string());
        let body = err.to_remote().to_body();
        assert_eq!(body["name"], "TargetNotFound");
        assert_eq!(body["message"], "Target (abc) doesn't exist.");
        assert!(body.get("stack").is_none());

        let back = RemoteError::from_body(&body);
        assert_eq!(back.name, "TargetNotFound");
        assert!(TetherError::Remote(back).is_remote("TargetNotFound"));
    }

    #[test]
    fn test_remote_error_from_foreign_body() {
        let body = serde_json::json!({ "message": "boom", "name": "TypeError", "stack": "at x" });
        let err = RemoteError::from_body(&body);
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.stack.as_deref(), Some("at x"));

        let err = RemoteError::from_body(&serde_json::json!("plain failure"));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "plain failure");
    }

    #[test]
    fn test_forwarded_error_keeps_name() {
        let inner = RemoteError::new("NotCallable", "nope");
        let err = TetherError::Remote(inner.clone());
        assert_eq!(err.to_remote(), inner);
    }

    #[test]
    fn test_disposed_message() {
        let err = TetherError::Disposed("Proxy (p1)".to_string());
        assert_eq!(err.to_string(), "Proxy (p1) already disposed.");
    }
}
