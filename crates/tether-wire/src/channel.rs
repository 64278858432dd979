//! Channel abstractions the communicator layer runs on.
//!
//! A [`ChannelProxy`] moves [`Message`]s to exactly one peer; a
//! [`ChannelHostProxy`] accepts connections and hands out one channel per
//! peer. Concrete transports live in [`crate::memory`] and [`crate::stream`].

use crate::message::Message;

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tether_types::config::ConnectionInfo;
use tether_types::{TetherError, TetherResult};
use thiserror::Error;

/// Errors raised by transports.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Unsupported transport: {0}")]
    Unsupported(String),
}

impl From<WireError> for TetherError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(e) => TetherError::Io(e),
            WireError::Json(e) => TetherError::Serialization(e.to_string()),
            WireError::ConnectionClosed => TetherError::ChannelClosed,
            WireError::MessageTooLarge { size, max } => TetherError::Protocol(format!(
                "Message too large: {size} bytes (max {max})"
            )),
            WireError::Unsupported(what) => TetherError::Unsupported(what),
        }
    }
}

/// Receiver of channel events.
pub trait ChannelHandler: Send + Sync + 'static {
    /// A message arrived.
    fn on_data(&self, message: Message);
    /// The peer went away. No further data follows.
    fn on_close(&self) {}
    /// The transport failed.
    fn on_error(&self, _error: &WireError) {}
}

/// A bidirectional message channel to a single peer.
///
/// Implementations start delivering incoming messages once the first handler
/// is installed, so nothing is lost between construction and
/// [`ChannelProxy::set_handler`].
#[async_trait]
pub trait ChannelProxy: Send + Sync + 'static {
    /// Queue a message for the peer. Returns `false` when the channel can no
    /// longer send.
    fn send_data(&self, message: &Message) -> bool;

    /// Install or clear the event handler.
    fn set_handler(&self, handler: Option<Arc<dyn ChannelHandler>>) -> TetherResult<()>;

    /// Close the channel. Idempotent.
    async fn dispose(&self);
}

/// Receiver of host events.
pub trait ChannelHostHandler: Send + Sync + 'static {
    /// A peer connected.
    fn on_connection(&self, channel: Arc<dyn ChannelProxy>);
    /// The host accepts connections.
    fn on_listening(&self) {}
    /// The host stopped accepting connections.
    fn on_close(&self) {}
    /// The listener failed.
    fn on_error(&self, _error: &WireError) {}
}

/// A listener producing one [`ChannelProxy`] per connecting peer.
#[async_trait]
pub trait ChannelHostProxy: Send + Sync + 'static {
    /// How peers reach this host.
    fn connection_info(&self) -> ConnectionInfo;

    /// Install or clear the event handler.
    fn set_handler(&self, handler: Option<Arc<dyn ChannelHostHandler>>) -> TetherResult<()>;

    /// Stop accepting connections. Idempotent.
    async fn dispose(&self);
}

/// Handler storage shared between a channel and its delivery task.
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn ChannelHandler>>>,
}

impl HandlerSlot {
    pub(crate) fn set(&self, handler: Option<Arc<dyn ChannelHandler>>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    fn get(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn emit_data(&self, message: Message) {
        if let Some(handler) = self.get() {
            handler.on_data(message);
        }
    }

    pub(crate) fn emit_close(&self) {
        if let Some(handler) = self.get() {
            handler.on_close();
        }
    }

    pub(crate) fn emit_error(&self, error: &WireError) {
        if let Some(handler) = self.get() {
            handler.on_error(error);
        }
    }
}

/// Host handler storage shared between a host and its accept task.
#[derive(Default)]
pub(crate) struct HostHandlerSlot {
    handler: RwLock<Option<Arc<dyn ChannelHostHandler>>>,
}

impl HostHandlerSlot {
    pub(crate) fn set(&self, handler: Option<Arc<dyn ChannelHostHandler>>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn ChannelHostHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn emit_connection(&self, channel: Arc<dyn ChannelProxy>) {
        if let Some(handler) = self.get() {
            handler.on_connection(channel);
        }
    }

    pub(crate) fn emit_listening(&self) {
        if let Some(handler) = self.get() {
            handler.on_listening();
        }
    }

    pub(crate) fn emit_error(&self, error: &WireError) {
        if let Some(handler) = self.get() {
            handler.on_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_conversion() {
        let err: TetherError = WireError::ConnectionClosed.into();
        assert!(matches!(err, TetherError::ChannelClosed));

        let err: TetherError = WireError::MessageTooLarge { size: 10, max: 5 }.into();
        assert_eq!(err.kind(), "Protocol");

        let err: TetherError = WireError::Unsupported("pipe".into()).into();
        assert!(matches!(err, TetherError::Unsupported(ref w) if w == "pipe"));
    }
}
