//! In-process channels.
//!
//! Messages still pass through the JSON codec, so anything that would not
//! survive a real transport fails here too.

use crate::channel::{
    ChannelHandler, ChannelHostHandler, ChannelHostProxy, ChannelProxy, HandlerSlot,
    HostHandlerSlot, WireError,
};
use crate::message::{decode_message, Message};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_types::config::ConnectionInfo;
use tether_types::{TetherError, TetherResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One end of an in-memory channel pair.
pub struct MemoryChannel {
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    slot: Arc<HandlerSlot>,
    pump: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl MemoryChannel {
    fn new(
        outbox: mpsc::UnboundedSender<Vec<u8>>,
        inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            outbox: Mutex::new(Some(outbox)),
            inbox: Mutex::new(Some(inbox)),
            slot: Arc::new(HandlerSlot::default()),
            pump: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create two connected ends.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(b_tx, a_rx)), Arc::new(Self::new(a_tx, b_rx)))
    }

    /// Start delivering queued and future messages to the handler.
    fn start(&self) {
        let Some(mut inbox) = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let slot = Arc::clone(&self.slot);
        let task = tokio::spawn(async move {
            while let Some(bytes) = inbox.recv().await {
                match decode_message(&bytes) {
                    Ok(message) => slot.emit_data(message),
                    Err(e) => slot.emit_error(&WireError::Json(e)),
                }
            }
            debug!("Memory channel peer closed");
            slot.emit_close();
        });
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }
}

#[async_trait]
impl ChannelProxy for MemoryChannel {
    fn send_data(&self, message: &Message) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let bytes = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match self.outbox.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(outbox) => outbox.send(bytes).is_ok(),
            None => false,
        }
    }

    fn set_handler(&self, handler: Option<Arc<dyn ChannelHandler>>) -> TetherResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            if handler.is_some() {
                return Err(TetherError::Disposed("Channel".to_string()));
            }
            return Ok(());
        }
        let start = handler.is_some();
        self.slot.set(handler);
        if start {
            self.start();
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot.set(None);
        // Dropping the sender closes the peer's inbox, which reports `close`.
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// In-process host: every [`MemoryChannelHost::connect`] yields a new
/// channel pair whose server end is announced as a connection.
pub struct MemoryChannelHost {
    slot: HostHandlerSlot,
    queued: Mutex<Vec<Arc<MemoryChannel>>>,
    disposed: AtomicBool,
}

impl MemoryChannelHost {
    /// Create a host with no connections.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: HostHandlerSlot::default(),
            queued: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Connect a new client and return its end of the channel.
    pub fn connect(&self) -> TetherResult<Arc<MemoryChannel>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TetherError::Disposed("Memory host".to_string()));
        }
        let (client, server) = MemoryChannel::pair();
        if self.slot.get().is_some() {
            self.slot.emit_connection(server);
        } else {
            self.queued
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(server);
        }
        Ok(client)
    }
}

#[async_trait]
impl ChannelHostProxy for MemoryChannelHost {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new("tether-wire", "memory", Vec::new())
    }

    fn set_handler(&self, handler: Option<Arc<dyn ChannelHostHandler>>) -> TetherResult<()> {
        if self.disposed.load(Ordering::SeqCst) && handler.is_some() {
            return Err(TetherError::Disposed("Memory host".to_string()));
        }
        let start = handler.is_some();
        self.slot.set(handler);
        if start {
            self.slot.emit_listening();
            let queued: Vec<_> = self
                .queued
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            for channel in queued {
                self.slot.emit_connection(channel);
            }
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handler) = self.slot.get() {
            handler.on_close();
        }
        self.slot.set(None);
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Collector {
        tx: mpsc::UnboundedSender<Option<Message>>,
    }

    impl ChannelHandler for Collector {
        fn on_data(&self, message: Message) {
            let _ = self.tx.send(Some(message));
        }

        fn on_close(&self) {
            let _ = self.tx.send(None);
        }
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<Option<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collector { tx }), rx)
    }

    #[tokio::test]
    async fn test_messages_sent_before_handler_are_delivered() {
        let (a, b) = MemoryChannel::pair();
        assert!(a.send_data(&Message::request("1", "/x", json!(1))));
        assert!(a.send_data(&Message::request("2", "/x", json!(2))));

        let (handler, mut rx) = collector();
        b.set_handler(Some(handler)).unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(second.body, json!(2));
    }

    #[tokio::test]
    async fn test_dispose_closes_peer() {
        let (a, b) = MemoryChannel::pair();
        let (handler, mut rx) = collector();
        b.set_handler(Some(handler)).unwrap();

        a.dispose().await;
        assert!(!a.send_data(&Message::request("1", "/x", json!(null))));
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_none());
        assert!(!b.send_data(&Message::request("2", "/x", json!(null))));
    }

    #[tokio::test]
    async fn test_set_handler_after_dispose_fails() {
        let (a, _b) = MemoryChannel::pair();
        a.dispose().await;
        a.dispose().await;
        let (handler, _rx) = collector();
        assert!(a.set_handler(Some(handler)).is_err());
        assert!(a.set_handler(None).is_ok());
    }

    #[tokio::test]
    async fn test_host_queues_connections_until_handler() {
        struct Accept {
            tx: mpsc::UnboundedSender<Arc<dyn ChannelProxy>>,
        }
        impl ChannelHostHandler for Accept {
            fn on_connection(&self, channel: Arc<dyn ChannelProxy>) {
                let _ = self.tx.send(channel);
            }
        }

        let host = MemoryChannelHost::new();
        let client = host.connect().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        host.set_handler(Some(Arc::new(Accept { tx }))).unwrap();

        let server = rx.recv().await.unwrap();
        let (handler, mut data) = collector();
        server.set_handler(Some(handler)).unwrap();
        assert!(client.send_data(&Message::request("hello", "/x", json!("hi"))));
        assert_eq!(data.recv().await.unwrap().unwrap().id, "hello");

        host.dispose().await;
        assert!(host.connect().is_err());
    }
}
