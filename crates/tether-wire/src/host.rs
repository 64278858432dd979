//! Server side of the communicator layer.
//!
//! A [`CommunicationHost`] turns every connection accepted by a
//! [`ChannelHostProxy`] into a [`Communicator`], keeps a host-wide route table
//! that applies to current and future connections, and reports lifecycle
//! events to [`HostListener`]s.

use crate::channel::{ChannelHostHandler, ChannelHostProxy, ChannelProxy, WireError};
use crate::communicator::{Communicator, RequestHandler};
use crate::pattern::RoutePattern;

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tether_types::config::{CommunicatorOptions, ConnectionInfo};
use tether_types::{TetherError, TetherResult};
use tracing::{debug, info, warn};

/// Observer of host events. Callbacks run synchronously on the task that
/// produced the event, before the new communicator receives any message.
pub trait HostListener: Send + Sync + 'static {
    fn on_connection(&self, _host: &CommunicationHost, _communicator: &Communicator) {}
    fn on_listening(&self, _host: &CommunicationHost) {}
    fn on_close(&self, _host: &CommunicationHost) {}
    fn on_error(&self, _host: &CommunicationHost, _error: &WireError) {}
}

type SharedRoute = (Arc<dyn RoutePattern>, Arc<dyn RequestHandler>);

struct HostState {
    proxy: RwLock<Option<Arc<dyn ChannelHostProxy>>>,
    info: ConnectionInfo,
    options: CommunicatorOptions,
    routes: RwLock<Vec<SharedRoute>>,
    communicators: DashMap<String, Communicator>,
    listeners: RwLock<Vec<Arc<dyn HostListener>>>,
    disposed: AtomicBool,
}

/// Accepts peers and manages one communicator per connection.
#[derive(Clone)]
pub struct CommunicationHost {
    state: Arc<HostState>,
}

struct HostDispatcher {
    state: Weak<HostState>,
}

impl HostDispatcher {
    fn host(&self) -> Option<CommunicationHost> {
        self.state.upgrade().map(|state| CommunicationHost { state })
    }
}

impl ChannelHostHandler for HostDispatcher {
    fn on_connection(&self, channel: Arc<dyn ChannelProxy>) {
        if let Some(host) = self.host() {
            host.on_connection(channel);
        }
    }

    fn on_listening(&self) {
        if let Some(host) = self.host() {
            for listener in host.listeners() {
                listener.on_listening(&host);
            }
        }
    }

    fn on_close(&self) {
        if let Some(host) = self.host() {
            tokio::spawn(async move { host.dispose().await });
        }
    }

    fn on_error(&self, error: &WireError) {
        if let Some(host) = self.host() {
            warn!(error = %error, "Channel host error");
            for listener in host.listeners() {
                listener.on_error(&host, error);
            }
        }
    }
}

impl CommunicationHost {
    /// Wrap a channel host. Communicators created for incoming connections
    /// share `options.timeout`; each gets its own id.
    pub fn new(proxy: Arc<dyn ChannelHostProxy>, options: CommunicatorOptions) -> TetherResult<Self> {
        let state = Arc::new(HostState {
            proxy: RwLock::new(Some(Arc::clone(&proxy))),
            info: proxy.connection_info(),
            options,
            routes: RwLock::new(Vec::new()),
            communicators: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        proxy.set_handler(Some(Arc::new(HostDispatcher {
            state: Arc::downgrade(&state),
        })))?;
        Ok(Self { state })
    }

    /// How peers reach this host.
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.state.info
    }

    /// Whether [`CommunicationHost::dispose`] was called.
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    fn validate_disposal(&self) -> TetherResult<()> {
        if self.is_disposed() {
            return Err(TetherError::Disposed("Communication host".to_string()));
        }
        Ok(())
    }

    fn listeners(&self) -> Vec<Arc<dyn HostListener>> {
        self.state
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register a listener. Connections that already exist are replayed to it.
    pub fn subscribe(&self, listener: Arc<dyn HostListener>) -> TetherResult<()> {
        self.validate_disposal()?;
        self.state
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&listener));
        for communicator in self.communicators() {
            listener.on_connection(self, &communicator);
        }
        Ok(())
    }

    /// Live communicators.
    pub fn communicators(&self) -> Vec<Communicator> {
        self.state
            .communicators
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Look up a communicator by id.
    pub fn communicator(&self, id: &str) -> Option<Communicator> {
        self.state.communicators.get(id).map(|c| c.value().clone())
    }

    /// Add a route to every current and future communicator.
    pub fn map(
        &self,
        pattern: Arc<dyn RoutePattern>,
        handler: Arc<dyn RequestHandler>,
    ) -> TetherResult<()> {
        self.validate_disposal()?;
        self.state
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((Arc::clone(&pattern), Arc::clone(&handler)));
        for communicator in self.communicators() {
            if let Err(e) = communicator.map(Arc::clone(&pattern), Arc::clone(&handler)) {
                debug!(communicator = %communicator.id(), error = %e, "Skipping route for disposed communicator");
            }
        }
        Ok(())
    }

    /// Remove a route from the host table and every communicator.
    pub fn unmap(&self, pattern: &dyn RoutePattern) -> TetherResult<Option<Arc<dyn RequestHandler>>> {
        self.validate_disposal()?;
        let removed = {
            let mut routes = self.state.routes.write().unwrap_or_else(|e| e.into_inner());
            routes
                .iter()
                .position(|(p, _)| p.equals(pattern))
                .map(|index| routes.remove(index).1)
        };
        for communicator in self.communicators() {
            let _ = communicator.unmap(pattern);
        }
        Ok(removed)
    }

    fn on_connection(&self, channel: Arc<dyn ChannelProxy>) {
        if self.is_disposed() {
            tokio::spawn(async move { channel.dispose().await });
            return;
        }
        let options = CommunicatorOptions {
            id: None,
            timeout: self.state.options.timeout,
        };
        let communicator = Communicator::detached(channel, options);
        {
            // Holding the read lock orders this against concurrent `map` calls.
            let routes = self.state.routes.read().unwrap_or_else(|e| e.into_inner());
            for (pattern, handler) in routes.iter() {
                let _ = communicator.map(Arc::clone(pattern), Arc::clone(handler));
            }
            self.state
                .communicators
                .insert(communicator.id().to_string(), communicator.clone());
        }
        info!(communicator = %communicator.id(), "Host accepted connection");

        for listener in self.listeners() {
            listener.on_connection(self, &communicator);
        }

        if let Err(e) = communicator.attach() {
            warn!(communicator = %communicator.id(), error = %e, "Failed to attach communicator");
            self.state.communicators.remove(communicator.id());
            return;
        }

        let state = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            communicator.closed().await;
            if let Some(state) = state.upgrade() {
                state.communicators.remove(communicator.id());
            }
            communicator.dispose().await;
            debug!(communicator = %communicator.id(), "Host dropped closed communicator");
        });
    }

    /// Stop listening and dispose every communicator. Idempotent.
    pub async fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let proxy = self
            .state
            .proxy
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(proxy) = proxy {
            let _ = proxy.set_handler(None);
            proxy.dispose().await;
        }
        let communicators = self.communicators();
        self.state.communicators.clear();
        for communicator in communicators {
            communicator.dispose().await;
        }
        self.state
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        for listener in self.listeners() {
            listener.on_close(self);
        }
        info!("Communication host disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChannelHost;
    use crate::pattern::{PathInfo, StringPattern};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn echo() -> Arc<dyn RequestHandler> {
        Arc::new(|_c: Communicator, _p: PathInfo, body: Value| async move {
            Ok::<_, TetherError>(body)
        })
    }

    fn client_of(memory: &MemoryChannelHost) -> Communicator {
        Communicator::new(memory.connect().unwrap(), CommunicatorOptions::default()).unwrap()
    }

    #[derive(Default)]
    struct Counting {
        connections: AtomicUsize,
        closes: AtomicUsize,
    }

    impl HostListener for Counting {
        fn on_connection(&self, _host: &CommunicationHost, _communicator: &Communicator) {
            self.connections.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _host: &CommunicationHost) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_routes_apply_to_existing_and_future_connections() {
        let memory = MemoryChannelHost::new();
        let host = CommunicationHost::new(memory.clone(), CommunicatorOptions::default()).unwrap();

        let early = client_of(&memory);
        tokio::time::sleep(Duration::from_millis(10)).await;
        host.map(StringPattern::shared("/echo").unwrap(), echo()).unwrap();
        let late = client_of(&memory);

        assert_eq!(early.send("/echo", json!("early")).await.unwrap(), json!("early"));
        assert_eq!(late.send("/echo", json!("late")).await.unwrap(), json!("late"));
        assert_eq!(host.communicators().len(), 2);

        host.unmap(&StringPattern::new("/echo").unwrap()).unwrap();
        assert!(early.send("/echo", json!(1)).await.unwrap_err().is_remote("NoRoute"));
    }

    #[tokio::test]
    async fn test_listener_sees_connections_and_replay() {
        let memory = MemoryChannelHost::new();
        let host = CommunicationHost::new(memory.clone(), CommunicatorOptions::default()).unwrap();
        let _first = client_of(&memory);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let counting = Arc::new(Counting::default());
        host.subscribe(counting.clone()).unwrap();
        assert_eq!(counting.connections.load(Ordering::SeqCst), 1);

        let _second = client_of(&memory);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counting.connections.load(Ordering::SeqCst), 2);

        host.dispose().await;
        host.dispose().await;
        assert_eq!(counting.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_forgotten() {
        let memory = MemoryChannelHost::new();
        let host = CommunicationHost::new(memory.clone(), CommunicatorOptions::default()).unwrap();
        let client = client_of(&memory);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.communicators().len(), 1);

        client.dispose().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(host.communicators().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_closes_clients() {
        let memory = MemoryChannelHost::new();
        let host = CommunicationHost::new(memory.clone(), CommunicatorOptions::default()).unwrap();
        let client = client_of(&memory);
        tokio::time::sleep(Duration::from_millis(10)).await;

        host.dispose().await;
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(host.map(StringPattern::shared("/x").unwrap(), echo()).is_err());
        assert!(host.communicators().is_empty());
    }

    #[tokio::test]
    async fn test_host_calls_client_routes() {
        let memory = MemoryChannelHost::new();
        let host = CommunicationHost::new(memory.clone(), CommunicatorOptions::default()).unwrap();
        let client = client_of(&memory);
        client.map(StringPattern::shared("/ping").unwrap(), echo()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let server_side = host.communicators().pop().unwrap();
        assert!(host.communicator(server_side.id()).is_some());
        assert_eq!(server_side.send("/ping", json!("pong")).await.unwrap(), json!("pong"));
    }
}
