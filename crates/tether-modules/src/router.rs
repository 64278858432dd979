//! Routing component lookups to connected peers.
//!
//! A process in the client role talks to one peer through a
//! [`ClientRouter`]; the process hosting the conversation keeps one proxy per
//! connected peer in a [`HostRouter`] and relays lookups between them.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tether_remote::{ObjectRemotingProxy, ProxyOptions, Value};
use tether_types::{TetherError, TetherResult};
use tether_wire::{CommunicationHost, Communicator, HostListener};
use tracing::{debug, info, warn};

/// Resolves a component on behalf of a peer.
#[async_trait]
pub trait LocalResolver: Send + Sync + 'static {
    /// `Undefined` when this side has nothing to offer.
    async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value>;
}

/// Forwards component lookups to peers.
#[async_trait]
pub trait ObjectRemotingRouter: Send + Sync + 'static {
    /// Ask the peers for `identifier`; `Undefined` when none has it.
    async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value>;

    /// Drop every peer connection.
    async fn dispose(&self);
}

fn router_disposed() -> TetherError {
    TetherError::Disposed("ObjectRemotingRouter".to_string())
}

// ---------------------------------------------------------------------------
// Client role
// ---------------------------------------------------------------------------

/// Router over a single communicator. Owns the communicator.
pub struct ClientRouter {
    proxy: ObjectRemotingProxy,
}

impl ClientRouter {
    pub fn new(
        communicator: Communicator,
        path: &str,
        local: Arc<dyn LocalResolver>,
    ) -> TetherResult<Self> {
        let proxy = ObjectRemotingProxy::with_options(
            communicator,
            ProxyOptions {
                path: path.to_string(),
                id: None,
                owns_communicator: true,
            },
        )?;
        proxy.set_resolver(Some(Arc::new(
            move |_requestor: ObjectRemotingProxy, identifier: String, args: Vec<Value>| {
                let local = Arc::clone(&local);
                async move { local.request(&identifier, args).await }
            },
        )))?;
        debug!(proxy = %proxy.id(), "Client router ready");
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &ObjectRemotingProxy {
        &self.proxy
    }
}

#[async_trait]
impl ObjectRemotingRouter for ClientRouter {
    async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value> {
        if self.proxy.is_disposed() {
            return Err(router_disposed());
        }
        self.proxy.request(identifier, extra_args).await
    }

    async fn dispose(&self) {
        self.proxy.dispose().await;
    }
}

// ---------------------------------------------------------------------------
// Host role
// ---------------------------------------------------------------------------

struct HostRouterState {
    host: CommunicationHost,
    path: String,
    local: Arc<dyn LocalResolver>,
    proxies: RwLock<Vec<ObjectRemotingProxy>>,
    disposed: AtomicBool,
}

impl HostRouterState {
    fn proxies(&self) -> Vec<ObjectRemotingProxy> {
        self.proxies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Local components first, then every peer except the requestor.
    async fn resolve(
        &self,
        requestor: &ObjectRemotingProxy,
        identifier: &str,
        extra_args: Vec<Value>,
    ) -> TetherResult<Value> {
        let value = self.local.request(identifier, extra_args.clone()).await?;
        if !value.is_undefined() {
            return Ok(value);
        }
        for proxy in self.proxies() {
            if proxy.id() == requestor.id() {
                continue;
            }
            if let Some(value) = ask_peer(&proxy, identifier, extra_args.clone()).await {
                debug!(identifier, peer = %proxy.id(), "Lookup relayed to peer");
                return Ok(value);
            }
        }
        Ok(Value::Undefined)
    }

    fn remove(&self, communicator_id: &str) -> Option<ObjectRemotingProxy> {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        let index = proxies.iter().position(|proxy| {
            proxy
                .communicator()
                .map(|c| c.id() == communicator_id)
                .unwrap_or(false)
        })?;
        Some(proxies.remove(index))
    }
}

/// A failing peer is skipped so the remaining peers still get asked.
async fn ask_peer(
    proxy: &ObjectRemotingProxy,
    identifier: &str,
    extra_args: Vec<Value>,
) -> Option<Value> {
    match proxy.request(identifier, extra_args).await {
        Ok(value) if !value.is_undefined() => Some(value),
        Ok(_) => None,
        Err(e) => {
            warn!(peer = %proxy.id(), identifier, error = %e, "Peer lookup failed");
            None
        }
    }
}

struct ProxyAttacher {
    state: Weak<HostRouterState>,
}

impl HostListener for ProxyAttacher {
    fn on_connection(&self, _host: &CommunicationHost, communicator: &Communicator) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        if state.disposed.load(Ordering::SeqCst) {
            return;
        }

        let proxy = {
            let mut proxies = state.proxies.write().unwrap_or_else(|e| e.into_inner());
            let known = proxies.iter().any(|proxy| {
                proxy
                    .communicator()
                    .map(|c| c.ptr_eq(communicator))
                    .unwrap_or(false)
            });
            if known {
                return;
            }
            let proxy = match ObjectRemotingProxy::with_options(
                communicator.clone(),
                ProxyOptions {
                    path: state.path.clone(),
                    ..ProxyOptions::default()
                },
            ) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(communicator = %communicator.id(), error = %e, "Failed to attach proxy");
                    return;
                }
            };
            proxies.push(proxy.clone());
            proxy
        };

        let weak = self.state.clone();
        let resolver = move |requestor: ObjectRemotingProxy, identifier: String, args: Vec<Value>| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(state) => state.resolve(&requestor, &identifier, args).await,
                    None => Err(router_disposed()),
                }
            }
        };
        if let Err(e) = proxy.set_resolver(Some(Arc::new(resolver))) {
            warn!(proxy = %proxy.id(), error = %e, "Failed to install resolver");
        }

        let weak = self.state.clone();
        let communicator = communicator.clone();
        tokio::spawn(async move {
            communicator.closed().await;
            if let Some(state) = weak.upgrade() {
                if let Some(proxy) = state.remove(communicator.id()) {
                    debug!(communicator = %communicator.id(), "Peer left, dropping its proxy");
                    proxy.dispose().await;
                }
            }
        });
    }
}

/// Router over every communicator a host accepts. Owns the host.
pub struct HostRouter {
    state: Arc<HostRouterState>,
}

impl HostRouter {
    pub fn new(
        host: CommunicationHost,
        path: &str,
        local: Arc<dyn LocalResolver>,
    ) -> TetherResult<Self> {
        let state = Arc::new(HostRouterState {
            host: host.clone(),
            path: path.to_string(),
            local,
            proxies: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        host.subscribe(Arc::new(ProxyAttacher {
            state: Arc::downgrade(&state),
        }))?;
        Ok(Self { state })
    }

    /// Proxies of the connected peers, in connection order.
    pub fn proxies(&self) -> Vec<ObjectRemotingProxy> {
        self.state.proxies()
    }

    pub fn host(&self) -> &CommunicationHost {
        &self.state.host
    }
}

#[async_trait]
impl ObjectRemotingRouter for HostRouter {
    async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value> {
        if self.state.disposed.load(Ordering::SeqCst) {
            return Err(router_disposed());
        }
        for proxy in self.state.proxies() {
            if let Some(value) = ask_peer(&proxy, identifier, extra_args.clone()).await {
                return Ok(value);
            }
        }
        Ok(Value::Undefined)
    }

    async fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let proxies = std::mem::take(
            &mut *self.state.proxies.write().unwrap_or_else(|e| e.into_inner()),
        );
        for proxy in proxies {
            proxy.dispose().await;
        }
        self.state.host.dispose().await;
        info!("Tether: host router disposed");
    }
}
