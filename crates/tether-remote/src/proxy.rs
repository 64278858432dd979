//! The object-remoting endpoint bound to one communicator route.
//!
//! Each side of a conversation runs an [`ObjectRemotingProxy`]. It serves the
//! peer's requests against its own reference tables and offers the client
//! verbs stand-ins use to reach objects living in the peer.

use crate::data_info_manager::{DataInfoManager, LocalRef};
use crate::message::ProxyMessage;
use crate::stub::RemoteLink;
use crate::value::Value;

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tether_types::config::DEFAULT_PROXY_PATH;
use tether_types::data_info::DataInfo;
use tether_types::{TetherError, TetherResult};
use tether_wire::{Communicator, PathInfo, StringPattern};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Answers `Resource.Request` for named resources.
///
/// Implemented for any `Fn(ObjectRemotingProxy, String, Vec<Value>) -> impl Future`.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(
        &self,
        proxy: ObjectRemotingProxy,
        identifier: String,
        extra_args: Vec<Value>,
    ) -> TetherResult<Value>;
}

#[async_trait]
impl<F, Fut> Resolver for F
where
    F: Fn(ObjectRemotingProxy, String, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TetherResult<Value>> + Send + 'static,
{
    async fn resolve(
        &self,
        proxy: ObjectRemotingProxy,
        identifier: String,
        extra_args: Vec<Value>,
    ) -> TetherResult<Value> {
        (self)(proxy, identifier, extra_args).await
    }
}

/// Construction options for [`ObjectRemotingProxy`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Route path served and targeted by the proxy.
    pub path: String,
    /// Proxy id; generated when absent.
    pub id: Option<String>,
    /// Dispose the communicator together with the proxy.
    pub owns_communicator: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROXY_PATH.to_string(),
            id: None,
            owns_communicator: false,
        }
    }
}

pub(crate) struct ProxyInner {
    id: String,
    pattern: StringPattern,
    path: String,
    communicator: RwLock<Option<Communicator>>,
    owns_communicator: bool,
    resolver: RwLock<Option<Arc<dyn Resolver>>>,
    data_info: DataInfoManager,
    disposed: AtomicBool,
}

/// Object-remoting endpoint. Cloning is cheap; clones share one endpoint.
#[derive(Clone)]
pub struct ObjectRemotingProxy {
    inner: Arc<ProxyInner>,
}

impl ObjectRemotingProxy {
    /// Serve the default route on `communicator`.
    pub fn new(communicator: Communicator) -> TetherResult<Self> {
        Self::with_options(communicator, ProxyOptions::default())
    }

    /// Serve `options.path` on `communicator`. Must be called inside a Tokio
    /// runtime: releases of dead stand-ins are sent from a background task.
    pub fn with_options(communicator: Communicator, options: ProxyOptions) -> TetherResult<Self> {
        let pattern = StringPattern::new(options.path.clone())?;
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (release_tx, release_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<ProxyInner>| ProxyInner {
            data_info: DataInfoManager::with_link(RemoteLink {
                manager_id: Arc::from(id.as_str()),
                proxy: weak.clone(),
                release_tx,
            }),
            id: id.clone(),
            pattern: pattern.clone(),
            path: options.path,
            communicator: RwLock::new(Some(communicator.clone())),
            owns_communicator: options.owns_communicator,
            resolver: RwLock::new(None),
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let route_weak = weak.clone();
        communicator.map(
            Arc::new(pattern),
            Arc::new(move |_comm: Communicator, _path: PathInfo, body: serde_json::Value| {
                let weak = route_weak.clone();
                async move {
                    let inner = weak
                        .upgrade()
                        .ok_or_else(|| TetherError::Disposed("Proxy".to_string()))?;
                    ObjectRemotingProxy::from_inner(inner).on_request(body).await
                }
            }),
        )?;
        tokio::spawn(release_worker(weak, release_rx));

        debug!(proxy = %id, communicator = %communicator.id(), "Object remoting proxy bound");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    /// Proxy id, also the owner tag of every stand-in it creates.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Route path.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The communicator carrying the route.
    pub fn communicator(&self) -> TetherResult<Communicator> {
        self.inner
            .communicator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| self.disposed_error())
    }

    /// Reference tables and value codec.
    pub fn data_info(&self) -> &DataInfoManager {
        &self.inner.data_info
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Install (or clear) the resolver serving `Resource.Request`.
    pub fn set_resolver(&self, resolver: Option<Arc<dyn Resolver>>) -> TetherResult<()> {
        self.validate_disposal()?;
        *self.inner.resolver.write().unwrap_or_else(|e| e.into_inner()) = resolver;
        Ok(())
    }

    pub fn resolver(&self) -> Option<Arc<dyn Resolver>> {
        self.inner
            .resolver
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn disposed_error(&self) -> TetherError {
        TetherError::Disposed(format!("Proxy ({})", self.inner.id))
    }

    fn validate_disposal(&self) -> TetherResult<()> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Client verbs
    // ---------------------------------------------------------------------

    /// Ask the peer's resolver for `identifier`.
    pub async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value> {
        let extra_args = self.describe_all(&extra_args)?;
        self.send(ProxyMessage::Request {
            identifier: identifier.to_string(),
            extra_args,
        })
        .await
    }

    /// Tell the peer that `count` descriptors of `ref_id` are no longer
    /// held here. A count of zero asks it to forget the reference outright.
    pub async fn release(&self, ref_id: &str, count: u64) -> TetherResult<()> {
        self.send(ProxyMessage::Release {
            ref_id: ref_id.to_string(),
            count,
        })
        .await?;
        Ok(())
    }

    /// Call the peer's function `ref_id`.
    pub async fn apply(&self, ref_id: &str, this: Value, args: Vec<Value>) -> TetherResult<Value> {
        let this_arg = self.inner.data_info.to_data_info(&this)?;
        let args = self.describe_all(&args)?;
        self.send(ProxyMessage::Apply {
            ref_id: ref_id.to_string(),
            this_arg,
            args,
        })
        .await
    }

    /// Read `property` of the peer's object `ref_id`.
    pub async fn get_property(&self, ref_id: &str, property: &str) -> TetherResult<Value> {
        self.send(ProxyMessage::GetProperty {
            ref_id: ref_id.to_string(),
            property: property.to_string(),
        })
        .await
    }

    /// Write `property` of the peer's object `ref_id`.
    pub async fn set_property(&self, ref_id: &str, property: &str, value: Value) -> TetherResult<bool> {
        let value = self.inner.data_info.to_data_info(&value)?;
        let result = self
            .send(ProxyMessage::SetProperty {
                ref_id: ref_id.to_string(),
                property: property.to_string(),
                value,
            })
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    fn describe_all(&self, values: &[Value]) -> TetherResult<Vec<DataInfo>> {
        values
            .iter()
            .map(|value| self.inner.data_info.to_data_info(value))
            .collect()
    }

    async fn send(&self, message: ProxyMessage) -> TetherResult<Value> {
        self.validate_disposal()?;
        let communicator = self.communicator()?;
        let action = message.action();
        let body = serde_json::to_value(&message)?;
        let response = communicator.send(&self.inner.path, body).await?;
        let info: DataInfo = serde_json::from_value(response).map_err(|e| {
            TetherError::Protocol(format!("{action} answered without a data info: {e}"))
        })?;
        self.inner.data_info.realize_data_info(&info)
    }

    // ---------------------------------------------------------------------
    // Server side
    // ---------------------------------------------------------------------

    async fn on_request(&self, body: serde_json::Value) -> TetherResult<serde_json::Value> {
        self.validate_disposal()?;
        let message: ProxyMessage = serde_json::from_value(body)
            .map_err(|e| TetherError::InvalidArgument(format!("Unknown proxy action: {e}")))?;
        debug!(proxy = %self.inner.id, action = message.action(), "Serving proxy request");

        let result = match message {
            ProxyMessage::Request {
                identifier,
                extra_args,
            } => {
                let args = self.realize_all(&extra_args)?;
                match self.resolver() {
                    Some(resolver) => resolver.resolve(self.clone(), identifier, args).await?,
                    None => Value::Undefined,
                }
            }
            ProxyMessage::Release { ref_id, count } => {
                if self.inner.data_info.release_data_info(&ref_id, count).is_none() {
                    return Err(TetherError::TargetNotFound(ref_id));
                }
                Value::Undefined
            }
            ProxyMessage::Apply {
                ref_id,
                this_arg,
                args,
            } => match self.target(&ref_id)? {
                LocalRef::Function(function) => {
                    let this = self.inner.data_info.realize_data_info(&this_arg)?;
                    let args = self.realize_all(&args)?;
                    function.call(this, args).await?
                }
                LocalRef::Object(_) => return Err(TetherError::NotCallable(ref_id)),
            },
            ProxyMessage::GetProperty { ref_id, property } => match self.target(&ref_id)? {
                LocalRef::Object(object) => object.get_property(&property).await?,
                LocalRef::Function(_) => return Err(TetherError::NotAnObject(ref_id)),
            },
            ProxyMessage::SetProperty {
                ref_id,
                property,
                value,
            } => match self.target(&ref_id)? {
                LocalRef::Object(object) => {
                    let value = self.inner.data_info.realize_data_info(&value)?;
                    object.set_property(&property, value).await?;
                    Value::Bool(true)
                }
                LocalRef::Function(_) => return Err(TetherError::NotAnObject(ref_id)),
            },
        };

        let info = self.inner.data_info.to_data_info(&result)?;
        Ok(serde_json::to_value(info)?)
    }

    fn target(&self, ref_id: &str) -> TetherResult<LocalRef> {
        self.inner
            .data_info
            .get(ref_id)
            .ok_or_else(|| TetherError::TargetNotFound(ref_id.to_string()))
    }

    fn realize_all(&self, infos: &[DataInfo]) -> TetherResult<Vec<Value>> {
        infos
            .iter()
            .map(|info| self.inner.data_info.realize_data_info(info))
            .collect()
    }

    /// Unbind the route and drop every reference. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let communicator = self
            .inner
            .communicator
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(communicator) = communicator {
            if !communicator.is_disposed() {
                if let Err(e) = communicator.unmap(&self.inner.pattern) {
                    debug!(proxy = %self.inner.id, error = %e, "Route already gone");
                }
            }
            if self.inner.owns_communicator {
                communicator.dispose().await;
            }
        }
        self.inner
            .resolver
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.inner.data_info.dispose();
        info!("Tether: proxy {} disposed", self.inner.id);
    }
}

impl fmt::Debug for ObjectRemotingProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRemotingProxy")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Sends `Resource.Release` for stand-ins whose last handle was dropped.
async fn release_worker(proxy: Weak<ProxyInner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(ref_id) = rx.recv().await {
        let Some(inner) = proxy.upgrade() else {
            break;
        };
        if inner.disposed.load(Ordering::SeqCst) {
            break;
        }
        let Some(count) = inner.data_info.take_dead_remote(&ref_id) else {
            continue;
        };
        let proxy = ObjectRemotingProxy::from_inner(inner);
        tokio::spawn(async move {
            if let Err(e) = proxy.release(&ref_id, count).await {
                warn!(proxy = %proxy.id(), ref_id = %ref_id, error = %e, "Release failed");
            }
        });
    }
}
