//! Stand-ins for objects and functions owned by the peer.
//!
//! When the last handle to a stand-in is dropped its id is queued for
//! release; the owning proxy tells the peer it may forget the target.

use crate::proxy::{ObjectRemotingProxy, ProxyInner};
use crate::value::{Callable, Remotable, Value};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tether_types::{TetherError, TetherResult};
use tokio::sync::mpsc;

/// Connection from a stand-in back to the proxy that created it.
#[derive(Clone)]
pub(crate) struct RemoteLink {
    pub(crate) manager_id: Arc<str>,
    pub(crate) proxy: Weak<ProxyInner>,
    pub(crate) release_tx: mpsc::UnboundedSender<String>,
}

impl RemoteLink {
    /// A link to no proxy: stand-ins fail with `Disposed` and releases go nowhere.
    pub(crate) fn detached() -> Self {
        let (release_tx, _) = mpsc::unbounded_channel();
        Self {
            manager_id: Arc::from(uuid::Uuid::new_v4().to_string()),
            proxy: Weak::new(),
            release_tx,
        }
    }

    fn proxy(&self) -> TetherResult<ObjectRemotingProxy> {
        self.proxy
            .upgrade()
            .map(ObjectRemotingProxy::from_inner)
            .ok_or_else(|| TetherError::Disposed("Proxy".to_string()))
    }
}

pub(crate) struct RemoteObjectInner {
    id: String,
    members: BTreeMap<String, Value>,
    link: RemoteLink,
}

impl Drop for RemoteObjectInner {
    fn drop(&mut self) {
        let _ = self.link.release_tx.send(self.id.clone());
    }
}

/// An object living in the peer.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteObjectInner>,
}

impl RemoteObject {
    pub(crate) fn new(id: String, members: BTreeMap<String, Value>, link: RemoteLink) -> Self {
        Self {
            inner: Arc::new(RemoteObjectInner { id, members, link }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RemoteObjectInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RemoteObjectInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn belongs_to(&self, manager_id: &str) -> bool {
        &*self.inner.link.manager_id == manager_id
    }

    /// Reference id in the peer.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Members shipped with the reference.
    pub fn members(&self) -> &BTreeMap<String, Value> {
        &self.inner.members
    }

    /// A shipped member, without a round trip.
    pub fn member(&self, name: &str) -> Option<&Value> {
        self.inner.members.get(name)
    }

    /// Read a property: shipped members locally, anything else from the peer.
    pub async fn get(&self, name: &str) -> TetherResult<Value> {
        if let Some(member) = self.member(name) {
            return Ok(member.clone());
        }
        self.inner
            .link
            .proxy()?
            .get_property(&self.inner.id, name)
            .await
    }

    /// Write a property in the peer. Shipped members are read-only.
    pub async fn set(&self, name: &str, value: Value) -> TetherResult<()> {
        if self.member(name).is_some() {
            return Err(TetherError::ReadOnlyProperty(name.to_string()));
        }
        self.inner
            .link
            .proxy()?
            .set_property(&self.inner.id, name, value)
            .await?;
        Ok(())
    }

    /// Call the method `name` with this object as receiver.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> TetherResult<Value> {
        crate::value::ObjectRef::Remote(self.clone())
            .invoke(name, args)
            .await
    }
}

impl PartialEq for RemoteObject {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && self.inner.link.manager_id == other.inner.link.manager_id
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("id", &self.inner.id)
            .field("members", &self.inner.members.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Lets a stand-in be handed on to a third party: the holder re-exposes it.
#[async_trait]
impl Remotable for RemoteObject {
    fn members(&self) -> Vec<(String, Value)> {
        self.inner
            .members
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn get_property(&self, name: &str) -> TetherResult<Value> {
        self.get(name).await
    }

    async fn set_property(&self, name: &str, value: Value) -> TetherResult<()> {
        self.set(name, value).await
    }
}

pub(crate) struct RemoteFunctionInner {
    id: String,
    link: RemoteLink,
}

impl Drop for RemoteFunctionInner {
    fn drop(&mut self) {
        let _ = self.link.release_tx.send(self.id.clone());
    }
}

/// A function living in the peer.
#[derive(Clone)]
pub struct RemoteFunction {
    inner: Arc<RemoteFunctionInner>,
}

impl RemoteFunction {
    pub(crate) fn new(id: String, link: RemoteLink) -> Self {
        Self {
            inner: Arc::new(RemoteFunctionInner { id, link }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RemoteFunctionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RemoteFunctionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn belongs_to(&self, manager_id: &str) -> bool {
        &*self.inner.link.manager_id == manager_id
    }

    /// Reference id in the peer.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Invoke the function in the peer.
    pub async fn apply(&self, this: Value, args: Vec<Value>) -> TetherResult<Value> {
        self.inner
            .link
            .proxy()?
            .apply(&self.inner.id, this, args)
            .await
    }
}

impl PartialEq for RemoteFunction {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && self.inner.link.manager_id == other.inner.link.manager_id
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("id", &self.inner.id)
            .finish()
    }
}

#[async_trait]
impl Callable for RemoteFunction {
    async fn call(&self, this: Value, args: Vec<Value>) -> TetherResult<Value> {
        self.apply(this, args).await
    }
}
