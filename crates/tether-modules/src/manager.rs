//! The module manager: loads modules, owns the component container and
//! answers component lookups for itself and for its peers.

use crate::component::{ComponentInfo, ComponentKind, Descriptor};
use crate::di::{DiContainer, Registration};
use crate::error::{ModuleError, ModuleResult};
use crate::module::{Module, ModuleInfo};
use crate::router::{ClientRouter, HostRouter, LocalResolver, ObjectRemotingRouter};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock, Weak};
use tether_remote::Value;
use tether_types::config::{ConnectionInfo, DEFAULT_PROXY_PATH};
use tether_types::{TetherError, TetherResult};
use tether_wire::{ChannelInitializers, CommunicationHost, Communicator};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Where a manager talks to its peers.
pub enum Communication {
    /// Client role: one peer.
    Communicator(Communicator),
    /// Host role: every peer the host accepts.
    Host(CommunicationHost),
}

struct ManagerInner {
    router: RwLock<Option<Arc<dyn ObjectRemotingRouter>>>,
    container: DiContainer,
    loaded_modules: RwLock<BTreeMap<String, String>>,
    connection_info: RwLock<Option<ConnectionInfo>>,
    loading: Mutex<()>,
}

/// Loads modules and resolves their components. Cloning is cheap.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

/// The manager as seen by its router. Weak, so the router never keeps the
/// manager alive.
struct LocalHandle {
    inner: Weak<ManagerInner>,
}

#[async_trait]
impl LocalResolver for LocalHandle {
    async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value> {
        match self.inner.upgrade() {
            Some(inner) => ModuleManager { inner }.request(identifier, extra_args).await,
            None => Ok(Value::Undefined),
        }
    }
}

tokio::task_local! {
    /// Set while the current task runs a `load_modules` batch.
    static LOADING: ();
}

struct PendingModule {
    module: Arc<dyn Module>,
    info: ModuleInfo,
    components: Vec<ComponentInfo>,
}

impl ModuleManager {
    /// Manager on the default proxy path.
    pub fn new(communication: Communication) -> TetherResult<Self> {
        Self::with_proxy_path(communication, DEFAULT_PROXY_PATH)
    }

    /// Manager whose router serves `path`.
    pub fn with_proxy_path(communication: Communication, path: &str) -> TetherResult<Self> {
        let inner = Arc::new(ManagerInner {
            router: RwLock::new(None),
            container: DiContainer::new(),
            loaded_modules: RwLock::new(BTreeMap::new()),
            connection_info: RwLock::new(None),
            loading: Mutex::new(()),
        });
        let local: Arc<dyn LocalResolver> = Arc::new(LocalHandle {
            inner: Arc::downgrade(&inner),
        });

        let router: Arc<dyn ObjectRemotingRouter> = match communication {
            Communication::Communicator(communicator) => {
                Arc::new(ClientRouter::new(communicator, path, local)?)
            }
            Communication::Host(host) => {
                *inner
                    .connection_info
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = Some(host.connection_info().clone());
                Arc::new(HostRouter::new(host, path, local)?)
            }
        };
        *inner.router.write().unwrap_or_else(|e| e.into_inner()) = Some(router);
        Ok(Self { inner })
    }

    /// Connect to the peer described by `info` and manage modules over it.
    /// The info is kept so the manager can [`fork`](crate::bootstrap::fork).
    pub async fn connect(
        info: ConnectionInfo,
        initializers: &ChannelInitializers,
        path: &str,
    ) -> TetherResult<Self> {
        let communicator = tether_wire::connect(&info, initializers).await?;
        let manager = Self::with_proxy_path(Communication::Communicator(communicator), path)?;
        *manager
            .inner
            .connection_info
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(info);
        Ok(manager)
    }

    /// How children reach this manager, when known.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.inner
            .connection_info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn router(&self) -> TetherResult<Arc<dyn ObjectRemotingRouter>> {
        self.inner
            .router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TetherError::Disposed("ModuleManager".to_string()))
    }

    fn validate_disposal(&self) -> TetherResult<()> {
        self.router().map(|_| ())
    }

    /// Loaded module names and versions.
    pub fn loaded_modules(&self) -> BTreeMap<String, String> {
        self.inner
            .loaded_modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Registered component ids.
    pub fn component_ids(&self) -> Vec<String> {
        self.inner.container.ids()
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.inner
            .loaded_modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Register the components of `modules` and initialize the modules in
    /// dependency order. Batches are loaded one at a time; a module may load
    /// further modules from its [`Module::initialize`] hook.
    pub async fn load_modules(&self, modules: Vec<Arc<dyn Module>>) -> ModuleResult<()> {
        self.validate_disposal()?;
        // The loading task already holds the lock.
        if LOADING.try_with(|_| ()).is_ok() {
            return self.load_batch(modules).await;
        }
        let _loading = self.inner.loading.lock().await;
        LOADING.scope((), self.load_batch(modules)).await
    }

    async fn load_batch(&self, modules: Vec<Arc<dyn Module>>) -> ModuleResult<()> {
        let mut batch = Vec::with_capacity(modules.len());
        let mut names = HashSet::new();
        for module in modules {
            let mut components = crate::component::ComponentCollection::new();
            let info = module.metadata(&mut components)?;
            info.validate()?;
            if !names.insert(info.name.clone()) {
                return Err(ModuleError::DuplicateModule(info.name));
            }
            batch.push(PendingModule {
                module,
                info,
                components: components.into_vec(),
            });
        }

        let loaded = self.loaded_modules();
        let mut pending = Vec::with_capacity(batch.len());
        for entry in batch {
            match loaded.get(&entry.info.name) {
                Some(version) if *version == entry.info.version => {
                    debug!(module = %entry.info.name, version = %version, "Module already loaded");
                }
                Some(version) => {
                    return Err(ModuleError::VersionConflict {
                        name: entry.info.name,
                        loaded: version.clone(),
                        requested: entry.info.version,
                    });
                }
                None => pending.push(entry),
            }
        }

        // Components of modules that fail to load are withdrawn again.
        let mut registered: Vec<(String, Vec<String>)> = Vec::with_capacity(pending.len());
        for entry in &mut pending {
            let namespace = entry.info.component_namespace().to_string();
            let components = std::mem::take(&mut entry.components);
            let ids = components
                .iter()
                .map(|c| format!("{namespace}.{}", c.name))
                .collect();
            if let Err(e) = self.register_components(&namespace, components, false) {
                self.unregister(&registered);
                return Err(e);
            }
            registered.push((entry.info.name.clone(), ids));
        }

        if let Err(e) = self.initialize_modules(pending).await {
            let loaded = self.loaded_modules();
            registered.retain(|(name, _)| !loaded.contains_key(name));
            self.unregister(&registered);
            return Err(e);
        }
        Ok(())
    }

    fn unregister(&self, registered: &[(String, Vec<String>)]) {
        for (module, ids) in registered {
            debug!(module = %module, components = ids.len(), "Withdrawing components");
            for id in ids {
                self.inner.container.remove(id);
            }
        }
    }

    async fn initialize_modules(&self, pending: Vec<PendingModule>) -> ModuleResult<()> {
        let in_batch: HashSet<String> = pending.iter().map(|m| m.info.name.clone()).collect();
        let mut queue: VecDeque<PendingModule> = pending.into();
        let mut stalled = 0;

        while let Some(entry) = queue.pop_front() {
            let missing = entry
                .info
                .dependencies
                .keys()
                .find(|dep| !self.is_loaded(dep))
                .cloned();

            if let Some(dependency) = missing {
                if !in_batch.contains(&dependency) {
                    return Err(ModuleError::DependencyNotFound {
                        module: entry.info.name,
                        dependency,
                    });
                }
                queue.push_back(entry);
                stalled += 1;
                if stalled >= queue.len() {
                    return Err(ModuleError::CircularDependency(
                        queue.iter().map(|m| m.info.name.clone()).collect(),
                    ));
                }
                continue;
            }

            entry.module.initialize(self).await?;
            stalled = 0;
            self.inner
                .loaded_modules
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(entry.info.name.clone(), entry.info.version.clone());
            info!("Tether: loaded module {}@{}", entry.info.name, entry.info.version);
        }
        Ok(())
    }

    /// Register components as `"<namespace>.<name>"`. Existing ids are an
    /// error unless `force` is set.
    pub fn register_components(
        &self,
        namespace: &str,
        components: Vec<ComponentInfo>,
        force: bool,
    ) -> ModuleResult<()> {
        self.validate_disposal()?;
        if !force {
            if let Some(taken) = components
                .iter()
                .map(|c| format!("{namespace}.{}", c.name))
                .find(|id| self.inner.container.contains(id))
            {
                return Err(ModuleError::ComponentConflict(taken));
            }
        }

        for component in components {
            let id = format!("{namespace}.{}", component.name);
            let dedicated = self.dedicated_descriptor(component.descriptor, component.deps);
            let descriptor = if component.singleton {
                singleton_descriptor(dedicated)
            } else {
                dedicated
            };
            debug!(
                component = %id,
                singleton = component.singleton,
                kind = ?component.kind,
                version = ?component.version,
                "Component registered"
            );
            let replaced = self.inner.container.set(
                id.clone(),
                Registration {
                    descriptor,
                    kind: component.kind,
                    version: component.version,
                },
            );
            if let Some(replaced) = replaced {
                warn!(
                    component = %id,
                    replaced_version = ?replaced.version,
                    "Component replaced by forced registration"
                );
            }
        }
        Ok(())
    }

    /// Wraps `raw` so its `deps` are resolved and prepended to the arguments.
    fn dedicated_descriptor(&self, raw: Descriptor, deps: Vec<String>) -> Descriptor {
        let weak = Arc::downgrade(&self.inner);
        let deps = Arc::new(deps);
        Arc::new(move |extra_args: Vec<Value>| -> BoxFuture<'static, TetherResult<Value>> {
            let weak = weak.clone();
            let deps = Arc::clone(&deps);
            let raw = Arc::clone(&raw);
            Box::pin(async move {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| TetherError::Disposed("ModuleManager".to_string()))?;
                let manager = ModuleManager { inner };
                let mut args = Vec::with_capacity(deps.len() + extra_args.len());
                for dep in deps.iter() {
                    args.push(manager.get_component(dep, Vec::new()).await?.unwrap_or_default());
                }
                args.extend(extra_args);
                raw(args).await
            })
        })
    }

    /// Resolve a component: this process first, then the peers. `None` when
    /// nobody provides it.
    pub async fn get_component(
        &self,
        identity: &str,
        extra_args: Vec<Value>,
    ) -> TetherResult<Option<Value>> {
        let router = self.router()?;
        if identity.trim().is_empty() {
            return Err(TetherError::InvalidArgument(
                "component identity must be a non-empty string".to_string(),
            ));
        }

        let value = self.inner.container.get_dep(identity, extra_args.clone()).await?;
        if !value.is_undefined() {
            return Ok(Some(value));
        }

        let value = router.request(identity, extra_args).await?;
        Ok((!value.is_undefined()).then_some(value))
    }

    /// Resolve a component for a peer. Local components stay hidden.
    pub async fn request(&self, identifier: &str, extra_args: Vec<Value>) -> TetherResult<Value> {
        self.validate_disposal()?;
        match self.inner.container.get(identifier) {
            Some(registration) if registration.kind == ComponentKind::Local => Ok(Value::Undefined),
            Some(registration) => (registration.descriptor)(extra_args).await,
            None => Ok(Value::Undefined),
        }
    }

    /// Dispose the router (and with it the communicator or host). Idempotent.
    pub async fn dispose(&self) {
        let router = self
            .inner
            .router
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(router) = router {
            router.dispose().await;
            self.inner.container.clear();
            info!("Tether: module manager disposed");
        }
    }
}

/// Memoizes the first successful value of `dedicated`.
fn singleton_descriptor(dedicated: Descriptor) -> Descriptor {
    let cell: Arc<OnceCell<Value>> = Arc::new(OnceCell::new());
    Arc::new(move |extra_args: Vec<Value>| -> BoxFuture<'static, TetherResult<Value>> {
        let cell = Arc::clone(&cell);
        let dedicated = Arc::clone(&dedicated);
        Box::pin(async move {
            cell.get_or_try_init(|| dedicated(extra_args))
                .await
                .cloned()
        })
    })
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.loaded_modules())
            .field("components", &self.component_ids())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
