//! Component descriptors contributed by modules.

use crate::error::{ModuleError, ModuleResult};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tether_remote::Value;
use tether_types::{TetherError, TetherResult};

/// Builds a component from positional arguments: resolved `deps` first,
/// then the caller's extra arguments.
pub type Descriptor = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, TetherResult<Value>> + Send + Sync>;

/// Who may resolve a component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    /// Visible to this process and its peers.
    #[default]
    Remote,
    /// Visible to this process only.
    Local,
}

/// A component a module registers.
#[derive(Clone)]
pub struct ComponentInfo {
    pub name: String,
    pub descriptor: Descriptor,
    /// Build once and share the first successful value.
    pub singleton: bool,
    pub kind: ComponentKind,
    /// Component ids resolved and prepended to the descriptor's arguments.
    pub deps: Vec<String>,
    pub version: Option<String>,
}

impl ComponentInfo {
    /// A component built by an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, descriptor: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TetherResult<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            descriptor: Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, TetherResult<Value>> {
                Box::pin(descriptor(args))
            }),
            singleton: false,
            kind: ComponentKind::Remote,
            deps: Vec::new(),
            version: None,
        }
    }

    /// A singleton that always yields `value`.
    pub fn value(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, move |_args| {
            let value = value.clone();
            async move { Ok::<_, TetherError>(value) }
        })
        .singleton(true)
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Hide the component from peers.
    pub fn local(mut self) -> Self {
        self.kind = ComponentKind::Local;
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("name", &self.name)
            .field("singleton", &self.singleton)
            .field("kind", &self.kind)
            .field("deps", &self.deps)
            .field("version", &self.version)
            .finish()
    }
}

/// Components gathered from one module's metadata.
#[derive(Debug, Default)]
pub struct ComponentCollection {
    components: Vec<ComponentInfo>,
}

impl ComponentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component. Names must be non-empty and unique within the module.
    pub fn register(&mut self, info: ComponentInfo) -> ModuleResult<&mut Self> {
        if info.name.trim().is_empty() {
            return Err(ModuleError::InvalidComponent(
                "component name must be supplied".to_string(),
            ));
        }
        if let Some(dep) = info.deps.iter().find(|dep| dep.trim().is_empty()) {
            return Err(ModuleError::InvalidComponent(format!(
                "the deps of component \"{}\" contain an empty name ({dep:?})",
                info.name
            )));
        }
        if self.components.iter().any(|c| c.name == info.name) {
            return Err(ModuleError::InvalidComponent(format!(
                "the component is already taken: {}",
                info.name
            )));
        }
        self.components.push(info);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.components.iter()
    }

    pub fn into_vec(self) -> Vec<ComponentInfo> {
        self.components
    }
}
