//! Keyed component container.

use crate::component::{ComponentKind, Descriptor};

use dashmap::DashMap;
use tether_remote::Value;
use tether_types::TetherResult;

/// A registered descriptor, its visibility and the version it was declared with.
#[derive(Clone)]
pub struct Registration {
    pub descriptor: Descriptor,
    pub kind: ComponentKind,
    pub version: Option<String>,
}

/// Component descriptors keyed by `"<namespace>.<name>"`.
#[derive(Default)]
pub struct DiContainer {
    entries: DashMap<String, Registration>,
}

impl DiContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, returning the registration it replaced.
    pub fn set(&self, id: impl Into<String>, registration: Registration) -> Option<Registration> {
        self.entries.insert(id.into(), registration)
    }

    pub fn get(&self, id: &str) -> Option<Registration> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Registration> {
        self.entries.remove(id).map(|(_, registration)| registration)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Build `id` with `args`, or `Undefined` when nothing is registered.
    pub async fn get_dep(&self, id: &str, args: Vec<Value>) -> TetherResult<Value> {
        match self.get(id) {
            Some(registration) => (registration.descriptor)(args).await,
            None => Ok(Value::Undefined),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentInfo;

    fn registration(info: ComponentInfo) -> Registration {
        Registration {
            descriptor: info.descriptor,
            kind: info.kind,
            version: info.version,
        }
    }

    #[tokio::test]
    async fn test_get_dep() {
        let container = DiContainer::new();
        let echo = ComponentInfo::new("echo", |args: Vec<Value>| async move {
            Ok::<_, tether_types::TetherError>(Value::Array(args))
        });
        assert!(container.set("core.echo", registration(echo)).is_none());

        let value = container
            .get_dep("core.echo", vec![Value::from(1)])
            .await
            .unwrap();
        assert_eq!(value, Value::Array(vec![Value::from(1)]));
        assert_eq!(
            container.get_dep("core.missing", vec![]).await.unwrap(),
            Value::Undefined
        );
    }

    #[test]
    fn test_bookkeeping() {
        let container = DiContainer::new();
        container.set("b.x", registration(ComponentInfo::value("x", Value::Null)));
        container.set(
            "a.y",
            registration(ComponentInfo::value("y", Value::Null).local().with_version("0.3.0")),
        );
        assert_eq!(container.ids(), vec!["a.y", "b.x"]);
        assert_eq!(container.get("a.y").map(|r| r.kind), Some(ComponentKind::Local));
        assert_eq!(container.get("a.y").and_then(|r| r.version).as_deref(), Some("0.3.0"));
        assert_eq!(container.get("b.x").and_then(|r| r.version), None);
        assert!(container.remove("b.x").is_some());
        assert!(!container.contains("b.x"));
        container.clear();
        assert!(container.is_empty());
    }
}
