//! Module metadata and the [`Module`] trait.

use crate::component::ComponentCollection;
use crate::error::{ModuleError, ModuleResult};
use crate::manager::ModuleManager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity and dependencies of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub name: String,
    /// Namespace for the module's components; the module name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_version: Option<String>,
    /// Module name to version requirement. Only presence is enforced.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            version: version.into(),
            host_version: None,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }

    /// Namespace components are registered under.
    pub fn component_namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(self.name.as_str())
    }

    pub(crate) fn validate(&self) -> ModuleResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModuleError::InvalidModule(
                "module name must be a non-empty string".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(ModuleError::InvalidModule(format!(
                "version of module {} must be a non-empty string",
                self.name
            )));
        }
        Ok(())
    }
}

/// A unit of functionality loaded into a [`ModuleManager`].
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Describe the module and register its components.
    fn metadata(&self, components: &mut ComponentCollection) -> ModuleResult<ModuleInfo>;

    /// Called once, after every dependency has been initialized.
    async fn initialize(&self, _manager: &ModuleManager) -> ModuleResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_defaults_to_name() {
        let info = ModuleInfo::new("storage", "1.0.0");
        assert_eq!(info.component_namespace(), "storage");
        let info = info.with_namespace("db");
        assert_eq!(info.component_namespace(), "db");
    }

    #[test]
    fn test_json_shape() {
        let info = ModuleInfo::new("ui", "2.1.0").with_dependency("storage", "^1.0.0");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["dependencies"]["storage"], "^1.0.0");
        assert!(json.get("hostVersion").is_none());

        let parsed: ModuleInfo = serde_json::from_value(serde_json::json!({
            "name": "ui",
            "version": "2.1.0",
            "hostVersion": "0.2.3"
        }))
        .unwrap();
        assert_eq!(parsed.host_version.as_deref(), Some("0.2.3"));
        assert!(parsed.dependencies.is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(ModuleInfo::new("", "1.0.0").validate().is_err());
        assert!(ModuleInfo::new("a", " ").validate().is_err());
        assert!(ModuleInfo::new("a", "1.0.0").validate().is_ok());
    }
}
