//! A property bag usable as a remotable object.

use crate::value::{Remotable, Value};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tether_types::{TetherError, TetherResult};

/// Object with methods fixed at construction and mutable properties.
///
/// Methods are shipped with the reference; properties are read and written
/// through the owner, so peers always see current values. Composite values
/// that contain references travel as a `DynamicObject` (arrays expose their
/// elements as `"0"`, `"1"`, ... plus `"length"`).
#[derive(Default)]
pub struct DynamicObject {
    methods: Vec<(String, Value)>,
    properties: RwLock<BTreeMap<String, Value>>,
}

impl DynamicObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method (or constant) shipped with the reference.
    pub fn with_method(mut self, name: impl Into<String>, method: Value) -> Self {
        self.methods.push((name.into(), method));
        self
    }

    /// Set an initial property.
    pub fn with_property(self, name: impl Into<String>, value: Value) -> Self {
        self.properties
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value);
        self
    }

    /// Expose an array or map. Other values become the single property `"value"`.
    pub fn from_value(value: &Value) -> Self {
        let properties = match value {
            Value::Map(entries) => entries.clone(),
            Value::Array(items) => {
                let mut map: BTreeMap<String, Value> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (i.to_string(), item.clone()))
                    .collect();
                map.insert("length".to_string(), Value::Number(items.len() as f64));
                map
            }
            other => BTreeMap::from([("value".to_string(), other.clone())]),
        };
        Self {
            methods: Vec::new(),
            properties: RwLock::new(properties),
        }
    }

    /// Current value of a property.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.properties
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn method(&self, name: &str) -> Option<&Value> {
        self.methods
            .iter()
            .find(|(method, _)| method == name)
            .map(|(_, value)| value)
    }
}

#[async_trait]
impl Remotable for DynamicObject {
    fn members(&self) -> Vec<(String, Value)> {
        self.methods.clone()
    }

    async fn get_property(&self, name: &str) -> TetherResult<Value> {
        if let Some(method) = self.method(name) {
            return Ok(method.clone());
        }
        Ok(self.get(name).unwrap_or_default())
    }

    async fn set_property(&self, name: &str, value: Value) -> TetherResult<()> {
        if self.method(name).is_some() {
            return Err(TetherError::ReadOnlyProperty(name.to_string()));
        }
        self.properties
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_properties_and_methods() {
        let object = DynamicObject::new()
            .with_property("count", Value::from(1))
            .with_method(
                "noop",
                Value::function(|_this, _args| async { Ok::<_, TetherError>(Value::Undefined) }),
            );

        assert_eq!(object.get_property("count").await.unwrap(), Value::from(1));
        object.set_property("count", Value::from(2)).await.unwrap();
        assert_eq!(object.get("count"), Some(Value::from(2)));
        assert!(object.get_property("missing").await.unwrap().is_undefined());
        assert!(matches!(
            object.set_property("noop", Value::Null).await,
            Err(TetherError::ReadOnlyProperty(_))
        ));
        assert_eq!(object.members().len(), 1);
    }

    #[test]
    fn test_from_array() {
        let object = DynamicObject::from_value(&Value::Array(vec![Value::from("a"), Value::Null]));
        assert_eq!(object.get("0"), Some(Value::from("a")));
        assert_eq!(object.get("length"), Some(Value::Number(2.0)));
    }
}
