//! Values that can cross the object-remoting boundary.
//!
//! Plain data travels inline. Objects and functions travel by reference: the
//! receiving side gets a [`RemoteObject`] or [`RemoteFunction`] stand-in that
//! forwards every use back to the owner.

use crate::stub::{RemoteFunction, RemoteObject};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tether_types::{TetherError, TetherResult};

/// Something that can be invoked from the other side.
#[async_trait]
pub trait Callable: Send + Sync + 'static {
    /// Invoke with a receiver and positional arguments.
    async fn call(&self, this: Value, args: Vec<Value>) -> TetherResult<Value>;
}

/// An object whose properties can be read and written from the other side.
#[async_trait]
pub trait Remotable: Send + Sync + 'static {
    /// Members shipped together with the reference and served locally by the
    /// stand-in: methods and constants. Must be inline values or functions;
    /// the first occurrence of a name wins.
    fn members(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Read a property.
    async fn get_property(&self, name: &str) -> TetherResult<Value>;

    /// Write a property.
    async fn set_property(&self, name: &str, _value: Value) -> TetherResult<()> {
        Err(TetherError::ReadOnlyProperty(name.to_string()))
    }
}

/// An object handle: owned here or living in the peer.
#[derive(Clone)]
pub enum ObjectRef {
    Local(Arc<dyn Remotable>),
    Remote(RemoteObject),
}

impl ObjectRef {
    /// Read a property.
    pub async fn get(&self, name: &str) -> TetherResult<Value> {
        match self {
            Self::Local(object) => object.get_property(name).await,
            Self::Remote(object) => object.get(name).await,
        }
    }

    /// Write a property.
    pub async fn set(&self, name: &str, value: Value) -> TetherResult<()> {
        match self {
            Self::Local(object) => object.set_property(name, value).await,
            Self::Remote(object) => object.set(name, value).await,
        }
    }

    /// Call the method `name` with this object as receiver.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> TetherResult<Value> {
        match self.get(name).await? {
            Value::Function(function) => function.call(Value::Object(self.clone()), args).await,
            _ => Err(TetherError::NotCallable(name.to_string())),
        }
    }
}

/// A function handle: owned here or living in the peer.
#[derive(Clone)]
pub enum FunctionRef {
    Local(Arc<dyn Callable>),
    Remote(RemoteFunction),
}

impl FunctionRef {
    /// Invoke the function.
    pub async fn call(&self, this: Value, args: Vec<Value>) -> TetherResult<Value> {
        match self {
            Self::Local(function) => function.call(this, args).await,
            Self::Remote(function) => function.apply(this, args).await,
        }
    }
}

/// Adapter turning an async closure into a [`Callable`].
pub struct FnCallable<F>(F);

#[async_trait]
impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TetherResult<Value>> + Send + 'static,
{
    async fn call(&self, this: Value, args: Vec<Value>) -> TetherResult<Value> {
        (self.0)(this, args).await
    }
}

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Buffer(Bytes),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectRef),
    Function(FunctionRef),
}

impl Value {
    /// Wrap a local object.
    pub fn object<T: Remotable>(object: T) -> Self {
        Self::Object(ObjectRef::Local(Arc::new(object)))
    }

    /// Wrap a shared local object, keeping its identity.
    pub fn shared_object(object: Arc<dyn Remotable>) -> Self {
        Self::Object(ObjectRef::Local(object))
    }

    /// Wrap an async closure as a local function.
    pub fn function<F, Fut>(function: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TetherResult<Value>> + Send + 'static,
    {
        Self::Function(FunctionRef::Local(Arc::new(FnCallable(function))))
    }

    /// Wrap a binary payload.
    pub fn buffer(bytes: impl Into<Bytes>) -> Self {
        Self::Buffer(bytes.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// `undefined` or `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Whether the value (recursively) contains no object or function.
    pub fn is_inline(&self) -> bool {
        match self {
            Self::Object(_) | Self::Function(_) => false,
            Self::Array(items) => items.iter().all(Value::is_inline),
            Self::Map(entries) => entries.values().all(Value::is_inline),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Name of the value's type, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Buffer(_) => "buffer",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
        }
    }

    /// Convert plain data to JSON. Buffers become arrays of byte values;
    /// `undefined` becomes `null`. References cannot be converted.
    pub fn to_json(&self) -> TetherResult<serde_json::Value> {
        Ok(match self {
            Self::Undefined | Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Buffer(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Self::Array(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<TetherResult<_>>()?,
            ),
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<TetherResult<_>>()?,
            ),
            Self::Object(_) | Self::Function(_) => {
                return Err(TetherError::UnsupportedDataType(format!(
                    "{} has no JSON form",
                    self.type_name()
                )))
            }
        })
    }
}

impl PartialEq for Value {
    /// Inline values compare structurally; references by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Buffer(a), Self::Buffer(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Object(ObjectRef::Local(a)), Self::Object(ObjectRef::Local(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Object(ObjectRef::Remote(a)), Self::Object(ObjectRef::Remote(b))) => a == b,
            (Self::Function(FunctionRef::Local(a)), Self::Function(FunctionRef::Local(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Function(FunctionRef::Remote(a)), Self::Function(FunctionRef::Remote(b))) => {
                a == b
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Buffer(b) => f.debug_tuple("Buffer").field(&b.len()).finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Self::Object(ObjectRef::Local(_)) => f.write_str("Object(<local>)"),
            Self::Object(ObjectRef::Remote(object)) => {
                f.debug_tuple("Object").field(&object.id()).finish()
            }
            Self::Function(FunctionRef::Local(_)) => f.write_str("Function(<local>)"),
            Self::Function(FunctionRef::Remote(function)) => {
                f.debug_tuple("Function").field(&function.id()).finish()
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let value = Value::from(json!({"a": [1, "two", null], "b": true}));
        assert!(value.is_inline());
        assert_eq!(value.to_json().unwrap(), json!({"a": [1.0, "two", null], "b": true}));
    }

    #[test]
    fn test_references_are_not_inline() {
        let f = Value::function(|_this, _args| async { Ok::<_, TetherError>(Value::Undefined) });
        let nested = Value::Array(vec![Value::from(1), f.clone()]);
        assert!(!nested.is_inline());
        assert!(nested.to_json().is_err());
        assert_eq!(f, f.clone());
        assert_ne!(f, Value::function(|_this, _args| async { Ok::<_, TetherError>(Value::Undefined) }));
    }

    #[tokio::test]
    async fn test_local_function_call() {
        let add = Value::function(|_this, args: Vec<Value>| async move {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok::<_, TetherError>(Value::Number(sum))
        });
        let result = add
            .as_function()
            .unwrap()
            .call(Value::Undefined, vec![Value::from(2), Value::from(3)])
            .await
            .unwrap();
        assert_eq!(result, Value::Number(5.0));
    }

    #[test]
    fn test_nullish() {
        assert!(Value::Undefined.is_nullish());
        assert!(Value::Null.is_nullish());
        assert!(!Value::from(0).is_nullish());
        assert_eq!(Value::default(), Value::Undefined);
    }
}
