//! Conversion between [`Value`]s and wire [`DataInfo`] descriptors.
//!
//! The manager owns the reference tables of one proxy: local objects and
//! functions handed to the peer (kept alive until the peer releases them),
//! and weak entries for the peer's objects realized here.
//!
//! Both sides count descriptors per reference id. The owner counts how many
//! it sent and the peer how many it realized; a release carries the peer's
//! count, so a descriptor still in flight keeps the reference alive.

use crate::object::DynamicObject;
use crate::stub::{RemoteFunction, RemoteFunctionInner, RemoteLink, RemoteObject, RemoteObjectInner};
use crate::value::{Callable, FunctionRef, ObjectRef, Remotable, Value};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tether_types::data_info::{DataInfo, DataType, TAG_SEPARATOR};
use tether_types::{TetherError, TetherResult};
use tracing::debug;
use uuid::Uuid;

/// A local target the peer holds a reference to.
#[derive(Clone)]
pub enum LocalRef {
    Object(Arc<dyn Remotable>),
    Function(Arc<dyn Callable>),
}

impl LocalRef {
    /// The target as a value.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Object(object) => Value::Object(ObjectRef::Local(Arc::clone(object))),
            Self::Function(function) => Value::Function(FunctionRef::Local(Arc::clone(function))),
        }
    }
}

struct LocalEntry {
    target: LocalRef,
    identity: usize,
    /// Descriptors sent and not yet released.
    sent: u64,
}

struct RemoteEntry {
    stand_in: StandIn,
    /// Descriptors realized since the entry was created.
    seen: u64,
}

enum StandIn {
    Object(Weak<RemoteObjectInner>),
    Function(Weak<RemoteFunctionInner>),
}

impl StandIn {
    fn upgrade(&self) -> Option<Value> {
        match self {
            Self::Object(weak) => weak
                .upgrade()
                .map(|inner| Value::Object(ObjectRef::Remote(RemoteObject::from_inner(inner)))),
            Self::Function(weak) => weak.upgrade().map(|inner| {
                Value::Function(FunctionRef::Remote(RemoteFunction::from_inner(inner)))
            }),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Self::Object(weak) => weak.strong_count() > 0,
            Self::Function(weak) => weak.strong_count() > 0,
        }
    }
}

fn identity_of<T: ?Sized>(target: &Arc<T>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// Per-proxy reference tables and the value codec.
pub struct DataInfoManager {
    link: RemoteLink,
    local_refs: DashMap<String, LocalEntry>,
    identities: DashMap<usize, DataInfo>,
    remote_refs: Mutex<HashMap<String, RemoteEntry>>,
}

impl Default for DataInfoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DataInfoManager {
    /// A manager not attached to any proxy. Stand-ins it realizes fail with
    /// `Disposed` when used.
    pub fn new() -> Self {
        Self::with_link(RemoteLink::detached())
    }

    pub(crate) fn with_link(link: RemoteLink) -> Self {
        Self {
            link,
            local_refs: DashMap::new(),
            identities: DashMap::new(),
            remote_refs: Mutex::new(HashMap::new()),
        }
    }

    /// Describe a value for the wire, registering references as needed.
    pub fn to_data_info(&self, value: &Value) -> TetherResult<DataInfo> {
        let info = self.convert(value, true)?;
        self.note_sent(&info);
        Ok(info)
    }

    /// Describe a value without registering objects: only inline values and
    /// functions are accepted.
    pub fn to_data_info_shallow(&self, value: &Value) -> TetherResult<DataInfo> {
        let info = self.convert(value, false)?;
        self.note_sent(&info);
        Ok(info)
    }

    fn note_sent(&self, info: &DataInfo) {
        if let Some(id) = info.id.as_deref() {
            if let Some(mut entry) = self.local_refs.get_mut(id) {
                entry.sent += 1;
            }
        }
        for member in info.member_infos.iter().flat_map(BTreeMap::values) {
            self.note_sent(member);
        }
    }

    fn convert(&self, value: &Value, recursive: bool) -> TetherResult<DataInfo> {
        match value {
            Value::Undefined => Ok(DataInfo::undefined()),
            Value::Null => Ok(DataInfo::inline(DataType::Null, "null")),
            Value::Bool(b) => Ok(DataInfo::inline(DataType::Boolean, b.to_string())),
            Value::Number(n) => Ok(DataInfo::inline(
                DataType::Number,
                number_json(*n).to_string(),
            )),
            Value::String(s) => Ok(DataInfo::inline(DataType::String, serde_json::to_string(s)?)),
            Value::Buffer(bytes) => Ok(DataInfo::inline(DataType::Buffer, BASE64.encode(bytes))),
            Value::Array(_) | Value::Map(_) if value.is_inline() => Ok(DataInfo::inline(
                DataType::Object,
                serde_json::to_string(&tagged_json(value))?,
            )),
            Value::Array(_) | Value::Map(_) => {
                if !recursive {
                    return Err(unsupported_shallow(value));
                }
                let object: Arc<dyn Remotable> = Arc::new(DynamicObject::from_value(value));
                let identity = identity_of(&object);
                self.register_object(object, identity)
            }
            Value::Object(ObjectRef::Local(object)) => {
                if !recursive {
                    return Err(unsupported_shallow(value));
                }
                self.register_object(Arc::clone(object), identity_of(object))
            }
            Value::Object(ObjectRef::Remote(object)) => {
                if object.belongs_to(&self.link.manager_id) {
                    return Ok(DataInfo::reference(DataType::Object, object.id(), None));
                }
                if !recursive {
                    return Err(unsupported_shallow(value));
                }
                // A stand-in from another proxy is re-exposed as our own object.
                let identity = object.identity();
                if let Some(info) = self.identities.get(&identity) {
                    return Ok(info.clone());
                }
                self.register_object(Arc::new(object.clone()), identity)
            }
            Value::Function(FunctionRef::Local(function)) => {
                self.register_function(Arc::clone(function), identity_of(function))
            }
            Value::Function(FunctionRef::Remote(function)) => {
                if function.belongs_to(&self.link.manager_id) {
                    return Ok(DataInfo::reference(DataType::Function, function.id(), None));
                }
                let identity = function.identity();
                if let Some(info) = self.identities.get(&identity) {
                    return Ok(info.clone());
                }
                self.register_function(Arc::new(function.clone()), identity)
            }
        }
    }

    fn register_object(&self, object: Arc<dyn Remotable>, identity: usize) -> TetherResult<DataInfo> {
        if let Some(info) = self.identities.get(&identity) {
            return Ok(info.clone());
        }
        let mut member_infos = BTreeMap::new();
        for (name, member) in object.members() {
            if member_infos.contains_key(&name) {
                continue;
            }
            let info = self.convert(&member, false)?;
            member_infos.insert(name, info);
        }
        let id = Uuid::new_v4().to_string();
        let info = DataInfo::reference(DataType::Object, id.clone(), Some(member_infos));
        self.publish(id, LocalRef::Object(object), identity, info)
    }

    fn register_function(&self, function: Arc<dyn Callable>, identity: usize) -> TetherResult<DataInfo> {
        if let Some(info) = self.identities.get(&identity) {
            return Ok(info.clone());
        }
        let id = Uuid::new_v4().to_string();
        let info = DataInfo::reference(DataType::Function, id.clone(), None);
        self.publish(id, LocalRef::Function(function), identity, info)
    }

    /// Record a new local reference. If another task published the same
    /// target concurrently, its descriptor wins and ours is withdrawn.
    fn publish(
        &self,
        id: String,
        target: LocalRef,
        identity: usize,
        info: DataInfo,
    ) -> TetherResult<DataInfo> {
        self.local_refs
            .insert(id.clone(), LocalEntry { target, identity, sent: 0 });
        let winner = self
            .identities
            .entry(identity)
            .or_insert_with(|| info.clone())
            .clone();
        if winner.id.as_deref() != Some(id.as_str()) {
            self.local_refs.remove(&id);
        } else {
            debug!(ref_id = %id, kind = %info.data_type, "Exposed local reference");
        }
        Ok(winner)
    }

    /// Turn a descriptor back into a value.
    pub fn realize_data_info(&self, info: &DataInfo) -> TetherResult<Value> {
        match info.data_type {
            DataType::Undefined => Ok(Value::Undefined),
            DataType::Symbol => Err(TetherError::UnsupportedDataType("symbol".to_string())),
            DataType::Buffer => {
                let encoded = info.value.as_deref().unwrap_or_default();
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| TetherError::Serialization(format!("invalid buffer: {e}")))?;
                Ok(Value::Buffer(bytes.into()))
            }
            DataType::Object | DataType::Function if info.id.is_some() => {
                let id = info.id.as_deref().unwrap_or_default();
                self.realize_reference(info, id)
            }
            DataType::Function => Err(TetherError::Protocol(
                "function descriptor without id".to_string(),
            )),
            _ => {
                let text = info.value.as_deref().ok_or_else(|| {
                    TetherError::Protocol(format!("{} descriptor without value", info.data_type))
                })?;
                let json: serde_json::Value = serde_json::from_str(text)?;
                Ok(untag(json, true))
            }
        }
    }

    fn realize_reference(&self, info: &DataInfo, id: &str) -> TetherResult<Value> {
        if let Some(entry) = self.local_refs.get(id) {
            return Ok(entry.target.to_value());
        }
        {
            let mut remote_refs = self.remote_refs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = reuse_stand_in(&mut remote_refs, info, id) {
                return Ok(existing);
            }
        }

        let (value, stand_in) = match info.data_type {
            DataType::Function => {
                let function = RemoteFunction::new(id.to_string(), self.link.clone());
                let stand_in = StandIn::Function(function.downgrade());
                (Value::Function(FunctionRef::Remote(function)), stand_in)
            }
            _ => {
                let mut members = BTreeMap::new();
                for (name, member) in info.member_infos.iter().flatten() {
                    members.insert(name.clone(), self.realize_data_info(member)?);
                }
                let object = RemoteObject::new(id.to_string(), members, self.link.clone());
                let stand_in = StandIn::Object(object.downgrade());
                (Value::Object(ObjectRef::Remote(object)), stand_in)
            }
        };

        let mut remote_refs = self.remote_refs.lock().unwrap_or_else(|e| e.into_inner());
        // Another task may have realized the same id meanwhile.
        if let Some(existing) = reuse_stand_in(&mut remote_refs, info, id) {
            return Ok(existing);
        }
        // A dead stand-in whose release has not gone out yet hands its count on.
        let seen = remote_refs.get(id).map_or(0, |entry| entry.seen) + 1;
        remote_refs.insert(id.to_string(), RemoteEntry { stand_in, seen });
        Ok(value)
    }

    /// Forget a dead stand-in. Returns the number of descriptors it accounted
    /// for, or `None` when the id was realized again or is unknown.
    pub(crate) fn take_dead_remote(&self, id: &str) -> Option<u64> {
        let mut remote_refs = self.remote_refs.lock().unwrap_or_else(|e| e.into_inner());
        if remote_refs.get(id)?.stand_in.is_alive() {
            return None;
        }
        remote_refs.remove(id).map(|entry| entry.seen)
    }

    /// Look up a local reference.
    pub fn get(&self, ref_id: &str) -> Option<LocalRef> {
        self.local_refs.get(ref_id).map(|entry| entry.target.clone())
    }

    /// Drop a local reference. Returns whether it existed.
    pub fn del_data_info(&self, ref_id: &str) -> bool {
        let Some((_, entry)) = self.local_refs.remove(ref_id) else {
            return false;
        };
        self.forget_identity(ref_id, &entry);
        true
    }

    /// Settle a release of `count` descriptors of `ref_id`. The reference is
    /// dropped once every descriptor sent for it is released; a count of zero
    /// drops it outright. Returns the descriptors still outstanding, `None`
    /// for an unknown id.
    pub fn release_data_info(&self, ref_id: &str, count: u64) -> Option<u64> {
        let remaining = {
            let mut entry = self.local_refs.get_mut(ref_id)?;
            entry.sent = if count == 0 {
                0
            } else {
                entry.sent.saturating_sub(count)
            };
            entry.sent
        };
        if remaining > 0 {
            debug!(ref_id, remaining, "Reference still held by the peer");
            return Some(remaining);
        }
        // A descriptor sent since the count was settled keeps the entry.
        match self.local_refs.remove_if(ref_id, |_, entry| entry.sent == 0) {
            Some((_, entry)) => {
                self.forget_identity(ref_id, &entry);
                Some(0)
            }
            None => Some(self.outstanding(ref_id).unwrap_or(0)),
        }
    }

    fn forget_identity(&self, ref_id: &str, entry: &LocalEntry) {
        self.identities
            .remove_if(&entry.identity, |_, info| info.id.as_deref() == Some(ref_id));
        debug!(ref_id, "Released local reference");
    }

    /// Descriptors of `ref_id` sent to the peer and not yet released.
    pub fn outstanding(&self, ref_id: &str) -> Option<u64> {
        self.local_refs.get(ref_id).map(|entry| entry.sent)
    }

    /// Number of local references held for the peer.
    pub fn local_count(&self) -> usize {
        self.local_refs.len()
    }

    /// Number of live stand-ins for the peer's objects.
    pub fn remote_count(&self) -> usize {
        self.remote_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.stand_in.is_alive())
            .count()
    }

    /// Drop every table.
    pub fn dispose(&self) {
        self.local_refs.clear();
        self.identities.clear();
        self.remote_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Hand out the live stand-in for `id`, counting the descriptor. The members
/// of a reused object are counted too, since they are not realized again.
fn reuse_stand_in(
    remote_refs: &mut HashMap<String, RemoteEntry>,
    info: &DataInfo,
    id: &str,
) -> Option<Value> {
    let entry = remote_refs.get_mut(id)?;
    let value = entry.stand_in.upgrade()?;
    entry.seen += 1;
    for member in info.member_infos.iter().flat_map(BTreeMap::values) {
        if let Some(member_id) = member.id.as_deref() {
            if let Some(entry) = remote_refs.get_mut(member_id) {
                entry.seen += 1;
            }
        }
    }
    Some(value)
}

fn unsupported_shallow(value: &Value) -> TetherError {
    TetherError::UnsupportedDataType(format!(
        "{} cannot be shipped as a member",
        value.type_name()
    ))
}

fn number_json(n: f64) -> serde_json::Value {
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn tag(data_type: DataType, payload: &str) -> String {
    format!("{}{}{}", data_type.as_str(), TAG_SEPARATOR, payload)
}

/// JSON for an inline composite. Nested strings and buffers carry a type
/// tag; `undefined` is dropped from maps and becomes `null` in arrays.
fn tagged_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => number_json(*n),
        Value::String(s) => serde_json::Value::String(tag(DataType::String, s)),
        Value::Buffer(bytes) => {
            serde_json::Value::String(tag(DataType::Buffer, &BASE64.encode(bytes)))
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(tagged_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .filter(|(_, v)| !v.is_undefined())
                .map(|(k, v)| (k.clone(), tagged_json(v)))
                .collect(),
        ),
        Value::Object(_) | Value::Function(_) => serde_json::Value::Null,
    }
}

/// Inverse of [`tagged_json`]. The root string is taken literally.
fn untag(json: serde_json::Value, root: bool) -> Value {
    match json {
        serde_json::Value::String(s) if !root => untag_string(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| untag(item, false)).collect())
        }
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, untag(v, false)))
                .collect(),
        ),
        other => Value::from(other),
    }
}

fn untag_string(s: String) -> Value {
    let Some((tag, payload)) = s.split_once(TAG_SEPARATOR) else {
        return Value::String(s);
    };
    match DataType::from_tag(tag) {
        Some(DataType::String) => Value::String(payload.to_string()),
        Some(DataType::Buffer) => match BASE64.decode(payload) {
            Ok(bytes) => Value::Buffer(bytes.into()),
            Err(_) => Value::String(s),
        },
        _ => Value::String(s),
    }
}
