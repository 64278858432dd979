//! Wire descriptors for values crossing the object-remoting boundary.
//!
//! A [`DataInfo`] either carries a value inline (as JSON text) or names a
//! reference that lives on the sending side.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Separator between a type tag and its payload in nested inline values.
pub const TAG_SEPARATOR: char = ':';

/// Kind of value described by a [`DataInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Undefined,
    Null,
    Object,
    Boolean,
    Number,
    String,
    Symbol,
    Function,
    /// Binary payload.
    #[serde(rename = "node.buffer")]
    Buffer,
}

impl DataType {
    /// The wire spelling of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Object => "object",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Symbol => "symbol",
            Self::Function => "function",
            Self::Buffer => "node.buffer",
        }
    }

    /// Parse a type tag as found in front of a nested inline value.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "undefined" => Some(Self::Undefined),
            "null" => Some(Self::Null),
            "object" => Some(Self::Object),
            "boolean" => Some(Self::Boolean),
            "number" => Some(Self::Number),
            "string" => Some(Self::String),
            "symbol" => Some(Self::Symbol),
            "function" => Some(Self::Function),
            "node.buffer" => Some(Self::Buffer),
            _ => None,
        }
    }

    /// Whether values of this type travel by reference.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Object | Self::Function)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of a single value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInfo {
    /// What kind of value this is.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Reference id, present for object and function references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Inline payload as JSON text (base64 for a top-level buffer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Eagerly shipped members of an object reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_infos: Option<BTreeMap<String, DataInfo>>,
}

impl DataInfo {
    /// Descriptor for `undefined`.
    pub fn undefined() -> Self {
        Self {
            data_type: DataType::Undefined,
            id: None,
            value: None,
            member_infos: None,
        }
    }

    /// Descriptor for an inline value.
    pub fn inline(data_type: DataType, value: impl Into<String>) -> Self {
        Self {
            data_type,
            id: None,
            value: Some(value.into()),
            member_infos: None,
        }
    }

    /// Descriptor for a reference.
    pub fn reference(
        data_type: DataType,
        id: impl Into<String>,
        member_infos: Option<BTreeMap<String, DataInfo>>,
    ) -> Self {
        Self {
            data_type,
            id: Some(id.into()),
            value: None,
            member_infos,
        }
    }

    /// Whether this descriptor names a reference rather than carrying a value.
    pub fn is_reference(&self) -> bool {
        self.data_type.is_reference() && self.id.is_some()
    }
}
