//! Requests understood by the object-remoting route.

use serde::{Deserialize, Serialize};
use tether_types::data_info::DataInfo;

/// Body of a request sent to a peer's proxy route, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ProxyMessage {
    /// Ask the peer's resolver for a named resource.
    #[serde(rename = "Resource.Request", rename_all = "camelCase")]
    Request {
        identifier: String,
        #[serde(default)]
        extra_args: Vec<DataInfo>,
    },
    /// The sender no longer holds a stand-in for `ref_id`. `count` is the
    /// number of descriptors that stand-in accounted for; zero releases the
    /// reference outright.
    #[serde(rename = "Resource.Release", rename_all = "camelCase")]
    Release {
        ref_id: String,
        #[serde(default)]
        count: u64,
    },
    /// Call a function reference.
    #[serde(rename = "Resource.Apply", rename_all = "camelCase")]
    Apply {
        ref_id: String,
        this_arg: DataInfo,
        #[serde(default)]
        args: Vec<DataInfo>,
    },
    /// Read a property of an object reference.
    #[serde(rename = "Resource.GetProperty", rename_all = "camelCase")]
    GetProperty { ref_id: String, property: String },
    /// Write a property of an object reference.
    #[serde(rename = "Resource.SetProperty", rename_all = "camelCase")]
    SetProperty {
        ref_id: String,
        property: String,
        value: DataInfo,
    },
}

impl ProxyMessage {
    /// The wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Resource.Request",
            Self::Release { .. } => "Resource.Release",
            Self::Apply { .. } => "Resource.Apply",
            Self::GetProperty { .. } => "Resource.GetProperty",
            Self::SetProperty { .. } => "Resource.SetProperty",
        }
    }
}
