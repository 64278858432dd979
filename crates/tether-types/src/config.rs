//! Configuration types for communicators, connections and the `tether` binary.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default route of the object-remoting proxy.
pub const DEFAULT_PROXY_PATH: &str = "/object-remoting-proxy";

/// Options accepted when constructing a communicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorOptions {
    /// Fixed communicator id. A random UUID is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Request timeout in milliseconds. Requests wait forever when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl CommunicatorOptions {
    /// The timeout as a [`Duration`], if one is configured.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

/// How a process reaches its peer.
///
/// Names a channel factory (`module_name` + `init_function`) and the
/// parameters to pass it. Travels between processes as JSON, usually on the
/// command line of a spawned child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Provider of the channel factory.
    pub module_name: String,
    /// Factory name within the provider.
    pub init_function: String,
    /// Positional factory parameters.
    #[serde(default)]
    pub init_function_params: Vec<serde_json::Value>,
    /// Options for the communicator built over the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communicator_options: Option<CommunicatorOptions>,
}

impl ConnectionInfo {
    /// Build connection info for a factory with the given parameters.
    pub fn new(
        module_name: impl Into<String>,
        init_function: impl Into<String>,
        init_function_params: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            init_function: init_function.into(),
            init_function_params,
            communicator_options: None,
        }
    }

    /// The first parameter as a string (socket path, address).
    pub fn first_param_str(&self) -> Option<&str> {
        self.init_function_params.first().and_then(|v| v.as_str())
    }
}

/// IPC endpoint settings for the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Path segments of the socket / pipe name. Random when empty.
    pub segments: Vec<String>,
    /// Listen on TCP instead of a local socket (e.g. `127.0.0.1:0`).
    pub tcp_listen: Option<String>,
}

/// Object-remoting settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    /// Route of the object-remoting proxy.
    pub proxy_path: String,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
        }
    }
}

/// Top-level configuration of the `tether` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Options applied to every communicator.
    pub communicator: CommunicatorOptions,
    /// Host endpoint.
    pub ipc: IpcConfig,
    /// Object remoting.
    pub remoting: RemotingConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            communicator: CommunicatorOptions::default(),
            ipc: IpcConfig::default(),
            remoting: RemotingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_json_shape() {
        let mut info = ConnectionInfo::new(
            "tether-wire",
            "ipc.connect",
            vec![serde_json::json!("/tmp/x.sock")],
        );
        info.communicator_options = Some(CommunicatorOptions {
            id: None,
            timeout: Some(500),
        });
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["moduleName"], "tether-wire");
        assert_eq!(json["initFunction"], "ipc.connect");
        assert_eq!(json["initFunctionParams"][0], "/tmp/x.sock");
        assert_eq!(json["communicatorOptions"]["timeout"], 500);
        assert!(json["communicatorOptions"].get("id").is_none());

        let back: ConnectionInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.first_param_str(), Some("/tmp/x.sock"));
    }

    #[test]
    fn test_timeout_duration() {
        let opts = CommunicatorOptions {
            id: None,
            timeout: Some(1500),
        };
        assert_eq!(opts.timeout_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(CommunicatorOptions::default().timeout_duration(), None);
    }

    #[test]
    fn test_config_defaults_from_partial_toml() {
        let config: TetherConfig = toml::from_str(
            r#"
            log_level = "debug"

            [communicator]
            timeout = 2000
        "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.communicator.timeout, Some(2000));
        assert_eq!(config.remoting.proxy_path, DEFAULT_PROXY_PATH);
        assert!(config.ipc.segments.is_empty());
    }
}
