//! Opening a communicator from serialized [`ConnectionInfo`].
//!
//! Connection info names a channel factory by provider and function. The
//! [`ChannelInitializers`] registry resolves those names to factories
//! compiled into the process.

use crate::channel::ChannelProxy;
use crate::communicator::Communicator;
use crate::stream::StreamChannel;

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tether_types::config::ConnectionInfo;
use tether_types::{TetherError, TetherResult};
use tracing::info;

/// Provider name of the factories registered by [`ChannelInitializers::with_defaults`].
pub const WIRE_MODULE: &str = "tether-wire";

/// Future produced by a channel factory.
pub type ChannelFuture = BoxFuture<'static, TetherResult<Arc<dyn ChannelProxy>>>;

/// Opens a channel from positional parameters.
pub type ChannelFactory = Arc<dyn Fn(Vec<serde_json::Value>) -> ChannelFuture + Send + Sync>;

/// Registry of channel factories keyed by `(module_name, init_function)`.
#[derive(Clone, Default)]
pub struct ChannelInitializers {
    factories: HashMap<(String, String), ChannelFactory>,
}

fn first_string_param(params: &[serde_json::Value], function: &str) -> TetherResult<String> {
    params
        .first()
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| {
            TetherError::InvalidArgument(format!("{function} expects a string as first parameter"))
        })
}

impl ChannelInitializers {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `ipc.connect` and `tcp.connect` factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            WIRE_MODULE,
            "ipc.connect",
            Arc::new(|params: Vec<serde_json::Value>| -> ChannelFuture {
                Box::pin(async move {
                    let path = PathBuf::from(first_string_param(&params, "ipc.connect")?);
                    let channel: Arc<dyn ChannelProxy> = crate::ipc::connect(&path).await?;
                    Ok(channel)
                })
            }),
        );
        registry.register(
            WIRE_MODULE,
            "tcp.connect",
            Arc::new(|params: Vec<serde_json::Value>| -> ChannelFuture {
                Box::pin(async move {
                    let addr = first_string_param(&params, "tcp.connect")?;
                    let channel: Arc<dyn ChannelProxy> = StreamChannel::connect_tcp(&addr).await?;
                    Ok(channel)
                })
            }),
        );
        registry
    }

    /// Register or replace a factory.
    pub fn register(
        &mut self,
        module_name: impl Into<String>,
        init_function: impl Into<String>,
        factory: ChannelFactory,
    ) {
        self.factories
            .insert((module_name.into(), init_function.into()), factory);
    }

    /// Open the channel described by `info`.
    pub async fn open(&self, info: &ConnectionInfo) -> TetherResult<Arc<dyn ChannelProxy>> {
        let key = (info.module_name.clone(), info.init_function.clone());
        let factory = self.factories.get(&key).cloned().ok_or_else(|| {
            TetherError::InvalidArgument(format!(
                "No channel initializer {}::{}",
                info.module_name, info.init_function
            ))
        })?;
        factory(info.init_function_params.clone()).await
    }
}

/// Open a communicator to the peer described by `info`.
pub async fn connect(
    info: &ConnectionInfo,
    initializers: &ChannelInitializers,
) -> TetherResult<Communicator> {
    let channel = initializers.open(info).await?;
    let communicator = Communicator::new(
        channel,
        info.communicator_options.clone().unwrap_or_default(),
    )?;
    info!(
        communicator = %communicator.id(),
        module = %info.module_name,
        function = %info.init_function,
        "Connected"
    );
    Ok(communicator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHostProxy;
    use crate::communicator::RequestHandler;
    use crate::host::CommunicationHost;
    use crate::pattern::{PathInfo, StringPattern};
    use crate::stream::StreamChannelHost;
    use serde_json::{json, Value};
    use tether_types::config::CommunicatorOptions;

    #[tokio::test]
    async fn test_unknown_initializer() {
        let info = ConnectionInfo::new("elsewhere", "open", vec![]);
        let err = connect(&info, &ChannelInitializers::with_defaults())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("elsewhere::open"));
    }

    #[tokio::test]
    async fn test_bad_params() {
        let info = ConnectionInfo::new(WIRE_MODULE, "tcp.connect", vec![json!(5)]);
        let err = connect(&info, &ChannelInitializers::with_defaults())
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_connect_over_tcp_with_options() {
        let listener = StreamChannelHost::bind_tcp("127.0.0.1:0").await.unwrap();
        let mut info = listener.connection_info();
        let host = CommunicationHost::new(listener, CommunicatorOptions::default()).unwrap();
        let handler: Arc<dyn RequestHandler> =
            Arc::new(|_c: Communicator, _p: PathInfo, body: Value| async move {
                Ok::<_, TetherError>(json!({ "echo": body }))
            });
        host.map(StringPattern::shared("/echo").unwrap(), handler)
            .unwrap();

        info.communicator_options = Some(CommunicatorOptions {
            id: Some("child-1".to_string()),
            timeout: Some(5_000),
        });
        let communicator = connect(&info, &ChannelInitializers::with_defaults())
            .await
            .unwrap();
        assert_eq!(communicator.id(), "child-1");
        let reply = communicator.send("/echo", json!(3)).await.unwrap();
        assert_eq!(reply, json!({ "echo": 3 }));

        communicator.dispose().await;
        host.dispose().await;
    }
}
