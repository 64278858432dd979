//! `tether request`: resolve one component through a host.

use super::parse_arg;
use std::path::PathBuf;
use tether_modules::ModuleManager;
use tether_remote::{ObjectRef, Value};
use tether_types::config::ConnectionInfo;
use tether_types::{TetherError, TetherResult};
use tether_wire::ChannelInitializers;

pub fn cmd_request(
    config: Option<PathBuf>,
    connection_info: String,
    component: String,
    args: Vec<String>,
    call: bool,
) {
    super::run(request(config, connection_info, component, args, call));
}

async fn request(
    config: Option<PathBuf>,
    connection_info: String,
    component: String,
    args: Vec<String>,
    call: bool,
) -> TetherResult<()> {
    let config = crate::config::load_config(config.as_deref());
    let info: ConnectionInfo = serde_json::from_str(&connection_info)?;
    let manager = ModuleManager::connect(
        info,
        &ChannelInitializers::with_defaults(),
        &config.remoting.proxy_path,
    )
    .await?;

    let args = args.iter().map(|raw| parse_arg(raw)).collect();
    let result = async {
        let mut value = manager
            .get_component(&component, args)
            .await?
            .ok_or_else(|| TetherError::InvalidArgument(format!("no provider for {component}")))?;
        if call {
            value = match value {
                Value::Function(function) => function.call(Value::Undefined, Vec::new()).await?,
                other => other,
            };
        }
        render(&value).await
    }
    .await;

    manager.dispose().await;
    println!("{}", result?);
    Ok(())
}

/// Printable form of a resolved value.
async fn render(value: &Value) -> TetherResult<String> {
    match value {
        Value::Function(_) => Ok("[function]".to_string()),
        Value::Object(ObjectRef::Remote(object)) => {
            let members: Vec<&str> = object.members().keys().map(String::as_str).collect();
            Ok(format!("[object {}] members: {}", object.id(), members.join(", ")))
        }
        Value::Object(ObjectRef::Local(_)) => Ok("[object]".to_string()),
        inline => Ok(serde_json::to_string_pretty(&inline.to_json()?)?),
    }
}
