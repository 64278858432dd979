//! `tether child`: the process side of `host --spawn`.

use crate::config::load_config;
use crate::modules;
use std::path::PathBuf;
use tether_modules::bootstrap::set_module_manager;
use tether_modules::{Communication, ModuleError, ModuleManager, ModuleResult};
use tether_types::config::ConnectionInfo;
use tether_types::TetherError;
use tether_wire::ChannelInitializers;
use tracing::info;

pub fn cmd_child(config: Option<PathBuf>, connection_info: String, module_path: String) {
    super::run(child(config, connection_info, module_path));
}

async fn child(config: Option<PathBuf>, connection_info: String, module_path: String) -> ModuleResult<()> {
    let config = load_config(config.as_deref());
    let info: ConnectionInfo = serde_json::from_str(&connection_info).map_err(TetherError::from)?;
    let modules = modules::with_dependencies(&module_path)
        .ok_or_else(|| ModuleError::InvalidModule(format!("unknown module {module_path}")))?;

    let communicator = tether_wire::connect(&info, &ChannelInitializers::with_defaults()).await?;
    let manager = ModuleManager::with_proxy_path(
        Communication::Communicator(communicator.clone()),
        &config.remoting.proxy_path,
    )?;
    set_module_manager(Some(manager.clone()));
    manager.load_modules(modules).await?;
    info!(module = %module_path, pid = std::process::id(), "Tether: child ready");

    tokio::select! {
        _ = communicator.closed() => info!("Host went away, exiting"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, exiting"),
    }
    set_module_manager(None);
    manager.dispose().await;
    Ok(())
}
