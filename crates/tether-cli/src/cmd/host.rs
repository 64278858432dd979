//! `tether host`: accept peers, load modules, spawn children.

use crate::config::load_config;
use crate::modules;
use std::path::PathBuf;
use std::sync::Arc;
use tether_modules::bootstrap::{fork, set_module_manager};
use tether_modules::{Communication, Module, ModuleError, ModuleManager, ModuleResult};
use tether_types::{TetherError, TetherResult};
use tether_wire::{ipc, ChannelHostProxy, CommunicationHost, StreamChannelHost};
use tokio::process::Child;
use tracing::{info, warn};

pub fn cmd_host(config: Option<PathBuf>, listen: Option<String>, modules: Vec<String>, spawns: Vec<String>) {
    super::run(host(config, listen, modules, spawns));
}

fn builtin(name: &str) -> ModuleResult<Vec<Arc<dyn Module>>> {
    modules::with_dependencies(name).ok_or_else(|| {
        ModuleError::InvalidModule(format!(
            "unknown module {name}; available: {}",
            modules::names().join(", ")
        ))
    })
}

/// Modules to load for `names`, each at most once, dependencies first.
fn resolve_modules(names: &[String]) -> ModuleResult<Vec<Arc<dyn Module>>> {
    let mut seen = std::collections::HashSet::new();
    let mut resolved = Vec::new();
    for name in names {
        for module in builtin(name)? {
            let mut probe = tether_modules::ComponentCollection::new();
            let info = module.metadata(&mut probe)?;
            if seen.insert(info.name) {
                resolved.push(module);
            }
        }
    }
    Ok(resolved)
}

async fn bind(listen: Option<String>, segments: &[String]) -> TetherResult<Arc<dyn ChannelHostProxy>> {
    let channels: Arc<dyn ChannelHostProxy> = match listen {
        Some(addr) => StreamChannelHost::bind_tcp(&addr).await?,
        None => ipc::host(segments)?,
    };
    Ok(channels)
}

async fn host(
    config: Option<PathBuf>,
    listen: Option<String>,
    module_names: Vec<String>,
    spawns: Vec<String>,
) -> ModuleResult<()> {
    let config = load_config(config.as_deref());
    for name in &spawns {
        builtin(name)?;
    }

    let listen = listen.or_else(|| config.ipc.tcp_listen.clone());
    let channels = bind(listen, &config.ipc.segments).await?;
    let host = CommunicationHost::new(channels, config.communicator.clone())?;
    let manager = ModuleManager::with_proxy_path(Communication::Host(host), &config.remoting.proxy_path)?;
    set_module_manager(Some(manager.clone()));

    manager.load_modules(resolve_modules(&module_names)?).await?;

    let info = manager
        .connection_info()
        .ok_or_else(|| TetherError::Internal("host has no connection info".to_string()))?;
    println!("{}", serde_json::to_string(&info).map_err(TetherError::from)?);

    let program = std::env::current_exe().map_err(TetherError::from)?;
    let mut children: Vec<Child> = Vec::with_capacity(spawns.len());
    for name in &spawns {
        children.push(fork(&manager, &program, &["child"], name)?);
    }

    info!(
        modules = ?manager.loaded_modules(),
        children = children.len(),
        "Tether: host ready, press Ctrl+C to stop"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
    }

    for child in &mut children {
        if let Err(e) = child.kill().await {
            warn!(pid = ?child.id(), error = %e, "Failed to stop child");
        }
    }
    set_module_manager(None);
    manager.dispose().await;
    Ok(())
}
