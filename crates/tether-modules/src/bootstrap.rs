//! Process bootstrap: command-line contract for child processes, forking,
//! and the process-wide default manager.

use crate::manager::ModuleManager;

use std::ffi::OsStr;
use std::sync::RwLock;
use tether_types::config::ConnectionInfo;
use tether_types::{TetherError, TetherResult};
use tokio::process::{Child, Command};
use tracing::info;

/// Flag carrying the JSON connection info of the parent.
pub const CONNECTION_INFO_ARG: &str = "--connection-info";
/// Flag naming the module the child loads.
pub const MODULE_PATH_ARG: &str = "--module-path";

static DEFAULT_MANAGER: RwLock<Option<ModuleManager>> = RwLock::new(None);

/// Value of `flag`, given as `flag value` or `flag=value`.
fn find_arg<I, S>(args: I, flag: &str) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        if arg == flag {
            return args.next().map(|value| value.as_ref().to_string());
        }
        if let Some(value) = arg
            .strip_prefix(flag)
            .and_then(|rest| rest.strip_prefix('='))
        {
            return Some(value.to_string());
        }
    }
    None
}

/// Parse the connection info passed by a parent process, if any.
pub fn connection_info_from_args<I, S>(args: I) -> TetherResult<Option<ConnectionInfo>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    find_arg(args, CONNECTION_INFO_ARG)
        .map(|json| serde_json::from_str(&json).map_err(TetherError::from))
        .transpose()
}

/// The module a child process was asked to load, if any.
pub fn module_path_from_args<I, S>(args: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    find_arg(args, MODULE_PATH_ARG)
}

/// Arguments that hand `info` and `module_path` to a child.
pub fn child_args(info: &ConnectionInfo, module_path: &str) -> TetherResult<Vec<String>> {
    Ok(vec![
        CONNECTION_INFO_ARG.to_string(),
        serde_json::to_string(info)?,
        MODULE_PATH_ARG.to_string(),
        module_path.to_string(),
    ])
}

/// Start `program` as a child that connects back to `manager` and loads
/// `module_path`. Extra leading arguments (a subcommand, say) go in `prefix`.
pub fn fork<S: AsRef<OsStr>>(
    manager: &ModuleManager,
    program: impl AsRef<OsStr>,
    prefix: &[S],
    module_path: &str,
) -> TetherResult<Child> {
    if module_path.trim().is_empty() {
        return Err(TetherError::InvalidArgument(
            "module path must be a non-empty string".to_string(),
        ));
    }
    let info = manager.connection_info().ok_or_else(|| {
        TetherError::InvalidArgument(
            "Failed to fork a new process as there is no connection info bound with the given module manager."
                .to_string(),
        )
    })?;

    let child = Command::new(program)
        .args(prefix)
        .args(child_args(&info, module_path)?)
        .spawn()?;
    info!(pid = ?child.id(), module = module_path, "Tether: forked child process");
    Ok(child)
}

/// Install the process-wide manager, returning the previous one.
pub fn set_module_manager(manager: Option<ModuleManager>) -> Option<ModuleManager> {
    std::mem::replace(
        &mut *DEFAULT_MANAGER.write().unwrap_or_else(|e| e.into_inner()),
        manager,
    )
}

/// The process-wide manager, if one was installed.
pub fn module_manager() -> Option<ModuleManager> {
    DEFAULT_MANAGER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}
