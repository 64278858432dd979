//! Modules built into the `tether` binary, addressable by name from the
//! command line and from `--module-path` in child processes.

use async_trait::async_trait;
use std::sync::Arc;
use tether_modules::{ComponentCollection, ComponentInfo, Module, ModuleInfo, ModuleManager, ModuleResult};
use tether_remote::{DynamicObject, Value};
use tether_types::TetherError;
use tracing::info;

/// Process facts and an echo service.
pub struct RuntimeModule;

#[async_trait]
impl Module for RuntimeModule {
    fn metadata(&self, components: &mut ComponentCollection) -> ModuleResult<ModuleInfo> {
        components
            .register(ComponentInfo::new("echo", |args: Vec<Value>| async move {
                Ok::<_, TetherError>(match args.len() {
                    0 => Value::Undefined,
                    1 => args.into_iter().next().unwrap_or_default(),
                    _ => Value::Array(args),
                })
            }))?
            .register(
                ComponentInfo::new("info", |_args: Vec<Value>| async {
                    let info = DynamicObject::new()
                        .with_property("pid", Value::from(std::process::id() as f64))
                        .with_property("version", Value::from(env!("CARGO_PKG_VERSION")))
                        .with_property("startedAt", Value::from(chrono::Utc::now().to_rfc3339()));
                    Ok::<_, TetherError>(Value::object(info))
                })
                .singleton(true),
            )?;
        Ok(ModuleInfo::new("runtime", env!("CARGO_PKG_VERSION")))
    }

    async fn initialize(&self, _manager: &ModuleManager) -> ModuleResult<()> {
        info!(pid = std::process::id(), "Runtime module ready");
        Ok(())
    }
}

/// Greets callers, addressing them from the runtime it depends on.
pub struct GreeterModule;

impl Module for GreeterModule {
    fn metadata(&self, components: &mut ComponentCollection) -> ModuleResult<ModuleInfo> {
        components.register(
            ComponentInfo::new("greet", |args: Vec<Value>| async move {
                let mut args = args.into_iter();
                let pid = match args.next() {
                    Some(Value::Object(runtime)) => runtime.get("pid").await?,
                    _ => Value::Undefined,
                };
                let name = args
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "world".to_string());
                let pid = pid.as_f64().map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
                Ok::<_, TetherError>(Value::from(format!("Hello, {name}! (from pid {pid})")))
            })
            .with_deps(["runtime.info"]),
        )?;
        Ok(ModuleInfo::new("greeter", env!("CARGO_PKG_VERSION"))
            .with_dependency("runtime", env!("CARGO_PKG_VERSION")))
    }
}

/// Names of the built-in modules.
pub fn names() -> &'static [&'static str] {
    &["runtime", "greeter"]
}

/// `name` together with the modules it needs, dependencies first.
pub fn with_dependencies(name: &str) -> Option<Vec<Arc<dyn Module>>> {
    let runtime: Arc<dyn Module> = Arc::new(RuntimeModule);
    match name {
        "runtime" => Some(vec![runtime]),
        "greeter" => Some(vec![runtime, Arc::new(GreeterModule)]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_modules::Communication;
    use tether_remote::ObjectRemotingProxy;
    use tether_types::config::CommunicatorOptions;
    use tether_wire::{Communicator, MemoryChannel};

    fn manager() -> (ModuleManager, ObjectRemotingProxy) {
        let (a, b) = MemoryChannel::pair();
        let manager = ModuleManager::new(Communication::Communicator(
            Communicator::new(a, CommunicatorOptions::default()).unwrap(),
        ))
        .unwrap();
        let peer = ObjectRemotingProxy::new(Communicator::new(b, CommunicatorOptions::default()).unwrap()).unwrap();
        (manager, peer)
    }

    #[test]
    fn test_lookup() {
        for name in names() {
            assert!(with_dependencies(name).is_some());
        }
        assert_eq!(with_dependencies("greeter").map(|m| m.len()), Some(2));
        assert!(with_dependencies("nope").is_none());
    }

    #[tokio::test]
    async fn test_greeter_uses_runtime() {
        let (manager, _peer) = manager();
        manager
            .load_modules(with_dependencies("greeter").unwrap())
            .await
            .unwrap();

        let greeting = manager
            .get_component("greeter.greet", vec![Value::from("tether")])
            .await
            .unwrap()
            .unwrap();
        let expected = format!("Hello, tether! (from pid {})", std::process::id());
        assert_eq!(greeting, Value::from(expected));

        let echoed = manager
            .get_component("runtime.echo", vec![Value::from(1), Value::from(2)])
            .await
            .unwrap();
        assert_eq!(echoed, Some(Value::Array(vec![Value::from(1), Value::from(2)])));
    }
}
