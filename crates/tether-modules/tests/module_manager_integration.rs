//! End-to-end tests for module managers talking through a host.
//!
//! A host manager accepts two client managers. Components registered by one
//! client are reachable from the other through the host, objects and
//! callbacks cross both hops, and local components stay private.
//!
//! Everything runs in-process over memory channels, except the last test
//! which uses a Unix socket.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tether_modules::{
    Communication, ComponentCollection, ComponentInfo, Module, ModuleInfo, ModuleManager,
    ModuleResult,
};
use tether_remote::{DynamicObject, Value};
use tether_types::config::CommunicatorOptions;
use tether_types::TetherError;
use tether_wire::{CommunicationHost, Communicator, MemoryChannelHost};

// ---------------------------------------------------------------------------
// Test modules
// ---------------------------------------------------------------------------

/// Registers a shared key/value store object.
struct StoreModule;

impl Module for StoreModule {
    fn metadata(&self, components: &mut ComponentCollection) -> ModuleResult<ModuleInfo> {
        components.register(
            ComponentInfo::new("store", |_args: Vec<Value>| async {
                let store = DynamicObject::new()
                    .with_property("owner", Value::from("host"))
                    .with_method(
                        "describe",
                        Value::function(|this: Value, _args: Vec<Value>| async move {
                            let owner = match this.as_object() {
                                Some(object) => object.get("owner").await?,
                                None => Value::Undefined,
                            };
                            Ok::<_, TetherError>(Value::from(format!(
                                "store owned by {}",
                                owner.as_str().unwrap_or("nobody")
                            )))
                        }),
                    );
                Ok::<_, TetherError>(Value::object(store))
            })
            .singleton(true),
        )?;
        Ok(ModuleInfo::new("store", "1.0.0"))
    }
}

/// Registers an adder, a callback runner and a private component.
struct CalcModule;

#[async_trait]
impl Module for CalcModule {
    fn metadata(&self, components: &mut ComponentCollection) -> ModuleResult<ModuleInfo> {
        components
            .register(ComponentInfo::value(
                "add",
                Value::function(|_this, args: Vec<Value>| async move {
                    let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
                    Ok::<_, TetherError>(Value::from(sum))
                }),
            ))?
            .register(ComponentInfo::new("twice", |args: Vec<Value>| async move {
                match args.into_iter().next() {
                    Some(Value::Function(callback)) => {
                        let once = callback.call(Value::Undefined, vec![]).await?;
                        let twice = callback.call(Value::Undefined, vec![]).await?;
                        Ok(Value::Array(vec![once, twice]))
                    }
                    _ => Err(TetherError::InvalidArgument("callback required".to_string())),
                }
            }))?
            .register(ComponentInfo::value("secret", Value::from("hidden")).local())?;
        Ok(ModuleInfo::new("calc", "1.0.0").with_dependency("store", "^1.0.0"))
    }

    async fn initialize(&self, manager: &ModuleManager) -> ModuleResult<()> {
        // The store lives in the host; it must be reachable by the time we start.
        let store = manager.get_component("store.store", vec![]).await?;
        if store.is_none() {
            return Err(TetherError::Internal("store unavailable".to_string()).into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn store() -> Arc<dyn Module> {
    Arc::new(StoreModule)
}

fn calc() -> Arc<dyn Module> {
    Arc::new(CalcModule)
}

struct Topology {
    host: ModuleManager,
    left: ModuleManager,
    right: ModuleManager,
}

fn client(channels: &MemoryChannelHost) -> ModuleManager {
    let channel = channels.connect().unwrap();
    let communicator = Communicator::new(channel, CommunicatorOptions::default()).unwrap();
    ModuleManager::new(Communication::Communicator(communicator)).unwrap()
}

async fn topology() -> Topology {
    let channels = MemoryChannelHost::new();
    let host = CommunicationHost::new(channels.clone(), CommunicatorOptions::default()).unwrap();
    let host = ModuleManager::new(Communication::Host(host)).unwrap();
    host.load_modules(vec![store()]).await.unwrap();

    let left = client(&channels);
    let right = client(&channels);
    Topology { host, left, right }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dependency_must_be_loaded_locally() {
    let t = topology().await;
    // `store` lives in the host only; module dependencies are checked
    // against this process.
    let err = t
        .left
        .load_modules(vec![calc()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("\"store\""), "{err}");

    t.left.load_modules(vec![store(), calc()]).await.unwrap();
    assert_eq!(t.left.loaded_modules().len(), 2);
}

#[tokio::test]
async fn test_component_forwarded_between_clients() {
    let t = topology().await;
    t.left
        .load_modules(vec![store(), calc()])
        .await
        .unwrap();

    let add = t
        .right
        .get_component("calc.add", vec![])
        .await
        .unwrap()
        .expect("forwarded through the host");
    let add = add.as_function().cloned().unwrap();
    let sum = add
        .call(Value::Undefined, vec![Value::from(2), Value::from(3.5)])
        .await
        .unwrap();
    assert_eq!(sum, Value::from(5.5));
}

#[tokio::test]
async fn test_callbacks_cross_two_hops() {
    let t = topology().await;
    t.left
        .load_modules(vec![store(), calc()])
        .await
        .unwrap();

    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let callback = Value::function(move |_this, _args| {
        let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        async move { Ok::<_, TetherError>(Value::from(n as f64)) }
    });

    let result = t
        .right
        .get_component("calc.twice", vec![callback])
        .await
        .unwrap();
    assert_eq!(
        result,
        Some(Value::Array(vec![Value::from(1), Value::from(2)]))
    );
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_host_objects_reach_clients() {
    let t = topology().await;
    let store = t
        .left
        .get_component("store.store", vec![])
        .await
        .unwrap()
        .unwrap();
    let store = store.as_object().cloned().unwrap();
    assert_eq!(
        store.invoke("describe", vec![]).await.unwrap(),
        Value::from("store owned by host")
    );

    store.set("owner", Value::from("left")).await.unwrap();
    let seen_by_right = t
        .right
        .get_component("store.store", vec![])
        .await
        .unwrap()
        .unwrap();
    let seen_by_right = seen_by_right.as_object().cloned().unwrap();
    assert_eq!(seen_by_right.get("owner").await.unwrap(), Value::from("left"));
}

#[tokio::test]
async fn test_local_components_stay_private() {
    let t = topology().await;
    t.left
        .load_modules(vec![store(), calc()])
        .await
        .unwrap();

    assert_eq!(
        t.left.get_component("calc.secret", vec![]).await.unwrap(),
        Some(Value::from("hidden"))
    );
    assert_eq!(t.right.get_component("calc.secret", vec![]).await.unwrap(), None);
    assert_eq!(t.host.get_component("calc.secret", vec![]).await.unwrap(), None);
    assert_eq!(t.right.get_component("nobody.anything", vec![]).await.unwrap(), None);
}

#[tokio::test]
async fn test_client_leaving_is_forgotten() {
    let t = topology().await;
    t.left
        .load_modules(vec![store(), calc()])
        .await
        .unwrap();
    assert!(t.host.get_component("calc.add", vec![]).await.unwrap().is_some());

    t.left.dispose().await;
    let mut gone = false;
    for _ in 0..100 {
        if matches!(t.host.get_component("calc.add", vec![]).await, Ok(None)) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone);
    assert!(t.right.get_component("store.store", vec![]).await.unwrap().is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn test_over_unix_socket() {
    use tether_wire::{ipc, ChannelInitializers};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tether.sock");
    let channels = ipc::host_at(&path).unwrap();
    let host = CommunicationHost::new(channels, CommunicatorOptions::default()).unwrap();
    let host = ModuleManager::new(Communication::Host(host)).unwrap();
    host.load_modules(vec![store()]).await.unwrap();

    let info = host.connection_info().unwrap();
    assert_eq!(info.init_function, "ipc.connect");

    let client = ModuleManager::connect(
        info,
        &ChannelInitializers::with_defaults(),
        tether_types::config::DEFAULT_PROXY_PATH,
    )
    .await
    .unwrap();
    let store = client.get_component("store.store", vec![]).await.unwrap().unwrap();
    let store = store.as_object().cloned().unwrap();
    assert_eq!(
        store.invoke("describe", vec![]).await.unwrap(),
        Value::from("store owned by host")
    );

    client.dispose().await;
    host.dispose().await;
}
