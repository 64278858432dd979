//! Command implementations.

pub mod child;
pub mod host;
pub mod request;

use std::future::Future;

/// Run `future` on a fresh multi-threaded runtime, exiting on error.
pub(crate) fn run<F, E>(future: F)
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(future) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Parse a command-line value as JSON, falling back to a plain string.
pub(crate) fn parse_arg(raw: &str) -> tether_remote::Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(tether_remote::Value::from)
        .unwrap_or_else(|_| tether_remote::Value::from(raw))
}
