//! Tether CLI: host modules, run them in child processes, and query them.

mod cli;
mod cmd;
mod config;
mod modules;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing_stderr(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    // Logging level comes from the same config file the command will load.
    let level = config::load_config(cli.config.as_deref()).log_level;
    init_tracing_stderr(&level);

    match cli.command {
        Commands::Host {
            listen,
            modules,
            spawns,
        } => cmd::host::cmd_host(cli.config, listen, modules, spawns),
        Commands::Child {
            connection_info,
            module_path,
        } => cmd::child::cmd_child(cli.config, connection_info, module_path),
        Commands::Request {
            connection_info,
            component,
            args,
            call,
        } => cmd::request::cmd_request(cli.config, connection_info, component, args, call),
        Commands::Modules => {
            for name in modules::names() {
                println!("{name}");
            }
        }
    }
}
