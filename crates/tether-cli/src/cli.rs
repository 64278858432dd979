//! Clap CLI definitions for Tether.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tether host --module runtime            Host the runtime module and print connection info
  tether host --spawn greeter             Host and start a child process running `greeter`
  tether request --connection-info '<json>' runtime.echo '\"hi\"'
  tether modules                          List built-in modules";

/// Tether: cross-process module host.
#[derive(Parser)]
#[command(name = "tether", version, about = "Cross-process module host", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a host, load modules into it and wait for peers.
    Host {
        /// Listen on a TCP address instead of a local socket.
        #[arg(long)]
        listen: Option<String>,
        /// Built-in module to load into the host (repeatable).
        #[arg(long = "module")]
        modules: Vec<String>,
        /// Built-in module to run in a child process (repeatable).
        #[arg(long = "spawn")]
        spawns: Vec<String>,
    },
    /// Run a module in a process connected to a host.
    Child {
        /// JSON connection info of the host.
        #[arg(long = "connection-info")]
        connection_info: String,
        /// Built-in module to load.
        #[arg(long = "module-path")]
        module_path: String,
    },
    /// Resolve a component through a host and print the result.
    Request {
        /// JSON connection info of the host.
        #[arg(long = "connection-info")]
        connection_info: String,
        /// Component id, `<namespace>.<name>`.
        component: String,
        /// Extra arguments as JSON (plain text is sent as a string).
        args: Vec<String>,
        /// Call the resolved function with no arguments.
        #[arg(long)]
        call: bool,
    },
    /// List built-in modules.
    Modules,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_args_match_bootstrap_contract() {
        let cli = Cli::try_parse_from([
            "tether",
            "child",
            tether_modules::bootstrap::CONNECTION_INFO_ARG,
            "{}",
            tether_modules::bootstrap::MODULE_PATH_ARG,
            "runtime",
        ])
        .unwrap();
        match cli.command {
            Commands::Child {
                connection_info,
                module_path,
            } => {
                assert_eq!(connection_info, "{}");
                assert_eq!(module_path, "runtime");
            }
            _ => panic!("expected child"),
        }
    }

    #[test]
    fn test_host_flags() {
        let cli = Cli::try_parse_from([
            "tether", "host", "--module", "runtime", "--spawn", "greeter", "--spawn", "runtime",
            "--config", "/tmp/t.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        match cli.command {
            Commands::Host {
                listen,
                modules,
                spawns,
            } => {
                assert!(listen.is_none());
                assert_eq!(modules, vec!["runtime"]);
                assert_eq!(spawns, vec!["greeter", "runtime"]);
            }
            _ => panic!("expected host"),
        }
    }
}
