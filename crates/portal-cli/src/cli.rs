//! Clap CLI definitions for Portal.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  portal frontend --port 8000                  Serve /ws_in and /ws_out
  portal outlet --agent-url ws://host:8000/ws_out --default-dest ws://127.0.0.1:3000/
  portal config                                Print the effective configuration";

/// Portal: reach sockets behind NAT through a public frontend.
#[derive(Parser)]
#[command(name = "portal", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.portal/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the public frontend server.
    Frontend {
        /// Full listen address, e.g. 0.0.0.0:8000.
        #[arg(long)]
        listen: Option<String>,
        /// Listen port, keeping the configured host.
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Run an outlet that attaches to a frontend.
    Outlet {
        /// Frontend /ws_out URL.
        #[arg(long)]
        agent_url: Option<String>,
        /// Destination for clients that ask for none.
        #[arg(long)]
        default_dest: Option<String>,
        /// Ignore client destinations and always dial the default.
        #[arg(long)]
        force_default_dest: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}
