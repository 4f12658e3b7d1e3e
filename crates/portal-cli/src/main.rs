//! Portal CLI: run a frontend or an outlet.
//!
//! `portal frontend` serves `/ws_in` for clients and `/ws_out` for the outlet.
//! `portal outlet` connects to a frontend and dials destinations on behalf of
//! its clients.

mod cli;
mod config;

use crate::cli::{Cli, Commands};
use clap::Parser;
use portal_bridge::{FrontendServer, Outlet, PortalConfig};
use std::process::ExitCode;
use tracing::{error, info};

fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing_stderr(cli.json_logs);

    let mut config = config::effective_config(cli.config.as_deref());

    match cli.command {
        Commands::Frontend { listen, port } => {
            if let Some(listen) = listen {
                config.frontend.listen_addr = listen;
            }
            if let Some(port) = port {
                config.frontend.set_port(port);
            }
            run_frontend(config).await
        }
        Commands::Outlet {
            agent_url,
            default_dest,
            force_default_dest,
        } => {
            if let Some(url) = agent_url {
                config.outlet.agent_url = url;
            }
            if let Some(dest) = default_dest {
                config.outlet.default_dest = dest;
            }
            if force_default_dest {
                config.outlet.force_default_dest = true;
            }
            run_outlet(config).await
        }
        Commands::Config => match config::render(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Failed to render configuration");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_frontend(config: PortalConfig) -> ExitCode {
    let (server, mut handle) = match FrontendServer::start(&config).await {
        Ok(started) => started,
        Err(e) => {
            error!(addr = %config.frontend.listen_addr, error = %e, "Failed to start frontend");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down frontend");
            server.shutdown();
            let _ = handle.await;
        }
        _ = &mut handle => {}
    }
    ExitCode::SUCCESS
}

async fn run_outlet(config: PortalConfig) -> ExitCode {
    if config.outlet.default_dest.is_empty() && config.outlet.force_default_dest {
        error!("--force-default-dest needs a default destination");
        return ExitCode::FAILURE;
    }

    let (outlet, mut handle) = Outlet::start(config);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down outlet");
            outlet.shutdown();
            let _ = handle.await;
        }
        _ = &mut handle => {}
    }
    ExitCode::SUCCESS
}
