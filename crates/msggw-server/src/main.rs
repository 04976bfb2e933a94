//! msggw-server: message gateway connection layer.
//!
//! Accepts WebSocket connections authenticated by token and raw TCP
//! connections, and hands each one to a client agent as a long connection.

mod agent;
mod config;
mod handshake;
mod limit;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::GatewayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// msggw-server: message gateway
#[derive(Parser, Debug)]
#[command(name = "msggw-server", version, about = "Message gateway connection server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.msggw/config.toml")]
    config: String,

    /// WebSocket listen port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Raw TCP listen port (0 disables)
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Maximum concurrent WebSocket connections (0 = unlimited)
    #[arg(long)]
    max_conn_num: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting msggw-server");

    let overrides = CliOverrides {
        ws_port: cli.ws_port,
        tcp_port: cli.tcp_port,
        max_conn_num: cli.max_conn_num,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match GatewayServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.close();
    info!("msggw-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
