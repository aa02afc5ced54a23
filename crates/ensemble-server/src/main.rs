//! ensemble-server: real-time session relay.
//!
//! Producers stream motion telemetry over WebSocket; the relay tags each frame
//! with the sender's identity and forwards it to the instance's aggregator.
//! A small HTTP API creates instances and admits producer sessions.

mod api;
mod auth;
mod config;
mod relay;
mod server;
mod state;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use ensemble_core::TelemetrySchema;
use relay::AggregatorPolicy;
use server::EnsembleServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// ensemble-server: real-time session relay
#[derive(Parser, Debug)]
#[command(name = "ensemble-server", version, about = "Real-time session relay")]
struct Cli {
    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP API listen port
    #[arg(long)]
    http_port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.ensemble/config.toml")]
    config: String,

    /// Telemetry payload schema (v1, v2)
    #[arg(long)]
    schema: Option<TelemetrySchema>,

    /// What to do when an aggregator leaves (keep-alive, tear-down)
    #[arg(long)]
    policy: Option<AggregatorPolicy>,

    /// Let producers connect without an approved admission session
    #[arg(long)]
    no_approval: bool,

    /// Shared staff secret
    #[arg(long, env = "ENSEMBLE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ensemble-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        http_port: cli.http_port,
        telemetry_schema: cli.schema,
        aggregator_policy: cli.policy,
        no_approval: cli.no_approval,
        shared_secret: cli.secret,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    if server_config.shared_secret.is_none() {
        info!("no shared secret configured, every client is treated as staff");
    }

    let server = EnsembleServer::new(server_config);

    // Run until shutdown signal
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

    info!("ensemble-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
