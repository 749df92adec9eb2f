//! PocketPing Server
//!
//! Live chat between website visitors and operators on Telegram, Discord
//! and Slack. Widgets talk REST plus WebSocket or SSE; bridges receive
//! fan-out notifications and post operator replies back.

mod auth;
mod config;
mod http;
mod logging;
mod paths;
mod sse;
mod state;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pocketping_bridge_core::HttpBridge;
use pocketping_core::{ChatService, MemoryStore, WebhookForwarder};
use tracing::{error, info, warn};

use crate::config::FileConfig;
use crate::state::AppState;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "pocketping", author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "POCKETPING_BIND", default_value = "127.0.0.1:3001")]
    bind: SocketAddr,

    /// TOML config file (defaults to <data-dir>/config.toml when present)
    #[arg(long, env = "POCKETPING_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for logs and config
    #[arg(long, env = "POCKETPING_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Require `Authorization: Bearer <token>` on operator routes
    #[arg(long, env = "POCKETPING_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Mirror logs to stderr
    #[arg(long)]
    log_stdout: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs().context("failed to create data directory")?;
    let logging = logging::init_logging(cli.log_stdout)?;

    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (paths::default_config_path(), false),
    };
    let config = FileConfig::load(&config_path, required)?;

    let mut service = ChatService::new(config.service_config(), Arc::new(MemoryStore::new()));
    if let Some(webhook) = &config.webhook {
        service = service.with_webhook(WebhookForwarder::new(webhook)?);
    }
    let service = Arc::new(service);

    for entry in &config.bridges {
        let bridge = HttpBridge::new(entry.to_bridge_config())
            .with_context(|| format!("invalid bridge {}", entry.name))?;
        if let Err(e) = service.add_bridge(Arc::new(bridge)).await {
            // One broken bridge must not keep the others down.
            warn!(
                component = "server",
                event = "bridge.init_failed",
                bridge = %entry.name,
                error = %e,
                "Bridge failed to initialize, skipping"
            );
        }
    }

    let retention = config
        .retention()
        .map(|max_age| tokio::spawn(run_retention(service.clone(), max_age)));

    let state = AppState::new(service.clone(), logging.run_id.clone());
    let app = http::router(state, cli.auth_token.clone());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %cli.bind,
        bridges = ?service.bridge_names(),
        auth = cli.auth_token.is_some(),
        "PocketPing server listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(task) = retention {
        task.abort();
    }
    service.shutdown().await;
    info!(
        component = "server",
        event = "server.stopped",
        "PocketPing server stopped"
    );
    Ok(())
}

async fn run_retention(service: Arc<ChatService>, max_age: chrono::Duration) {
    let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let cutoff = chrono::Utc::now() - max_age;
        if let Err(e) = service.cleanup_old_sessions(cutoff).await {
            error!(
                component = "retention",
                event = "retention.sweep_failed",
                error = %e,
                "Retention sweep failed"
            );
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(component = "server", event = "signal.ctrl_c_failed", error = %e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(component = "server", event = "signal.sigterm_failed", error = %e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown signal received, draining"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["pocketping"]).unwrap();
        assert_eq!(cli.bind.to_string(), "127.0.0.1:3001");
        assert!(cli.config.is_none());
        assert!(!cli.log_stdout);
    }

    #[test]
    fn cli_accepts_flags() {
        let cli = Cli::try_parse_from([
            "pocketping",
            "--bind",
            "0.0.0.0:8080",
            "--auth-token",
            "t0k",
            "--log-stdout",
        ])
        .unwrap();
        assert_eq!(cli.bind.port(), 8080);
        assert_eq!(cli.auth_token.as_deref(), Some("t0k"));
        assert!(cli.log_stdout);
    }
}
