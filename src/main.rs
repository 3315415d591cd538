#![forbid(unsafe_code)]

//! `uplink` — ACP bridge server binary.
//!
//! Bootstraps configuration, binds the HTTP listener and serves the session
//! bootstrap and WebSocket endpoints until a shutdown signal arrives.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use uplink::config::GlobalConfig;
use uplink::server::token::TokenStore;
use uplink::server::{self, AppState};
use uplink::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "uplink", about = "Browser bridge for ACP agents", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the agent working directory.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("uplink server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::with_defaults()?,
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(cwd) = &args.cwd {
        config.set_cwd(cwd)?;
    }

    let spawn = config.spawn_config();
    info!(
        command = %spawn.command,
        args = ?spawn.args,
        cwd = %spawn.cwd.display(),
        "configuration loaded"
    );

    // ── Bind and serve ──────────────────────────────────
    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;

    let state = AppState::new(spawn, TokenStore::new(config.token_ttl()));
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    let server_handle = tokio::spawn(async move { server::serve(listener, state, server_ct).await });

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    server_handle
        .await
        .map_err(|err| AppError::Io(format!("server task failed: {err}")))??;
    info!("uplink shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
