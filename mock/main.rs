#![forbid(unsafe_code)]

//! `uplink-mock-agent` — reference ACP agent over stdio.
//!
//! Speaks NDJSON JSON-RPC on stdin/stdout and drives the fixed protocol
//! scenarios (`simple`, `tool`, `permission`, `refuse`, `stream`, `/clear`).
//! Logs go to stderr; stdout carries protocol frames only.

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use uplink::agent::run_agent;
use uplink::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "uplink-mock-agent",
    about = "Deterministic ACP agent for testing",
    version,
    long_about = None
)]
struct Cli {
    /// Accepted for command-line compatibility with real agents.
    #[arg(long)]
    acp: bool,

    /// Accepted for command-line compatibility with real agents.
    #[arg(long)]
    stdio: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!(acp = args.acp, stdio = args.stdio, "mock agent starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run_agent(tokio::io::stdin(), tokio::io::stdout()))
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

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
