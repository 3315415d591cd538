//! HTTP surface: session bootstrap, the `/ws` duplex endpoint and health.
//!
//! | Route              | Purpose                                              |
//! |--------------------|------------------------------------------------------|
//! | `POST /api/session`| issue a single-use token bound to a working directory|
//! | `GET /ws?token=…`  | WebSocket relayed 1:1 to a fresh agent process       |
//! | `GET /health`      | liveness probe                                       |

pub mod token;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acp::spawner::SpawnConfig;
use crate::bridge::Bridge;
use crate::server::token::TokenStore;
use crate::{AppError, Result};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The single transport bridge.
    pub bridge: Bridge,
    /// Outstanding session tokens.
    pub tokens: Arc<TokenStore>,
    /// Spawn template; the working directory is replaced per token.
    pub spawn: Arc<SpawnConfig>,
}

impl AppState {
    /// Build state around a fresh idle bridge.
    #[must_use]
    pub fn new(spawn: SpawnConfig, tokens: TokenStore) -> Self {
        Self {
            bridge: Bridge::new(),
            tokens: Arc::new(tokens),
            spawn: Arc::new(spawn),
        }
    }
}

/// Optional body of `POST /api/session`.
#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    cwd: Option<PathBuf>,
}

/// Response of `POST /api/session`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// Token to present on `/ws`.
    pub token: String,
    /// Working directory the agent will run in.
    pub cwd: String,
}

async fn health() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<Json<CreateSessionResponse>, (StatusCode, String)> {
    let request: CreateSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| (StatusCode::BAD_REQUEST, format!("invalid body: {err}")))?
    };

    let cwd = match request.cwd {
        None => state.spawn.cwd.clone(),
        Some(dir) => tokio::fs::canonicalize(&dir)
            .await
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| {
                warn!(cwd = %dir.display(), "session requested for invalid directory");
                (
                    StatusCode::BAD_REQUEST,
                    format!("not a directory: {}", dir.display()),
                )
            })?,
    };

    let issued = state.tokens.issue(cwd);
    Ok(Json(CreateSessionResponse {
        token: issued.token,
        cwd: issued.cwd.display().to_string(),
    }))
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/session", post(create_session))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve `state` on `listener` until `ct` fires, then shut the bridge down.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails while running.
pub async fn serve(listener: TcpListener, state: AppState, ct: CancellationToken) -> Result<()> {
    let bridge = state.bridge.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "uplink listening");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    bridge.shutdown().await;
    info!("uplink shut down");
    Ok(())
}
