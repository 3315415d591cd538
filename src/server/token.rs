//! Single-use session tokens.
//!
//! `POST /api/session` issues a token bound to a working directory; the
//! WebSocket upgrade must present it exactly once before it expires.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::{AppError, Result};

/// A token as handed out by the bootstrap endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    /// Opaque token value.
    pub token: String,
    /// Working directory the agent process will run in.
    pub cwd: PathBuf,
    /// Issue time.
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
}

/// In-memory token registry.
#[derive(Debug)]
pub struct TokenStore {
    ttl: TimeDelta,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl TokenStore {
    /// Create a store whose tokens expire `ttl` after issue.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, IssuedToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, token: &IssuedToken, now: DateTime<Utc>) -> bool {
        now - token.issued_at >= self.ttl
    }

    /// Issue a fresh token bound to `cwd`.
    ///
    /// Expired tokens are purged on every issue.
    pub fn issue(&self, cwd: PathBuf) -> IssuedToken {
        let now = Utc::now();
        let issued = IssuedToken {
            token: Uuid::new_v4().simple().to_string(),
            cwd,
            issued_at: now,
        };
        let mut tokens = self.lock();
        tokens.retain(|_, t| !self.is_expired(t, now));
        tokens.insert(issued.token.clone(), issued.clone());
        debug!(cwd = %issued.cwd.display(), outstanding = tokens.len(), "session token issued");
        issued
    }

    /// Redeem `token`, returning its working directory.
    ///
    /// The token is removed whether or not it was still valid.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unauthorized`] when the token is unknown, already
    /// consumed, or expired.
    pub fn consume(&self, token: &str) -> Result<PathBuf> {
        let Some(issued) = self.lock().remove(token) else {
            return Err(AppError::Unauthorized("unknown or already used token".into()));
        };
        if self.is_expired(&issued, Utc::now()) {
            return Err(AppError::Unauthorized("token expired".into()));
        }
        Ok(issued.cwd)
    }

    /// Number of outstanding (unconsumed) tokens, expired ones included.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }
}
