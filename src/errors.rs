//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Only [`AppError::Spawn`] and [`AppError::TransportClosed`] are fatal to a
/// client connection. Every protocol-shape anomaly is recovered locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The external agent process could not be started.
    Spawn(String),
    /// The agent process exited or its stream failed.
    TransportClosed(String),
    /// A line could not be parsed as a protocol envelope.
    Parse(String),
    /// A response or duplicate id arrived with no matching waiter.
    UnknownCorrelation(String),
    /// `session/load` was issued for a session that is still active.
    SessionAlreadyActive(String),
    /// Missing, unknown, or already consumed session token.
    Unauthorized(String),
    /// The peer answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::TransportClosed(msg) => write!(f, "transport closed: {msg}"),
            Self::Parse(msg) => write!(f, "parse: {msg}"),
            Self::UnknownCorrelation(msg) => write!(f, "unknown correlation: {msg}"),
            Self::SessionAlreadyActive(id) => write!(f, "session {id} is already loaded"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
