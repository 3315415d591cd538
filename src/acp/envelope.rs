//! JSON-RPC 2.0 envelopes.
//!
//! Every line on an ACP stream is exactly one [`Envelope`]. The wire struct is
//! kept loose so that unknown fields survive a relay, and
//! [`Envelope::into_message`] classifies it into the strict [`Message`] sum
//! type consumed by the state machines.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Protocol version string carried in the `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method not found.
pub const METHOD_NOT_FOUND: i64 = -32_601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32_602;
/// Internal agent error.
pub const INTERNAL_ERROR: i64 = -32_603;
/// `session/load` issued for a session that is still active.
pub const SESSION_ALREADY_ACTIVE: i64 = -32_002;

/// Request identifier.
///
/// Numbers and strings are distinct: `1` never correlates with `"1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    Str(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error object without `data`.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// One JSON-RPC message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Always `"2.0"`.
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Correlation id; absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name for requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Strictly classified envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request expecting exactly one response with the same id.
    Request {
        /// Correlation id.
        id: RequestId,
        /// Method name.
        method: String,
        /// Parameters (`Null` when absent).
        params: Value,
    },
    /// A fire-and-forget notification.
    Notification {
        /// Method name.
        method: String,
        /// Parameters (`Null` when absent).
        params: Value,
    },
    /// A response to an earlier request.
    Response {
        /// Id echoed from the request.
        id: RequestId,
        /// `Ok(result)` or the peer's error object.
        outcome: std::result::Result<Value, RpcError>,
    },
}

impl Envelope {
    /// Build a request envelope.
    #[must_use]
    pub fn request(id: RequestId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification envelope (never carries an id).
    #[must_use]
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: None,
            method: Some(method.to_owned()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a success response echoing `id`.
    #[must_use]
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing `id`.
    #[must_use]
    pub fn error_response(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// Parse one line into an envelope and check its shape.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Parse`] when the line is not JSON, is not an
    /// object of the envelope shape, or mixes `method` with `result`/`error`.
    pub fn parse(line: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(line.trim())
            .map_err(|e| AppError::Parse(format!("malformed json: {e}")))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Serialise to a single compact line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Parse`] if serialisation fails (not expected for
    /// well-formed values).
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `true` when the envelope carries a `method` and no `id`.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// Classify into a [`Message`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Parse`] for envelopes that fail [`Self::parse`]'s
    /// shape rules.
    pub fn into_message(self) -> Result<Message> {
        self.validate()?;
        let params = self.params.unwrap_or(Value::Null);
        match (self.id, self.method) {
            (Some(id), Some(method)) => Ok(Message::Request { id, method, params }),
            (None, Some(method)) => Ok(Message::Notification { method, params }),
            (Some(id), None) => {
                let outcome = match self.error {
                    Some(error) => Err(error),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, outcome })
            }
            (None, None) => Err(AppError::Parse("envelope has neither id nor method".into())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(AppError::Parse(format!(
                "unsupported jsonrpc version '{}'",
                self.jsonrpc
            )));
        }
        if self.method.is_some() && (self.result.is_some() || self.error.is_some()) {
            return Err(AppError::Parse(
                "envelope carries both method and result/error".into(),
            ));
        }
        if self.result.is_some() && self.error.is_some() {
            return Err(AppError::Parse(
                "envelope carries both result and error".into(),
            ));
        }
        if self.method.is_none() && self.id.is_none() {
            return Err(AppError::Parse("envelope has neither id nor method".into()));
        }
        Ok(())
    }
}
