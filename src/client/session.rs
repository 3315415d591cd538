//! Client side of one ACP connection.
//!
//! [`ClientSession`] interprets every inbound envelope:
//!
//! - responses resolve their correlation waiter (unknown ids are logged);
//! - `session/update` notifications are folded into the [`Conversation`];
//! - `session/request_permission` requests register a continuation in the
//!   [`CorrelationTable`] and surface a [`PermissionRequest`] to the UI.
//!
//! Outbound requests (`initialize`, `session/new`, `session/load`,
//! `session/prompt`) are awaited through the same table. All state lives
//! behind `std::sync::Mutex`es that are never held across `.await`.
//!
//! Lock order: the conversation lock is taken before the correlation table
//! whenever both are touched, so the pending-permission view and the
//! correlation entries change in one critical section.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::correlation::CorrelationTable;
use crate::acp::envelope::{
    Envelope, Message, RequestId, RpcError, INVALID_PARAMS, METHOD_NOT_FOUND,
    SESSION_ALREADY_ACTIVE,
};
use crate::acp::reader::run_reader;
use crate::acp::types::{
    methods, CancelParams, ContentBlock, Implementation, InitializeParams, InitializeResponse,
    LoadSessionParams, NewSessionParams, NewSessionResponse, PermissionOutcome, PromptParams,
    PromptResponse, RequestPermissionParams, RequestPermissionResponse, SessionNotification,
    StopReason, PROTOCOL_VERSION,
};
use crate::acp::writer::run_writer;
use crate::client::conversation::{Conversation, PermissionRequest};
use crate::{AppError, Result};

/// Frames buffered between the reader task and the dispatcher.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Abandons an outbound waiter if the awaiting future is dropped.
struct ForgetOnDrop<'a> {
    table: &'a CorrelationTable,
    id: Option<RequestId>,
}

impl ForgetOnDrop<'_> {
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.table.forget(&id);
        }
    }
}

/// Clears the prompting flag if the awaiting prompt future is dropped.
struct FinishTurnOnDrop<'a> {
    conversation: &'a Mutex<Conversation>,
    armed: bool,
}

impl FinishTurnOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinishTurnOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conversation
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finish_turn(None);
        }
    }
}

/// Client-side protocol state for one connection.
#[derive(Debug)]
pub struct ClientSession {
    conversation: Mutex<Conversation>,
    correlation: CorrelationTable,
    outbound: mpsc::UnboundedSender<String>,
    session_id: Mutex<Option<String>>,
}

impl ClientSession {
    /// Create a session writing outbound lines to `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            conversation: Mutex::new(Conversation::new()),
            correlation: CorrelationTable::new(),
            outbound,
            session_id: Mutex::new(None),
        }
    }

    fn conversation_lock(&self) -> MutexGuard<'_, Conversation> {
        self.conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the conversation view.
    pub fn with_conversation<T>(&self, f: impl FnOnce(&mut Conversation) -> T) -> T {
        f(&mut self.conversation_lock())
    }

    /// Subscribe to conversation change notifications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.conversation_lock().subscribe()
    }

    /// Id of the current session, once created or loaded.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, id: String) {
        *self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    fn require_session(&self) -> Result<String> {
        self.session_id()
            .ok_or_else(|| AppError::NotFound("no active session".into()))
    }

    /// The underlying correlation table.
    #[must_use]
    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let line = envelope.to_line()?;
        self.outbound
            .send(line)
            .map_err(|_| AppError::TransportClosed("outbound channel closed".into()))
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Interpret one inbound envelope. Never fails: anomalies are logged.
    pub fn handle_envelope(&self, envelope: Envelope) {
        let message = match envelope.into_message() {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "client: dropping malformed envelope");
                return;
            }
        };

        match message {
            Message::Response { id, outcome } => {
                if let Err(err) = self.correlation.resolve_response(&id, outcome) {
                    warn!(error = %err, "client: unmatched response");
                }
            }
            Message::Notification { method, params } if method == methods::SESSION_UPDATE => {
                self.handle_session_update(params);
            }
            Message::Notification { method, .. } => {
                debug!(method, "client: ignoring notification");
            }
            Message::Request { id, method, params }
                if method == methods::SESSION_REQUEST_PERMISSION =>
            {
                self.handle_permission_request(id, params);
            }
            Message::Request { id, method, .. } => {
                debug!(method, %id, "client: unsupported agent request");
                self.respond_error(id, RpcError::new(METHOD_NOT_FOUND, format!("method not found: {method}")));
            }
        }
    }

    fn respond_error(&self, id: RequestId, error: RpcError) {
        if let Err(err) = self.send_envelope(&Envelope::error_response(id, error)) {
            warn!(error = %err, "client: failed to send error response");
        }
    }

    fn handle_session_update(&self, params: Value) {
        let notification: SessionNotification = match serde_json::from_value(params) {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "client: malformed session/update dropped");
                return;
            }
        };
        self.conversation_lock().apply_update(notification.update);
    }

    fn handle_permission_request(&self, id: RequestId, params: Value) {
        let params: RequestPermissionParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(err) => {
                warn!(%id, error = %err, "client: malformed permission request");
                self.respond_error(id, RpcError::new(INVALID_PARAMS, err.to_string()));
                return;
            }
        };

        let outbound = self.outbound.clone();
        let response_id = id.clone();
        let respond = Box::new(move |outcome: PermissionOutcome| {
            let result = serde_json::to_value(RequestPermissionResponse { outcome })
                .unwrap_or(Value::Null);
            match Envelope::response(response_id.clone(), result).to_line() {
                Ok(line) => {
                    if outbound.send(line).is_err() {
                        debug!(request_id = %response_id, "client: permission answered after close");
                    }
                }
                Err(err) => warn!(error = %err, "client: failed to encode permission response"),
            }
        });

        let request = PermissionRequest {
            request_id: id.clone(),
            tool_call_id: params.tool_call_id.clone(),
            title: params.title.clone(),
            options: params.options.clone(),
        };

        let mut conversation = self.conversation_lock();
        if let Err(err) = self.correlation.register_permission(id, params, respond) {
            warn!(error = %err, "client: permission request rejected");
            return;
        }
        info!(request_id = %request.request_id, tool_call_id = %request.tool_call_id, "client: permission requested");
        conversation.track_permission(request);
    }

    // ── Outbound requests ────────────────────────────────────────────────────

    /// Send a request and await its correlated response.
    ///
    /// Dropping the returned future abandons the waiter.
    ///
    /// # Errors
    ///
    /// - [`AppError::TransportClosed`] if the connection is gone.
    /// - [`AppError::Rpc`] if the agent answered with an error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.correlation.next_id();
        let waiter = self.correlation.register_request(id.clone())?;
        let mut guard = ForgetOnDrop {
            table: &self.correlation,
            id: Some(id.clone()),
        };

        debug!(%id, method, "client: sending request");
        self.send_envelope(&Envelope::request(id, method, params))?;
        let result = waiter.wait().await;
        guard.disarm();
        result
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R> {
        let value = self.request(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn initialize(&self, client_info: Implementation) -> Result<InitializeResponse> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: json!({}),
            client_info: Some(client_info),
        };
        let response: InitializeResponse = self.call(methods::INITIALIZE, &params).await?;
        info!(agent = %response.agent_info.name, version = %response.agent_info.version, "client: initialized");
        Ok(response)
    }

    /// Create a session bound to `cwd`.
    ///
    /// # Errors
    ///
    /// Propagates transport and protocol errors.
    pub async fn new_session(&self, cwd: &str, mcp_servers: Vec<Value>) -> Result<String> {
        let params = NewSessionParams {
            cwd: cwd.to_owned(),
            mcp_servers,
        };
        let response: NewSessionResponse = self.call(methods::SESSION_NEW, &params).await?;
        info!(session_id = %response.session_id, "client: session created");
        self.set_session_id(response.session_id.clone());
        Ok(response.session_id)
    }

    /// Re-open an existing session.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionAlreadyActive`] when the agent reports the
    ///   session as still loaded.
    /// - Other transport and protocol errors.
    pub async fn load_session(&self, session_id: &str, cwd: &str) -> Result<()> {
        let params = LoadSessionParams {
            session_id: session_id.to_owned(),
            cwd: cwd.to_owned(),
            mcp_servers: Vec::new(),
        };
        match self
            .request(methods::SESSION_LOAD, serde_json::to_value(&params)?)
            .await
        {
            Ok(_) => {
                self.set_session_id(session_id.to_owned());
                Ok(())
            }
            Err(AppError::Rpc { code, .. }) if code == SESSION_ALREADY_ACTIVE => {
                Err(AppError::SessionAlreadyActive(session_id.to_owned()))
            }
            Err(err) => Err(err),
        }
    }

    /// Send one prompt turn and wait for its stop reason.
    ///
    /// The text is recorded as a user message and the conversation is marked
    /// as prompting until the response (or an error) arrives, or until the
    /// returned future is dropped.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] if no session exists yet.
    /// - Transport and protocol errors.
    pub async fn prompt(&self, text: &str) -> Result<StopReason> {
        let session_id = self.require_session()?;
        let params = PromptParams {
            session_id,
            prompt: vec![ContentBlock::text(text)],
        };

        {
            let mut conversation = self.conversation_lock();
            conversation.add_user_message(text);
            conversation.begin_turn();
        }

        let mut turn = FinishTurnOnDrop {
            conversation: &self.conversation,
            armed: true,
        };
        let result: Result<PromptResponse> = self.call(methods::SESSION_PROMPT, &params).await;
        turn.disarm();
        let stop_reason = result.as_ref().ok().map(|r| r.stop_reason);
        self.conversation_lock().finish_turn(stop_reason);
        debug!(?stop_reason, "client: turn finished");
        result.map(|r| r.stop_reason)
    }

    /// Ask the agent to stop the current turn.
    ///
    /// Fire-and-forget; pending permission requests are answered
    /// `cancelled` first.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] if no session exists yet.
    /// - [`AppError::TransportClosed`] if the connection is gone.
    pub fn cancel(&self) -> Result<()> {
        let session_id = self.require_session()?;
        self.cancel_all_permissions();
        let params = serde_json::to_value(CancelParams { session_id })?;
        self.send_envelope(&Envelope::notification(methods::SESSION_CANCEL, params))
    }

    // ── Permissions ──────────────────────────────────────────────────────────

    /// Answer a pending permission request with `option_id`.
    ///
    /// Returns `false` if the request was already resolved or the option is
    /// not one it offered.
    pub fn select_permission(&self, request_id: &RequestId, option_id: &str) -> bool {
        let mut conversation = self.conversation_lock();
        let Some(params) = self.correlation.permission_params(request_id) else {
            debug!(%request_id, "client: selection for resolved permission ignored");
            return false;
        };
        if !params.options.iter().any(|o| o.option_id == option_id) {
            warn!(%request_id, option_id, "client: unknown permission option");
            return false;
        }

        let outcome = PermissionOutcome::Selected {
            option_id: option_id.to_owned(),
        };
        if !self
            .correlation
            .resolve_permission(request_id, outcome.clone())
        {
            return false;
        }
        conversation.resolve_permission(request_id, outcome);
        true
    }

    /// Answer every pending permission request with `cancelled`.
    ///
    /// Returns the ids this call resolved; a second call returns none.
    pub fn cancel_all_permissions(&self) -> Vec<RequestId> {
        let mut conversation = self.conversation_lock();
        let ids = self.correlation.cancel_all();
        if !ids.is_empty() {
            for id in &ids {
                conversation.resolve_permission(id, PermissionOutcome::Cancelled);
            }
            info!(count = ids.len(), "client: pending permissions cancelled");
        }
        ids
    }

    /// The connection ended: fail outstanding requests and cancel pending
    /// permission requests.
    pub fn close(&self) {
        self.correlation.fail_all_waiters();
        self.cancel_all_permissions();
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// A [`ClientSession`] wired to a byte stream by reader and writer tasks.
#[derive(Debug)]
pub struct ClientConnection {
    session: Arc<ClientSession>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Start reader and writer tasks over `stream` (agent → client) and
    /// `sink` (client → agent).
    pub fn connect<R, W>(stream: R, sink: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new(line_tx));

        let writer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(err) = run_writer("client-out".into(), sink, line_rx, cancel).await {
                    debug!(error = %err, "client: writer stopped");
                }
            }
        });

        let reader = tokio::spawn({
            let cancel = cancel.clone();
            let session = Arc::clone(&session);
            async move {
                let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
                let read = run_reader("client-in".into(), stream, frame_tx, cancel);
                let dispatch = async {
                    while let Some(frame) = frame_rx.recv().await {
                        session.handle_envelope(frame.envelope);
                    }
                };
                let (end, ()) = tokio::join!(read, dispatch);
                debug!(reason = %end.reason(), "client: inbound stream ended");
                session.close();
            }
        });

        Self {
            session,
            cancel,
            reader,
            writer,
        }
    }

    /// The protocol session.
    #[must_use]
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Stop both tasks and fail anything still pending.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}
