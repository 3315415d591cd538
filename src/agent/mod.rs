//! Reference ACP agent.
//!
//! A deterministic counterpart for the bridge and the client state machine.
//! It implements the full verb set over any `AsyncRead`/`AsyncWrite` pair:
//!
//! | Method             | Behaviour                                                   |
//! |--------------------|-------------------------------------------------------------|
//! | `initialize`       | fixed capabilities and `mock-agent 0.1.0` identity          |
//! | `session/new`      | fresh `mock-session-<token>` id, becomes the active session |
//! | `session/load`     | fails for the active session, otherwise activates the id    |
//! | `session/prompt`   | runs the [`Scenario`] selected by the prompt text           |
//! | `session/cancel`   | cancels the running turn of that session                    |
//!
//! Each prompt runs on its own task. Every step first checks the turn's
//! [`CancellationToken`]; once cancellation is observed no further chunk is
//! emitted and the turn answers `cancelled`.

pub mod scenario;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acp::correlation::CorrelationTable;
use crate::acp::envelope::{
    Envelope, Message, RequestId, RpcError, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    SESSION_ALREADY_ACTIVE,
};
use crate::acp::reader::run_reader;
use crate::acp::types::{
    methods, AgentCapabilities, CancelParams, ContentBlock, Implementation, InitializeResponse,
    LoadSessionParams, NewSessionParams, NewSessionResponse, PermissionOption,
    PermissionOptionKind, PermissionOutcome, PromptCapabilities, PromptParams, PromptResponse,
    RequestPermissionParams, RequestPermissionResponse, SessionNotification, SessionUpdate,
    StopReason, ToolCall, ToolCallContent, ToolCallStatus, ToolCallUpdate, ToolKind,
    PROTOCOL_VERSION,
};
use crate::acp::writer::run_writer;
use crate::{AppError, Result};

pub use scenario::Scenario;

/// Agent name reported by `initialize`.
pub const AGENT_NAME: &str = "mock-agent";
/// Agent version reported by `initialize`.
pub const AGENT_VERSION: &str = "0.1.0";
/// Delay between scenario steps.
pub const STEP_DELAY: Duration = Duration::from_millis(20);

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Marker for a turn that observed cancellation.
#[derive(Debug)]
struct Cancelled;

type Step<T = ()> = std::result::Result<T, Cancelled>;

struct ActiveTurn {
    turn_id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct AgentState {
    active_session: Option<String>,
    turns: HashMap<String, ActiveTurn>,
}

/// Shared core of the reference agent.
pub struct MockAgent {
    outbound: mpsc::UnboundedSender<String>,
    requests: CorrelationTable,
    state: Mutex<AgentState>,
    next_turn: AtomicU64,
    next_tool_call: AtomicU64,
}

impl std::fmt::Debug for MockAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAgent")
            .field("active_session", &self.lock().active_session)
            .finish_non_exhaustive()
    }
}

impl MockAgent {
    /// Create an agent writing outbound lines to `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbound,
            requests: CorrelationTable::new(),
            state: Mutex::new(AgentState::default()),
            next_turn: AtomicU64::new(1),
            next_tool_call: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently active session id.
    #[must_use]
    pub fn active_session(&self) -> Option<String> {
        self.lock().active_session.clone()
    }

    fn send(&self, envelope: &Envelope) {
        match envelope.to_line() {
            Ok(line) => {
                if self.outbound.send(line).is_err() {
                    debug!("agent: outbound closed, dropping message");
                }
            }
            Err(err) => warn!(error = %err, "agent: failed to encode message"),
        }
    }

    fn respond<T: Serialize>(&self, id: RequestId, result: &T) {
        match serde_json::to_value(result) {
            Ok(value) => self.send(&Envelope::response(id, value)),
            Err(err) => self.send(&Envelope::error_response(
                id,
                RpcError::new(INTERNAL_ERROR, err.to_string()),
            )),
        }
    }

    fn respond_error(&self, id: RequestId, code: i64, message: impl Into<String>) {
        self.send(&Envelope::error_response(id, RpcError::new(code, message)));
    }

    fn parse_params<T: DeserializeOwned>(&self, id: &RequestId, params: Value) -> Option<T> {
        match serde_json::from_value(params) {
            Ok(p) => Some(p),
            Err(err) => {
                warn!(%id, error = %err, "agent: invalid params");
                self.respond_error(id.clone(), INVALID_PARAMS, format!("invalid params: {err}"));
                None
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Handle one inbound envelope.
    pub fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let message = match envelope.into_message() {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "agent: dropping malformed envelope");
                return;
            }
        };

        match message {
            Message::Response { id, outcome } => {
                if let Err(err) = self.requests.resolve_response(&id, outcome) {
                    warn!(error = %err, "agent: unmatched response");
                }
            }
            Message::Notification { method, params } => {
                if method == methods::SESSION_CANCEL {
                    self.handle_cancel(params);
                } else {
                    debug!(method, "agent: ignoring notification");
                }
            }
            Message::Request { id, method, params } => {
                debug!(%id, method, "agent: request");
                match method.as_str() {
                    methods::INITIALIZE => self.handle_initialize(id),
                    methods::SESSION_NEW => self.handle_new_session(id, params),
                    methods::SESSION_LOAD => self.handle_load_session(id, params),
                    methods::SESSION_PROMPT => self.handle_prompt(id, params),
                    _ => self.respond_error(id, METHOD_NOT_FOUND, format!("method not found: {method}")),
                }
            }
        }
    }

    fn handle_initialize(&self, id: RequestId) {
        self.respond(
            id,
            &InitializeResponse {
                protocol_version: PROTOCOL_VERSION,
                agent_capabilities: AgentCapabilities {
                    load_session: true,
                    prompt_capabilities: PromptCapabilities::default(),
                },
                agent_info: Implementation {
                    name: AGENT_NAME.to_owned(),
                    title: None,
                    version: AGENT_VERSION.to_owned(),
                },
            },
        );
    }

    fn handle_new_session(&self, id: RequestId, params: Value) {
        let Some(params) = self.parse_params::<NewSessionParams>(&id, params) else {
            return;
        };
        let session_id = format!("mock-session-{}", Uuid::new_v4().simple());
        info!(session_id, cwd = %params.cwd, "agent: session created");
        self.lock().active_session = Some(session_id.clone());
        self.respond(id, &NewSessionResponse { session_id });
    }

    fn handle_load_session(&self, id: RequestId, params: Value) {
        let Some(params) = self.parse_params::<LoadSessionParams>(&id, params) else {
            return;
        };
        {
            let mut state = self.lock();
            if state.active_session.as_deref() == Some(params.session_id.as_str()) {
                drop(state);
                let err = AppError::SessionAlreadyActive(params.session_id);
                warn!(error = %err, "agent: rejecting session/load");
                self.respond_error(id, SESSION_ALREADY_ACTIVE, err.to_string());
                return;
            }
            state.active_session = Some(params.session_id.clone());
        }
        info!(session_id = %params.session_id, "agent: session loaded");
        self.respond(id, &json!({}));
    }

    fn handle_cancel(&self, params: Value) {
        let Ok(CancelParams { session_id }) = serde_json::from_value(params) else {
            warn!("agent: malformed session/cancel ignored");
            return;
        };
        match self.lock().turns.get(&session_id) {
            Some(turn) => {
                info!(session_id, turn_id = turn.turn_id, "agent: cancelling turn");
                turn.cancel.cancel();
            }
            None => debug!(session_id, "agent: cancel with no running turn"),
        }
    }

    /// Retire a finished turn and settle its stop reason.
    ///
    /// Runs under the state lock, like [`Self::handle_cancel`], so a cancel
    /// either lands before this point and turns the reason into `cancelled`
    /// or finds no running turn.
    fn end_turn(
        &self,
        session_id: &str,
        turn_id: u64,
        cancel: &CancellationToken,
        stop_reason: StopReason,
    ) -> StopReason {
        let mut state = self.lock();
        if state.turns.get(session_id).is_some_and(|t| t.turn_id == turn_id) {
            state.turns.remove(session_id);
        }
        if cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            stop_reason
        }
    }

    fn handle_prompt(self: &Arc<Self>, id: RequestId, params: Value) {
        let Some(params) = self.parse_params::<PromptParams>(&id, params) else {
            return;
        };
        let scenario = Scenario::from_prompt(params.first_text());
        let turn_id = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let previous = self.lock().turns.insert(
            params.session_id.clone(),
            ActiveTurn {
                turn_id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            warn!(session_id = %params.session_id, "agent: new prompt while a turn is running; cancelling it");
            previous.cancel.cancel();
        }

        info!(session_id = %params.session_id, turn_id, scenario = scenario.name(), "agent: prompt");

        let turn = Turn {
            agent: Arc::clone(self),
            session_id: params.session_id,
            cancel,
        };
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let session_id = turn.session_id.clone();
            let stop_reason = turn.run(scenario).await;
            let stop_reason = agent.end_turn(&session_id, turn_id, &turn.cancel, stop_reason);
            debug!(session_id, turn_id, ?stop_reason, "agent: turn finished");
            agent.respond(id, &PromptResponse { stop_reason });
        });
    }
}

// ── Turn engine ──────────────────────────────────────────────────────────────

/// One running prompt turn.
struct Turn {
    agent: Arc<MockAgent>,
    session_id: String,
    cancel: CancellationToken,
}

impl Turn {
    async fn run(&self, scenario: Scenario) -> StopReason {
        let result = match scenario {
            Scenario::Simple => self.simple().await,
            Scenario::Tool => self.tool().await,
            Scenario::Permission => self.permission().await,
            Scenario::Refuse => self.say("I cannot do that.").map(|()| StopReason::Refusal),
            Scenario::Stream => self.stream().await,
            Scenario::Clear => self.say("Conversation cleared.").map(|()| StopReason::EndTurn),
            Scenario::Echo(text) => self.say(&format!("Echo: {text}")).map(|()| StopReason::EndTurn),
        };
        match result {
            Ok(reason) => reason,
            Err(Cancelled) => StopReason::Cancelled,
        }
    }

    fn check(&self) -> Step {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait one step, or fail fast on cancellation.
    async fn pace(&self) -> Step {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Cancelled),
            () = tokio::time::sleep(STEP_DELAY) => Ok(()),
        }
    }

    fn update(&self, update: SessionUpdate) -> Step {
        self.check()?;
        let notification = SessionNotification {
            session_id: self.session_id.clone(),
            update,
        };
        match serde_json::to_value(notification) {
            Ok(params) => self
                .agent
                .send(&Envelope::notification(methods::SESSION_UPDATE, params)),
            Err(err) => warn!(error = %err, "agent: failed to encode update"),
        }
        Ok(())
    }

    fn say(&self, text: &str) -> Step {
        self.update(SessionUpdate::AgentMessageChunk {
            content: ContentBlock::text(text),
        })
    }

    fn next_tool_call_id(&self) -> String {
        format!(
            "tc{}",
            self.agent.next_tool_call.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn set_status(&self, id: &str, status: ToolCallStatus, content: Option<Vec<ToolCallContent>>) -> Step {
        self.update(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
            tool_call_id: id.to_owned(),
            status: Some(status),
            content,
            ..ToolCallUpdate::default()
        }))
    }

    // ── Scenarios ────────────────────────────────────────────────────────────

    async fn simple(&self) -> Step<StopReason> {
        for chunk in ["Hello ", "from ", "mock agent!"] {
            self.say(chunk)?;
            self.pace().await?;
        }
        Ok(StopReason::EndTurn)
    }

    async fn tool(&self) -> Step<StopReason> {
        let id = self.next_tool_call_id();
        self.update(SessionUpdate::ToolCall(ToolCall {
            tool_call_id: id.clone(),
            title: "Reading README.md".to_owned(),
            kind: ToolKind::Read,
            status: ToolCallStatus::Pending,
            content: Vec::new(),
        }))?;
        self.pace().await?;
        self.set_status(&id, ToolCallStatus::InProgress, None)?;
        self.pace().await?;
        self.set_status(
            &id,
            ToolCallStatus::Completed,
            Some(vec![ToolCallContent::text("# Mock project\nRead 2 lines.")]),
        )?;
        Ok(StopReason::EndTurn)
    }

    async fn permission(&self) -> Step<StopReason> {
        let id = self.next_tool_call_id();
        let title = "Writing notes.txt".to_owned();
        self.update(SessionUpdate::ToolCall(ToolCall {
            tool_call_id: id.clone(),
            title: title.clone(),
            kind: ToolKind::Edit,
            status: ToolCallStatus::Pending,
            content: Vec::new(),
        }))?;
        self.pace().await?;

        let outcome = match self.request_permission(&id, title).await {
            Ok(outcome) => outcome,
            Err(Cancelled) => {
                // The tool call must not stay open once the turn is over.
                self.force_status(&id, ToolCallStatus::Failed);
                return Err(Cancelled);
            }
        };

        match outcome {
            PermissionOutcome::Selected { option_id } if option_id == "allow" => {
                self.set_status(&id, ToolCallStatus::InProgress, None)?;
                self.pace().await?;
                self.set_status(
                    &id,
                    ToolCallStatus::Completed,
                    Some(vec![ToolCallContent::Diff {
                        path: "notes.txt".to_owned(),
                        old_text: None,
                        new_text: "Written by mock agent.\n".to_owned(),
                    }]),
                )?;
                Ok(StopReason::EndTurn)
            }
            PermissionOutcome::Selected { option_id } => {
                debug!(option_id, "agent: permission rejected");
                self.set_status(&id, ToolCallStatus::Failed, None)?;
                self.say("Permission denied.")?;
                Ok(StopReason::EndTurn)
            }
            PermissionOutcome::Cancelled => {
                self.force_status(&id, ToolCallStatus::Failed);
                Err(Cancelled)
            }
        }
    }

    /// Tool-call status updates are allowed after cancellation so the
    /// client never keeps a dangling pending tool call.
    fn force_status(&self, id: &str, status: ToolCallStatus) {
        let notification = SessionNotification {
            session_id: self.session_id.clone(),
            update: SessionUpdate::ToolCallUpdate(ToolCallUpdate {
                tool_call_id: id.to_owned(),
                status: Some(status),
                ..ToolCallUpdate::default()
            }),
        };
        if let Ok(params) = serde_json::to_value(notification) {
            self.agent
                .send(&Envelope::notification(methods::SESSION_UPDATE, params));
        }
    }

    async fn request_permission(&self, tool_call_id: &str, title: String) -> Step<PermissionOutcome> {
        self.check()?;
        let params = RequestPermissionParams {
            session_id: self.session_id.clone(),
            tool_call_id: tool_call_id.to_owned(),
            title,
            options: vec![
                PermissionOption {
                    option_id: "allow".to_owned(),
                    name: "Allow".to_owned(),
                    kind: PermissionOptionKind::AllowOnce,
                },
                PermissionOption {
                    option_id: "reject".to_owned(),
                    name: "Reject".to_owned(),
                    kind: PermissionOptionKind::RejectOnce,
                },
            ],
        };

        let requests = &self.agent.requests;
        let request_id = requests.next_id();
        let Ok(waiter) = requests.register_request(request_id.clone()) else {
            return Err(Cancelled);
        };
        let params = serde_json::to_value(params).unwrap_or(Value::Null);
        self.agent.send(&Envelope::request(
            request_id.clone(),
            methods::SESSION_REQUEST_PERMISSION,
            params,
        ));

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                requests.forget(&request_id);
                return Err(Cancelled);
            }
            result = waiter.wait() => result,
        };

        let response = result.and_then(|v| {
            serde_json::from_value::<RequestPermissionResponse>(v).map_err(AppError::from)
        });
        match response {
            Ok(response) => Ok(response.outcome),
            Err(err) => {
                warn!(error = %err, "agent: permission request failed");
                Ok(PermissionOutcome::Cancelled)
            }
        }
    }

    async fn stream(&self) -> Step<StopReason> {
        let mut n = 0_u64;
        loop {
            n += 1;
            self.say(&format!("Streaming chunk {n}. "))?;
            self.pace().await?;
        }
    }
}

// ── Runner ───────────────────────────────────────────────────────────────────

/// Serve the agent over `stream` (client → agent) and `sink`
/// (agent → client) until the input reaches EOF.
///
/// # Errors
///
/// Returns [`AppError::TransportClosed`] if the output stream fails.
pub async fn run_agent<R, W>(stream: R, sink: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let agent = Arc::new(MockAgent::new(line_tx));

    let writer = tokio::spawn(run_writer("agent-out".into(), sink, line_rx, cancel.clone()));

    let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let read = run_reader("agent-in".into(), stream, frame_tx, cancel.clone());
    let dispatch = async {
        while let Some(frame) = frame_rx.recv().await {
            agent.handle_envelope(frame.envelope);
        }
    };
    let (end, ()) = tokio::join!(read, dispatch);
    info!(reason = %end.reason(), "agent: input closed");

    // Stop running turns; their final responses are still flushed.
    {
        let state = agent.lock();
        for turn in state.turns.values() {
            turn.cancel.cancel();
        }
    }
    agent.requests.fail_all_waiters();
    drop(agent);

    // The writer drains once every turn task has dropped its sender.
    match writer.await {
        Ok(result) => result,
        Err(err) => Err(AppError::TransportClosed(format!("writer task failed: {err}"))),
    }
}
