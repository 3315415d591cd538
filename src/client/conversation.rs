//! Conversation view folded from `session/update` notifications.
//!
//! [`Conversation`] is the single writer of the message log, the tool-call
//! table, the permission registry and the plan. Every mutating call is one
//! atomic update; after each applied update the revision counter published
//! through [`Conversation::subscribe`] is bumped so observers can redraw
//! without polling.
//!
//! Protocol anomalies (duplicate tool-call ids, updates for unknown tool
//! calls, status regressions) are logged and ignored; they never poison the
//! view.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::acp::envelope::RequestId;
use crate::acp::types::{
    ContentBlock, PermissionOption, PermissionOutcome, PlanEntry, SessionUpdate, StopReason,
    ToolCall, ToolCallStatus, ToolCallUpdate,
};

// ── Messages ─────────────────────────────────────────────────────────────────

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human side.
    User,
    /// The agent.
    Agent,
}

/// One message, built from chunks in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationMessage {
    /// Author.
    pub role: Role,
    /// Chunks in arrival order.
    pub chunks: Vec<String>,
    #[serde(skip)]
    open: bool,
}

impl ConversationMessage {
    fn new(role: Role, open: bool) -> Self {
        Self {
            role,
            chunks: Vec::new(),
            open,
        }
    }

    /// Concatenated text.
    #[must_use]
    pub fn text(&self) -> String {
        self.chunks.concat()
    }

    /// Whether further chunks of the same role extend this message.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// A permission request awaiting the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Correlation id of the agent's request.
    pub request_id: RequestId,
    /// Tool call being authorised.
    pub tool_call_id: String,
    /// Prompt title.
    pub title: String,
    /// Ordered choices.
    pub options: Vec<PermissionOption>,
}

/// A permission request after its single resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPermission {
    /// The original request.
    pub request: PermissionRequest,
    /// Outcome sent back to the agent.
    pub outcome: PermissionOutcome,
    /// `true` when an allow-kind option was selected.
    pub is_allow: bool,
}

impl ResolvedPermission {
    /// Label for the collapsed permission card.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match (&self.outcome, self.is_allow) {
            (PermissionOutcome::Cancelled, _) => "Cancelled",
            (PermissionOutcome::Selected { .. }, true) => "Approved",
            (PermissionOutcome::Selected { .. }, false) => "Denied",
        }
    }
}

// ── Conversation ─────────────────────────────────────────────────────────────

/// Client-side conversation state.
#[derive(Debug)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    tool_calls: Vec<ToolCall>,
    tool_index: HashMap<String, usize>,
    pending_permissions: Vec<PermissionRequest>,
    resolved_permissions: Vec<ResolvedPermission>,
    plan: Vec<PlanEntry>,
    prompting: bool,
    last_stop_reason: Option<StopReason>,
    revision: watch::Sender<u64>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// Empty conversation at revision `0`.
    #[must_use]
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            messages: Vec::new(),
            tool_calls: Vec::new(),
            tool_index: HashMap::new(),
            pending_permissions: Vec::new(),
            resolved_permissions: Vec::new(),
            plan: Vec::new(),
            prompting: false,
            last_stop_reason: None,
            revision,
        }
    }

    /// Subscribe to change notifications.
    ///
    /// The receiver observes the revision number bumped after every applied
    /// update; dropping it unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn changed(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Message log in order.
    #[must_use]
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Tool calls in creation order.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    /// Look up a tool call by id.
    #[must_use]
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_index.get(id).map(|&i| &self.tool_calls[i])
    }

    /// Permission requests awaiting the user, in arrival order.
    #[must_use]
    pub fn pending_permissions(&self) -> &[PermissionRequest] {
        &self.pending_permissions
    }

    /// Resolved permission requests, in resolution order.
    #[must_use]
    pub fn resolved_permissions(&self) -> &[ResolvedPermission] {
        &self.resolved_permissions
    }

    /// Current plan.
    #[must_use]
    pub fn plan(&self) -> &[PlanEntry] {
        &self.plan
    }

    /// `true` while a `session/prompt` is in flight.
    #[must_use]
    pub fn is_prompting(&self) -> bool {
        self.prompting
    }

    /// Stop reason of the last completed turn.
    #[must_use]
    pub fn last_stop_reason(&self) -> Option<StopReason> {
        self.last_stop_reason
    }

    // ── Updates ──────────────────────────────────────────────────────────────

    /// Fold one `session/update` payload.
    ///
    /// Returns `true` when the view changed.
    pub fn apply_update(&mut self, update: SessionUpdate) -> bool {
        let applied = match update {
            SessionUpdate::AgentMessageChunk { content } => self.append_chunk(Role::Agent, &content),
            SessionUpdate::UserMessageChunk { content } => self.append_chunk(Role::User, &content),
            SessionUpdate::ToolCall(call) => self.insert_tool_call(call),
            SessionUpdate::ToolCallUpdate(update) => self.merge_tool_call(update),
            SessionUpdate::Plan { entries } => {
                self.plan = entries;
                true
            }
            SessionUpdate::Unsupported => {
                debug!("conversation: ignoring unsupported session update");
                false
            }
        };
        if applied {
            self.changed();
        }
        applied
    }

    fn append_chunk(&mut self, role: Role, content: &ContentBlock) -> bool {
        let Some(text) = content.as_text() else {
            debug!(?role, "conversation: ignoring non-text chunk");
            return false;
        };

        match self.messages.last_mut() {
            Some(last) if last.role == role && last.open => {
                last.chunks.push(text.to_owned());
                return true;
            }
            Some(last) => last.open = false,
            None => {}
        }
        let mut message = ConversationMessage::new(role, true);
        message.chunks.push(text.to_owned());
        self.messages.push(message);
        true
    }

    fn insert_tool_call(&mut self, call: ToolCall) -> bool {
        if self.tool_index.contains_key(&call.tool_call_id) {
            warn!(tool_call_id = %call.tool_call_id, "conversation: duplicate tool call ignored");
            return false;
        }
        if call.status != ToolCallStatus::Pending {
            debug!(tool_call_id = %call.tool_call_id, status = ?call.status, "conversation: tool call created past pending");
        }
        self.tool_index
            .insert(call.tool_call_id.clone(), self.tool_calls.len());
        self.tool_calls.push(call);
        true
    }

    fn merge_tool_call(&mut self, update: ToolCallUpdate) -> bool {
        let Some(&index) = self.tool_index.get(&update.tool_call_id) else {
            warn!(tool_call_id = %update.tool_call_id, "conversation: update for unknown tool call ignored");
            return false;
        };
        let call = &mut self.tool_calls[index];

        if let Some(status) = update.status {
            if call.status.can_advance_to(status) {
                call.status = status;
            } else {
                warn!(
                    tool_call_id = %call.tool_call_id,
                    from = ?call.status,
                    to = ?status,
                    "conversation: tool call status regression ignored"
                );
            }
        }
        if let Some(title) = update.title {
            call.title = title;
        }
        if let Some(kind) = update.kind {
            call.kind = kind;
        }
        if let Some(content) = update.content {
            call.content = content;
        }
        true
    }

    /// Record a message typed locally by the user.
    ///
    /// The message is closed immediately, so the agent's reply opens a new
    /// message.
    pub fn add_user_message(&mut self, text: &str) {
        if let Some(last) = self.messages.last_mut() {
            last.open = false;
        }
        let mut message = ConversationMessage::new(Role::User, false);
        message.chunks.push(text.to_owned());
        self.messages.push(message);
        self.changed();
    }

    /// Mark a prompt as sent.
    pub fn begin_turn(&mut self) {
        self.prompting = true;
        self.changed();
    }

    /// Mark the in-flight prompt as finished.
    ///
    /// `stop_reason` is `None` when the prompt failed. The open agent
    /// message is closed so the next turn starts a new one.
    pub fn finish_turn(&mut self, stop_reason: Option<StopReason>) {
        self.prompting = false;
        if stop_reason.is_some() {
            self.last_stop_reason = stop_reason;
        }
        if let Some(last) = self.messages.last_mut() {
            last.open = false;
        }
        self.changed();
    }

    /// Register a permission request for the UI.
    ///
    /// Returns `false` when a request with the same id is already pending.
    pub fn track_permission(&mut self, request: PermissionRequest) -> bool {
        if self
            .pending_permissions
            .iter()
            .any(|p| p.request_id == request.request_id)
        {
            warn!(request_id = %request.request_id, "conversation: duplicate permission request ignored");
            return false;
        }
        self.pending_permissions.push(request);
        self.changed();
        true
    }

    /// Move a pending permission request to the resolved list.
    ///
    /// Returns `false` when no such request is pending.
    pub fn resolve_permission(&mut self, request_id: &RequestId, outcome: PermissionOutcome) -> bool {
        let Some(pos) = self
            .pending_permissions
            .iter()
            .position(|p| &p.request_id == request_id)
        else {
            return false;
        };
        let request = self.pending_permissions.remove(pos);
        let is_allow = match &outcome {
            PermissionOutcome::Selected { option_id } => request
                .options
                .iter()
                .find(|o| &o.option_id == option_id)
                .is_some_and(|o| o.kind.is_allow()),
            PermissionOutcome::Cancelled => false,
        };
        self.resolved_permissions.push(ResolvedPermission {
            request,
            outcome,
            is_allow,
        });
        self.changed();
        true
    }

    /// Reset the view: messages, tool calls, plan, resolved permissions and
    /// the last stop reason. Pending permission requests are kept, they are
    /// still owed an answer.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.tool_calls.clear();
        self.tool_index.clear();
        self.resolved_permissions.clear();
        self.plan.clear();
        self.last_stop_reason = None;
        self.changed();
    }
}
