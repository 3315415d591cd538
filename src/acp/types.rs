//! Typed ACP payloads.
//!
//! Parameter and result shapes for the verb set carried inside
//! [`Envelope`](crate::acp::envelope::Envelope) `params`/`result` fields.
//! Field names follow the camelCase wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method names of the ACP verb set.
pub mod methods {
    /// Handshake request (client → agent).
    pub const INITIALIZE: &str = "initialize";
    /// Create a session (client → agent).
    pub const SESSION_NEW: &str = "session/new";
    /// Re-open an existing session (client → agent).
    pub const SESSION_LOAD: &str = "session/load";
    /// Start a turn (client → agent).
    pub const SESSION_PROMPT: &str = "session/prompt";
    /// Cancel the running turn; a notification (client → agent).
    pub const SESSION_CANCEL: &str = "session/cancel";
    /// Streaming update; a notification (agent → client).
    pub const SESSION_UPDATE: &str = "session/update";
    /// Ask the user to authorise a tool call (agent → client).
    pub const SESSION_REQUEST_PERMISSION: &str = "session/request_permission";
}

/// Protocol version negotiated by `initialize`.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Content ──────────────────────────────────────────────────────────────────

/// A piece of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// Image, audio, resource and any other block this crate does not fold.
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    /// Build a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text payload, if this is a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Unsupported => None,
        }
    }
}

/// One content item attached to a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    /// A regular content block.
    Content {
        /// The wrapped block.
        content: ContentBlock,
    },
    /// A file modification.
    Diff {
        /// File being modified.
        path: String,
        /// Previous text; absent for new files.
        #[serde(rename = "oldText", default, skip_serializing_if = "Option::is_none")]
        old_text: Option<String>,
        /// Replacement text.
        #[serde(rename = "newText")]
        new_text: String,
    },
    /// Reference to a terminal owned by the agent.
    Terminal {
        /// Terminal identifier.
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

impl ToolCallContent {
    /// Wrap a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Content {
            content: ContentBlock::text(text),
        }
    }
}

// ── Tool calls ───────────────────────────────────────────────────────────────

/// Category of a tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reading files or data.
    Read,
    /// Modifying files.
    Edit,
    /// Removing files.
    Delete,
    /// Moving or renaming files.
    Move,
    /// Searching.
    Search,
    /// Running a command.
    Execute,
    /// Internal reasoning.
    Think,
    /// Fetching remote data.
    Fetch,
    /// Anything else.
    #[default]
    Other,
}

/// Lifecycle status of a tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Created, not started.
    #[default]
    Pending,
    /// Running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ToolCallStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// `true` for `completed` and `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle forward-only.
    ///
    /// Re-stating the current status is allowed; terminal states only accept
    /// themselves.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }
}

/// Payload of a `tool_call` update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Identifier, unique within the session.
    pub tool_call_id: String,
    /// Human-readable title.
    pub title: String,
    /// Category.
    #[serde(default)]
    pub kind: ToolKind,
    /// Initial status; always `pending` for a well-behaved agent.
    #[serde(default)]
    pub status: ToolCallStatus,
    /// Initial content items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ToolCallContent>,
}

/// Payload of a `tool_call_update` update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Target tool call.
    pub tool_call_id: String,
    /// New title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    /// Replacement content list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ToolCallContent>>,
}

// ── Plan ─────────────────────────────────────────────────────────────────────

/// Relative importance of a plan entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPriority {
    /// High.
    High,
    /// Medium.
    #[default]
    Medium,
    /// Low.
    Low,
}

/// Progress of a plan entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    /// Not started.
    #[default]
    Pending,
    /// Being worked on.
    InProgress,
    /// Done.
    Completed,
}

/// One step of the agent's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Step description.
    pub content: String,
    /// Priority.
    #[serde(default)]
    pub priority: PlanPriority,
    /// Status.
    #[serde(default)]
    pub status: PlanEntryStatus,
}

// ── session/update ───────────────────────────────────────────────────────────

/// The `update` object of a `session/update` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Streaming agent text.
    AgentMessageChunk {
        /// The chunk.
        content: ContentBlock,
    },
    /// Replayed or echoed user text.
    UserMessageChunk {
        /// The chunk.
        content: ContentBlock,
    },
    /// A new tool call.
    ToolCall(ToolCall),
    /// Progress on an existing tool call.
    ToolCallUpdate(ToolCallUpdate),
    /// Full replacement of the plan.
    Plan {
        /// Ordered entries.
        entries: Vec<PlanEntry>,
    },
    /// Thought chunks, command lists and other updates this crate ignores.
    #[serde(other)]
    Unsupported,
}

/// Parameters of `session/update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    /// Session the update belongs to.
    #[serde(default)]
    pub session_id: String,
    /// The update itself.
    pub update: SessionUpdate,
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// Kind of a permission option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    /// Allow this once.
    AllowOnce,
    /// Allow from now on.
    AllowAlways,
    /// Reject this once.
    RejectOnce,
    /// Reject from now on.
    RejectAlways,
}

impl PermissionOptionKind {
    /// `true` for the allow kinds.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

/// One choice offered by a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier echoed back in the outcome.
    pub option_id: String,
    /// Display label.
    pub name: String,
    /// Semantic kind.
    pub kind: PermissionOptionKind,
}

/// Parameters of `session/request_permission`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    /// Session the request belongs to.
    #[serde(default)]
    pub session_id: String,
    /// Tool call awaiting authorisation.
    pub tool_call_id: String,
    /// Prompt title shown to the user.
    pub title: String,
    /// Ordered choices.
    pub options: Vec<PermissionOption>,
}

/// Decision returned for a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// The user picked an option.
    Selected {
        /// The chosen option.
        #[serde(rename = "optionId")]
        option_id: String,
    },
    /// The request was cancelled before a choice was made.
    Cancelled,
}

/// Result of `session/request_permission`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPermissionResponse {
    /// The decision.
    pub outcome: PermissionOutcome,
}

// ── Handshake & sessions ─────────────────────────────────────────────────────

/// Name/version of a protocol participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Machine name.
    pub name: String,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Version string.
    pub version: String,
}

/// Parameters of `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Client's protocol version.
    pub protocol_version: u32,
    /// Client capability flags.
    #[serde(default)]
    pub client_capabilities: Value,
    /// Client identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
}

/// Prompt content the agent accepts beyond plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    /// Image blocks.
    #[serde(default)]
    pub image: bool,
    /// Audio blocks.
    #[serde(default)]
    pub audio: bool,
    /// Embedded resource blocks.
    #[serde(default)]
    pub embedded_context: bool,
}

/// Capabilities advertised by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Whether `session/load` is supported.
    #[serde(default)]
    pub load_session: bool,
    /// Prompt content support.
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
}

/// Result of `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Agent capability flags.
    pub agent_capabilities: AgentCapabilities,
    /// Agent identity.
    pub agent_info: Implementation,
}

/// Parameters of `session/new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    /// Working directory the session is bound to.
    pub cwd: String,
    /// Auxiliary server descriptors, passed through opaquely.
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// Result of `session/new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    /// Fresh session id.
    pub session_id: String,
}

/// Parameters of `session/load`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSessionParams {
    /// Session to re-open.
    pub session_id: String,
    /// Working directory.
    pub cwd: String,
    /// Auxiliary server descriptors.
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

/// Parameters of `session/prompt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    /// Target session.
    pub session_id: String,
    /// Prompt content.
    pub prompt: Vec<ContentBlock>,
}

impl PromptParams {
    /// First text block of the prompt, or `""`.
    #[must_use]
    pub fn first_text(&self) -> &str {
        self.prompt
            .iter()
            .find_map(ContentBlock::as_text)
            .unwrap_or_default()
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent finished normally.
    EndTurn,
    /// The agent declined.
    Refusal,
    /// The client cancelled the turn.
    Cancelled,
}

/// Result of `session/prompt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    /// Why the turn ended.
    pub stop_reason: StopReason,
}

/// Parameters of `session/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    /// Session whose turn should stop.
    pub session_id: String,
}
