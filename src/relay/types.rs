// Canonical request/response vocabulary used end-to-end in the relay.
// Requests arrive in the Anthropic Messages shape, get translated to an
// upstream wire format, and responses are rebuilt into these types.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Roles and message content
// ============================================================================

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Message content: either a bare string or a list of tagged blocks.
///
/// Inbound requests may use either form; after translation inward the
/// relay always works with tagged blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text. Tool-use blocks are skipped; tool results
    /// contribute their content so upstreams without structured tool
    /// support still see the information.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !out.is_empty() {
                                out.push('\n');
                            }
                            out.push_str(text);
                        }
                        ContentBlock::ToolResult { content, .. } => {
                            if !out.is_empty() {
                                out.push('\n');
                            }
                            out.push_str(content);
                        }
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                out
            }
        }
    }

    /// View as blocks, wrapping a bare string in a single text block.
    pub fn as_blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(s) => vec![ContentBlock::text(s.clone())],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

/// A single tagged content block, serialising 1:1 to the Anthropic wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Always a parsed JSON object, never a raw string.
        input: serde_json::Value,
        /// Set when the input could not be repaired into valid JSON at
        /// stream end. Not part of the wire format.
        #[serde(skip)]
        input_repair_failed: bool,
        /// The raw accumulated input retained for diagnostics when repair
        /// failed. Not part of the wire format.
        #[serde(skip)]
        raw_input: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            input_repair_failed: false,
            raw_input: None,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }
}

/// Message in conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }
}

// ============================================================================
// Tool definitions
// ============================================================================

/// Tool definition in the Anthropic shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool input
    pub input_schema: serde_json::Value,
}

// ============================================================================
// Canonical request
// ============================================================================

/// Request identifiers carried alongside the message payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestMeta {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// The model name the inbound caller asked for, before routing.
    pub original_model: String,
}

/// The canonical request the relay core consumes. The HTTP front-end has
/// already resolved routing, so `model` is the upstream model name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    /// System prompt, already lifted out of `messages` when present there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub metadata: RequestMeta,
}

impl ChatRequest {
    /// Check the invariants every translator relies on. Rejected requests
    /// never reach an upstream.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.messages.is_empty() {
            return Err(RelayError::InvalidRequest("messages must not be empty".into()));
        }
        let system_count = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        if system_count > 1 {
            return Err(RelayError::InvalidRequest(
                "at most one system message is allowed".into(),
            ));
        }
        match self.messages.last() {
            Some(last) if last.role == Role::User => Ok(()),
            _ => Err(RelayError::InvalidRequest(
                "last message must have role user".into(),
            )),
        }
    }

    /// System text from the explicit field or a system message in history.
    pub fn system_text(&self) -> Option<String> {
        if let Some(s) = &self.system {
            return Some(s.clone());
        }
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.text())
    }

    /// The conversation without any system message.
    pub fn non_system_messages(&self) -> Vec<&ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect()
    }
}

// ============================================================================
// Canonical response
// ============================================================================

/// Reason why generation finished, in Anthropic vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// The canonical response returned to the front-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl ChatResponse {
    /// An empty-content skeleton for `message_start` events.
    pub fn skeleton(id: impl Into<String>, model: impl Into<String>) -> Self {
        ChatResponse {
            id: id.into(),
            model: model.into(),
            role: Role::Assistant,
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }

    /// True when any tool-use block required JSON repair that failed.
    pub fn has_repaired_tool_input(&self) -> bool {
        self.content.iter().any(|b| {
            matches!(
                b,
                ContentBlock::ToolUse {
                    input_repair_failed: true,
                    ..
                }
            )
        })
    }

    /// Stop reason derived from content: tool use wins when the response
    /// ends with a tool call, otherwise the turn ended naturally.
    pub fn derived_stop_reason(&self) -> StopReason {
        match self.content.last() {
            Some(ContentBlock::ToolUse { .. }) => StopReason::ToolUse,
            _ => StopReason::EndTurn,
        }
    }
}

// ============================================================================
// Streaming events
// ============================================================================

/// Delta payload inside a `content_block_delta` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

/// Body of a `message_delta` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Output-token count attached to a `message_delta` event
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageDelta {
    pub output_tokens: u32,
}

/// Streaming event, serialising 1:1 to the Anthropic streaming schema.
///
/// Invariants the relay guarantees per stream: exactly one `MessageStart`
/// first and one `MessageStop` last, every `ContentBlockStart(i)` has a
/// matching `ContentBlockStop(i)` before the next start at `i`, indices are
/// contiguous from zero, and `MessageDelta` precedes `MessageStop`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: ChatResponse,
    },
    Ping,
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageDelta>,
    },
    MessageStop,
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Relay error taxonomy. Only auth failures (one rotation), parse failures
/// (one strategy fallback) and transients (bounded retries) are recovered
/// locally; everything else propagates to the front-end unchanged.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no credential available: {0}")]
    NoCredentialAvailable(String),

    #[error("upstream auth failure (HTTP {status}): {message}")]
    UpstreamAuth { status: u16, message: String },

    #[error("upstream rejected request for model '{model}': {message}")]
    UpstreamBadRequest { model: String, message: String },

    #[error("transient upstream failure (HTTP {status:?}): {message}")]
    UpstreamTransient { status: Option<u16>, message: String },

    #[error("failed to parse upstream response: {0}")]
    UpstreamParse(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the provider client may retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::UpstreamTransient { .. } => true,
            RelayError::Network(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// Classify an upstream HTTP status into the taxonomy.
    pub fn from_status(status: u16, model: &str, body: String) -> Self {
        match status {
            401 | 403 => RelayError::UpstreamAuth {
                status,
                message: body,
            },
            400 => RelayError::UpstreamBadRequest {
                model: model.to_string(),
                message: body,
            },
            429 | 502 | 503 | 504 => RelayError::UpstreamTransient {
                status: Some(status),
                message: body,
            },
            _ => RelayError::UpstreamTransient {
                status: Some(status),
                message: body,
            },
        }
    }
}
