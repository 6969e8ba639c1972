// Anthropic pass-through: the canonical types already serialise 1:1 to the
// Messages API, so outbound translation is re-serialisation with minor
// normalisation and inbound translation is validation.

use crate::relay::reconstruct::repair_input;
use crate::relay::types::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, MessageContent, RelayError, RequestMeta,
    Role, StreamEvent, ToolSpec,
};
use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

// ============================================================================
// Outbound
// ============================================================================

/// Re-serialise the canonical request for the Messages API. When
/// `strip_tools` is set (a per-binding flag for upstreams known not to
/// support tool blocks), tool definitions are dropped and tool blocks are
/// rendered as their textual form.
pub fn build_request(
    req: &ChatRequest,
    upstream_model: &str,
    strip_tools: bool,
) -> MessagesRequest {
    let messages = req
        .non_system_messages()
        .into_iter()
        .map(|message| {
            if strip_tools {
                ChatMessage {
                    role: message.role,
                    content: strip_tool_blocks(&message.content),
                }
            } else {
                message.clone()
            }
        })
        .collect();

    MessagesRequest {
        model: upstream_model.to_string(),
        max_tokens: req.max_tokens,
        messages,
        system: req.system_text(),
        temperature: req.temperature,
        stream: req.stream,
        tools: if strip_tools { None } else { req.tools.clone() },
    }
}

/// Parse a Messages API request body back into the canonical request.
/// Inverse of `build_request` on the supported subset.
pub fn parse_request(bytes: &[u8]) -> Result<ChatRequest, RelayError> {
    let wire: MessagesRequest = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::InvalidRequest(format!("messages body: {}", e)))?;
    let req = ChatRequest {
        model: wire.model.clone(),
        messages: wire.messages,
        max_tokens: wire.max_tokens,
        temperature: wire.temperature,
        stream: wire.stream,
        tools: wire.tools,
        system: wire.system,
        metadata: RequestMeta {
            original_model: wire.model,
            ..RequestMeta::default()
        },
    };
    req.validate()?;
    Ok(req)
}

fn strip_tool_blocks(content: &MessageContent) -> MessageContent {
    let blocks = content
        .as_blocks()
        .into_iter()
        .map(|block| match block {
            ContentBlock::ToolUse {
                name, input, ..
            } => ContentBlock::text(format!("Tool call: {}({})", name, input)),
            ContentBlock::ToolResult { content, .. } => ContentBlock::text(content),
            text => text,
        })
        .collect();
    MessageContent::Blocks(blocks)
}

// ============================================================================
// Inbound
// ============================================================================

/// Validate and forward an upstream Messages response. Tool-use inputs that
/// arrive as JSON strings are normalised into parsed objects; content
/// blocks of an unknown type degrade to text rather than failing the
/// response.
pub fn parse_response(bytes: &[u8]) -> Result<ChatResponse, RelayError> {
    let raw: RawMessagesResponse = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::UpstreamParse(format!("messages body: {}", e)))?;
    if raw.role != Role::Assistant {
        return Err(RelayError::UpstreamParse(format!(
            "unexpected response role {}",
            raw.role
        )));
    }
    if raw.content.is_empty() {
        return Err(RelayError::UpstreamParse(
            "response content was empty".to_string(),
        ));
    }

    let content = raw
        .content
        .into_iter()
        .map(|value| match serde_json::from_value::<ContentBlock>(value.clone()) {
            Ok(block) => block,
            Err(_) => ContentBlock::text(value.to_string()),
        })
        .collect();
    let mut resp = ChatResponse {
        id: raw.id,
        model: raw.model,
        role: raw.role,
        content,
        stop_reason: raw.stop_reason,
        stop_sequence: raw.stop_sequence,
        usage: raw.usage,
    };
    for block in &mut resp.content {
        if let ContentBlock::ToolUse {
            input,
            input_repair_failed,
            raw_input,
            ..
        } = block
        {
            if let Some(raw) = input.as_str() {
                let raw = raw.to_string();
                let (parsed, failed) = repair_input(&raw);
                *input = parsed;
                *input_repair_failed = failed;
                if failed {
                    *raw_input = Some(raw);
                }
            } else if !input.is_object() {
                *input = serde_json::json!({});
                *input_repair_failed = true;
            }
        }
    }
    Ok(resp)
}

/// Forward an upstream Messages SSE stream as canonical events. The wire
/// events already match the canonical schema, so this is a parse-and-emit
/// loop that ends at `message_stop`.
pub fn stream_events<S, E>(
    bytes: S,
) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, RelayError>> + Send>>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let out = stream! {
        let sse = bytes.eventsource();
        futures::pin_mut!(sse);

        while let Some(event) = sse.next().await {
            let event = match event {
                Ok(e) => e,
                Err(err) => {
                    yield Err(RelayError::UpstreamParse(format!("SSE stream error: {}", err)));
                    return;
                }
            };
            if event.data.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&event.data) {
                Ok(parsed) => {
                    let is_stop = matches!(parsed, StreamEvent::MessageStop);
                    yield Ok(parsed);
                    if is_stop {
                        return;
                    }
                }
                Err(err) => {
                    log::debug!(
                        "ignoring unknown messages stream event {:?}: {}",
                        event.event,
                        err
                    );
                }
            }
        }
    };
    Box::pin(out)
}

// ============================== API types ==============================

/// Response body with content blocks kept raw so unknown block types can
/// degrade instead of failing deserialization.
#[derive(Debug, Deserialize)]
struct RawMessagesResponse {
    id: String,
    model: String,
    role: Role,
    content: Vec<serde_json::Value>,
    stop_reason: Option<crate::relay::types::StopReason>,
    stop_sequence: Option<String>,
    usage: crate::relay::types::Usage,
}

/// The Messages API request body. Identical to the canonical request minus
/// relay metadata, which is exactly what makes the pass-through a
/// re-serialisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}
