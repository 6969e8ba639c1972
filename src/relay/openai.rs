// OpenAI-compatible translator: canonical requests to the chat-completions
// shape, plus non-streaming and SSE streaming response conversion back to
// Anthropic-shaped events.

use crate::relay::reconstruct::repair_input;
use crate::relay::types::{
    BlockDelta, ChatRequest, ChatResponse, ContentBlock, MessageContent, MessageDeltaBody,
    RelayError, Role, StopReason, StreamEvent, Usage, UsageDelta,
};
use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

// ============================================================================
// Outbound
// ============================================================================

/// Build the chat-completions request body.
pub fn build_request(req: &ChatRequest, upstream_model: &str) -> OpenAiRequest {
    let mut messages = Vec::new();

    if let Some(system) = req.system_text() {
        messages.push(OaMessage {
            role: "system".to_string(),
            content: Some(system),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in req.non_system_messages() {
        match message.role {
            Role::User => push_user_message(&mut messages, &message.content),
            Role::Assistant => push_assistant_message(&mut messages, &message.content),
            Role::System => {}
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| OaTool {
                r#type: "function".to_string(),
                function: OaFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    OpenAiRequest {
        model: upstream_model.to_string(),
        messages,
        tools,
        stream: req.stream,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
    }
}

fn push_user_message(messages: &mut Vec<OaMessage>, content: &MessageContent) {
    let mut text_parts = Vec::new();
    for block in content.as_blocks() {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            // Tool results become their own `tool` role messages.
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => messages.push(OaMessage {
                role: "tool".to_string(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            }),
            ContentBlock::ToolUse { .. } => {}
        }
    }
    if !text_parts.is_empty() {
        messages.push(OaMessage {
            role: "user".to_string(),
            content: Some(text_parts.join("\n")),
            tool_calls: None,
            tool_call_id: None,
        });
    }
}

fn push_assistant_message(messages: &mut Vec<OaMessage>, content: &MessageContent) {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in content.as_blocks() {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse {
                id, name, input, ..
            } => tool_calls.push(OaToolCall {
                id,
                r#type: "function".to_string(),
                function: OaFunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult { .. } => {}
        }
    }
    messages.push(OaMessage {
        role: "assistant".to_string(),
        content: if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    });
}

// ============================================================================
// Inbound, non-streaming
// ============================================================================

pub fn parse_response(bytes: &[u8], requested_model: &str) -> Result<ChatResponse, RelayError> {
    let resp: OaResponse = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::UpstreamParse(format!("chat completion body: {}", e)))?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::UpstreamParse("response had no choices".to_string()))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let (input, repair_failed) = repair_input(&call.function.arguments);
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
            input_repair_failed: repair_failed,
            raw_input: if repair_failed {
                Some(call.function.arguments)
            } else {
                None
            },
        });
    }
    if content.is_empty() {
        content.push(ContentBlock::text(""));
    }

    Ok(ChatResponse {
        id: resp.id.unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        model: if resp.model.is_empty() {
            requested_model.to_string()
        } else {
            resp.model
        },
        role: Role::Assistant,
        content,
        stop_reason: map_finish_reason(choice.finish_reason.as_deref()),
        stop_sequence: None,
        usage: resp
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
    })
}

/// Map an OpenAI finish reason into the Anthropic vocabulary. An absent
/// reason stays absent.
pub fn map_finish_reason(reason: Option<&str>) -> Option<StopReason> {
    match reason {
        Some("stop") => Some(StopReason::EndTurn),
        Some("length") => Some(StopReason::MaxTokens),
        Some("tool_calls") | Some("function_call") => Some(StopReason::ToolUse),
        Some("content_filter") => Some(StopReason::StopSequence),
        Some(other) => {
            log::debug!("unmapped finish_reason {:?}; leaving stop reason unset", other);
            None
        }
        None => None,
    }
}

// ============================================================================
// Inbound, streaming
// ============================================================================

enum OpenKind {
    Text,
    Tool,
}

/// Convert a chat-completions SSE byte stream into Anthropic streaming
/// events. The returned sequence always forms a complete valid envelope or
/// ends with a terminal error item.
pub fn stream_events<S, E>(
    bytes: S,
    requested_model: String,
) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, RelayError>> + Send>>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let out = stream! {
        let sse = bytes.eventsource();
        futures::pin_mut!(sse);

        let mut started = false;
        let mut next_index = 0usize;
        let mut open_block: Option<(usize, OpenKind)> = None;
        let mut open_tool_key: Option<u32> = None;
        let mut stop_reason: Option<StopReason> = None;
        let mut usage: Option<UsageDelta> = None;
        let mut failed = false;

        while let Some(event) = sse.next().await {
            let event = match event {
                Ok(e) => e,
                Err(err) => {
                    yield Err(RelayError::UpstreamParse(format!("SSE stream error: {}", err)));
                    failed = true;
                    break;
                }
            };
            if event.data.trim().is_empty() {
                continue;
            }
            if event.data == "[DONE]" {
                break;
            }
            let chunk: OaStreamChunk = match serde_json::from_str(&event.data) {
                Ok(c) => c,
                Err(err) => {
                    log::debug!("skipping unparsable stream chunk: {}", err);
                    continue;
                }
            };

            if !started {
                started = true;
                let id = chunk
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));
                let model = chunk
                    .model
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| requested_model.clone());
                yield Ok(StreamEvent::MessageStart {
                    message: ChatResponse::skeleton(id, model),
                });
                yield Ok(StreamEvent::Ping);
            }

            if let Some(u) = chunk.usage {
                usage = Some(UsageDelta {
                    output_tokens: u.completion_tokens,
                });
            }

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    match open_block {
                        Some((index, OpenKind::Text)) => {
                            yield Ok(StreamEvent::ContentBlockDelta {
                                index,
                                delta: BlockDelta::TextDelta { text },
                            });
                        }
                        _ => {
                            if let Some((index, _)) = open_block.take() {
                                yield Ok(StreamEvent::ContentBlockStop { index });
                                open_tool_key = None;
                            }
                            let index = next_index;
                            next_index += 1;
                            open_block = Some((index, OpenKind::Text));
                            yield Ok(StreamEvent::ContentBlockStart {
                                index,
                                content_block: ContentBlock::text(""),
                            });
                            yield Ok(StreamEvent::ContentBlockDelta {
                                index,
                                delta: BlockDelta::TextDelta { text },
                            });
                        }
                    }
                }
            }

            for call in choice.delta.tool_calls.unwrap_or_default() {
                let continuing = matches!(open_block, Some((_, OpenKind::Tool)))
                    && open_tool_key == Some(call.index);
                if !continuing {
                    if let Some((index, _)) = open_block.take() {
                        yield Ok(StreamEvent::ContentBlockStop { index });
                    }
                    let index = next_index;
                    next_index += 1;
                    open_block = Some((index, OpenKind::Tool));
                    open_tool_key = Some(call.index);
                    let id = call
                        .id
                        .clone()
                        .unwrap_or_else(crate::relay::reconstruct::synthesize_tool_id);
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::tool_use(id, name, serde_json::json!({})),
                    });
                }
                if let Some(arguments) = call.function.and_then(|f| f.arguments) {
                    if !arguments.is_empty() {
                        if let Some((index, OpenKind::Tool)) = &open_block {
                            yield Ok(StreamEvent::ContentBlockDelta {
                                index: *index,
                                delta: BlockDelta::InputJsonDelta {
                                    partial_json: arguments,
                                },
                            });
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                stop_reason = map_finish_reason(Some(&reason));
                if let Some((index, _)) = open_block.take() {
                    yield Ok(StreamEvent::ContentBlockStop { index });
                    open_tool_key = None;
                }
            }
        }

        if !failed {
            if !started {
                // Nothing arrived; still emit a valid (empty) envelope.
                yield Ok(StreamEvent::MessageStart {
                    message: ChatResponse::skeleton(
                        format!("msg_{}", uuid::Uuid::new_v4().simple()),
                        requested_model.clone(),
                    ),
                });
                yield Ok(StreamEvent::Ping);
            }
            if let Some((index, _)) = open_block.take() {
                yield Ok(StreamEvent::ContentBlockStop { index });
            }
            yield Ok(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason,
                    stop_sequence: None,
                },
                usage,
            });
            yield Ok(StreamEvent::MessageStop);
        }
    };
    Box::pin(out)
}

// ============================== API types ==============================

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OaTool>>,
    pub stream: bool,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OaMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OaToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OaTool {
    pub r#type: String,
    pub function: OaFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct OaFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OaToolCall {
    pub id: String,
    pub r#type: String,
    pub function: OaFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OaFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
struct OaResponse {
    id: Option<String>,
    #[serde(default)]
    model: String,
    choices: Vec<OaChoice>,
    usage: Option<OaUsage>,
}

#[derive(Debug, Deserialize)]
struct OaChoice {
    message: OaResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OaUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OaStreamChunk {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OaStreamChoice>,
    usage: Option<OaUsage>,
}

#[derive(Debug, Deserialize)]
struct OaStreamChoice {
    delta: OaDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OaDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OaToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<OaFunctionCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OaFunctionCallDelta {
    name: Option<String>,
    arguments: Option<String>,
}
