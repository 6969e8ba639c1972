// Gemini translator: canonical requests to the generative-content shape
// and candidate parts back to canonical blocks. Tool-bearing requests must
// use the v1beta API surface.

use crate::relay::reconstruct::synthesize_tool_id;
use crate::relay::types::{
    BlockDelta, ChatRequest, ChatResponse, ContentBlock, MessageDeltaBody, RelayError, Role,
    StopReason, StreamEvent, Usage, UsageDelta,
};
use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// JSON-schema keys the Gemini schema dialect accepts; everything else is
/// stripped recursively before the request goes out.
const ALLOWED_SCHEMA_KEYS: &[&str] = &["type", "properties", "required", "items", "description", "enum"];

/// Request path for a model. Tool use requires `v1beta`, not `v1`.
pub fn generate_path(model: &str, streaming: bool) -> String {
    if streaming {
        format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
    } else {
        format!("/v1beta/models/{}:generateContent", model)
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Build the generate-content request body. The system prompt becomes a
/// prepended user turn; Gemini has no dedicated slot in this shape.
pub fn build_request(req: &ChatRequest) -> GeminiRequest {
    let mut contents = Vec::new();

    if let Some(system) = req.system_text() {
        contents.push(GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart::text(system)],
        });
    }

    // Tool-result parts need the function name, which only the originating
    // tool-use block carries.
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for message in req.non_system_messages() {
        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let mut parts = Vec::new();
        for block in message.content.as_blocks() {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(GeminiPart::text(text));
                    }
                }
                ContentBlock::ToolUse {
                    id, name, input, ..
                } => {
                    tool_names.insert(id, name.clone());
                    parts.push(GeminiPart {
                        text: None,
                        function_call: Some(GeminiFunctionCall { name, args: input }),
                        function_response: None,
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = tool_names
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| "tool".to_string());
                    let response = serde_json::from_str(&content)
                        .unwrap_or_else(|_| serde_json::json!({ "result": content }));
                    parts.push(GeminiPart {
                        text: None,
                        function_call: None,
                        function_response: Some(GeminiFunctionResponse { name, response }),
                    });
                }
            }
        }
        if !parts.is_empty() {
            contents.push(GeminiContent {
                role: role.to_string(),
                parts,
            });
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|tool| GeminiFunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: strip_schema(&tool.input_schema),
                })
                .collect(),
        }]
    });

    GeminiRequest {
        contents,
        tools,
        generation_config: GeminiGenerationConfig {
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
        },
    }
}

/// Recursively reduce a JSON schema to the subset Gemini accepts. Keeps
/// only `type`, `properties`, `required`, `items`, `description`, `enum`;
/// drops `$schema`, `additionalProperties`, length constraints and the
/// rest.
pub fn strip_schema(schema: &serde_json::Value) -> serde_json::Value {
    let Some(object) = schema.as_object() else {
        return schema.clone();
    };
    let mut out = serde_json::Map::new();
    for key in ALLOWED_SCHEMA_KEYS {
        let Some(value) = object.get(*key) else {
            continue;
        };
        let value = match *key {
            "properties" => match value.as_object() {
                Some(props) => serde_json::Value::Object(
                    props
                        .iter()
                        .map(|(name, prop)| (name.clone(), strip_schema(prop)))
                        .collect(),
                ),
                None => continue,
            },
            "items" => strip_schema(value),
            _ => value.clone(),
        };
        out.insert((*key).to_string(), value);
    }
    serde_json::Value::Object(out)
}

// ============================================================================
// Inbound
// ============================================================================

pub fn parse_response(bytes: &[u8], requested_model: &str) -> Result<ChatResponse, RelayError> {
    let resp: GeminiResponse = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::UpstreamParse(format!("generate-content body: {}", e)))?;
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::UpstreamParse("response had no candidates".to_string()))?;

    let mut content = Vec::new();
    let mut saw_function_call = false;
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            if !text.is_empty() {
                content.push(ContentBlock::text(text));
            }
        }
        if let Some(call) = part.function_call {
            saw_function_call = true;
            content.push(ContentBlock::tool_use(
                synthesize_tool_id(),
                call.name,
                call.args,
            ));
        }
    }
    if content.is_empty() {
        content.push(ContentBlock::text(""));
    }

    let stop_reason = if saw_function_call {
        Some(StopReason::ToolUse)
    } else {
        map_finish_reason(candidate.finish_reason.as_deref())
    };

    Ok(ChatResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        model: requested_model.to_string(),
        role: Role::Assistant,
        content,
        stop_reason,
        stop_sequence: None,
        usage: resp
            .usage_metadata
            .map(|u| Usage {
                input_tokens: u.prompt_token_count.unwrap_or(0),
                output_tokens: u.candidates_token_count.unwrap_or(0),
            })
            .unwrap_or_default(),
    })
}

fn map_finish_reason(reason: Option<&str>) -> Option<StopReason> {
    match reason {
        Some("STOP") => Some(StopReason::EndTurn),
        Some("MAX_TOKENS") => Some(StopReason::MaxTokens),
        Some(other) => {
            log::debug!("unmapped Gemini finishReason {:?}", other);
            None
        }
        None => None,
    }
}

/// Convert a `streamGenerateContent` SSE stream into Anthropic events.
/// Text parts stream as deltas; function calls arrive whole and are
/// emitted as complete tool-use blocks.
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
        let mut text_open: Option<usize> = None;
        let mut saw_function_call = false;
        let mut finish: Option<StopReason> = None;
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
            let chunk: GeminiResponse = match serde_json::from_str(&event.data) {
                Ok(c) => c,
                Err(err) => {
                    log::debug!("skipping unparsable Gemini chunk: {}", err);
                    continue;
                }
            };

            if !started {
                started = true;
                yield Ok(StreamEvent::MessageStart {
                    message: ChatResponse::skeleton(
                        format!("msg_{}", uuid::Uuid::new_v4().simple()),
                        requested_model.clone(),
                    ),
                });
                yield Ok(StreamEvent::Ping);
            }

            if let Some(u) = chunk.usage_metadata {
                usage = Some(UsageDelta {
                    output_tokens: u.candidates_token_count.unwrap_or(0),
                });
            }

            let Some(candidate) = chunk.candidates.into_iter().next() else {
                continue;
            };
            if let Some(reason) = candidate.finish_reason.as_deref() {
                if finish.is_none() {
                    finish = map_finish_reason(Some(reason));
                }
            }

            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    if text.is_empty() {
                        continue;
                    }
                    let index = match text_open {
                        Some(index) => index,
                        None => {
                            let index = next_index;
                            next_index += 1;
                            text_open = Some(index);
                            yield Ok(StreamEvent::ContentBlockStart {
                                index,
                                content_block: ContentBlock::text(""),
                            });
                            index
                        }
                    };
                    yield Ok(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::TextDelta { text },
                    });
                }
                if let Some(call) = part.function_call {
                    saw_function_call = true;
                    if let Some(index) = text_open.take() {
                        yield Ok(StreamEvent::ContentBlockStop { index });
                    }
                    let index = next_index;
                    next_index += 1;
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::tool_use(
                            synthesize_tool_id(),
                            call.name,
                            call.args,
                        ),
                    });
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
            }
        }

        if !failed {
            if !started {
                yield Ok(StreamEvent::MessageStart {
                    message: ChatResponse::skeleton(
                        format!("msg_{}", uuid::Uuid::new_v4().simple()),
                        requested_model.clone(),
                    ),
                });
                yield Ok(StreamEvent::Ping);
            }
            if let Some(index) = text_open.take() {
                yield Ok(StreamEvent::ContentBlockStop { index });
            }
            let stop_reason = if saw_function_call {
                Some(StopReason::ToolUse)
            } else {
                finish.or(Some(StopReason::EndTurn))
            };
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
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    pub generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        GeminiPart {
            text: Some(text.into()),
            function_call: None,
            function_response: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}
