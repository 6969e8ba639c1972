// CWR translator: canonical requests to the AWS code-assistant
// conversation shape, and binary event-stream responses back to canonical
// content through the reconstruction engine.

use crate::relay::binding::ProviderBinding;
use crate::relay::eventstream::{self, DecodedEvent};
use crate::relay::reconstruct::ToolCallReconstructor;
use crate::relay::types::{
    ChatRequest, ChatResponse, ContentBlock, RelayError, Role, StopReason, Usage,
};
use serde::Serialize;
use serde_json::Value;

pub const GENERATE_PATH: &str = "/generateAssistantResponse";

/// Fixed assistant acknowledgement paired with the synthetic system turn.
const SYSTEM_ACK: &str = "I will follow these instructions";

// ============================================================================
// Outbound
// ============================================================================

/// Build the CWR request body. The last user message becomes the current
/// message; everything before it becomes history.
pub fn build_request(
    req: &ChatRequest,
    upstream_model: &str,
    profile_arn: Option<&str>,
) -> Result<GenerateAssistantRequest, RelayError> {
    let conversation_id = req
        .metadata
        .conversation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let messages = req.non_system_messages();
    let (current, earlier) = match messages.split_last() {
        Some((last, earlier)) if last.role == Role::User => (last, earlier),
        _ => {
            return Err(RelayError::InvalidRequest(
                "last message must have role user".into(),
            ))
        }
    };

    let mut history = Vec::new();
    if let Some(system) = req.system_text() {
        // CWR has no system slot; it becomes a leading exchange.
        history.push(HistoryTurn::User {
            user_input_message: UserInputMessage {
                content: system,
                model_id: None,
                origin: None,
                user_input_message_context: None,
            },
        });
        history.push(HistoryTurn::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: SYSTEM_ACK.to_string(),
                tool_uses: Vec::new(),
            },
        });
    }

    for message in earlier {
        match message.role {
            Role::User => history.push(HistoryTurn::User {
                user_input_message: UserInputMessage {
                    // Tool results fold into the turn text.
                    content: message.content.text(),
                    model_id: None,
                    origin: None,
                    user_input_message_context: None,
                },
            }),
            Role::Assistant => {
                let tool_uses = message
                    .content
                    .as_blocks()
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolUse {
                            id, name, input, ..
                        } => Some(CwrToolUse {
                            tool_use_id: id,
                            name,
                            input,
                        }),
                        _ => None,
                    })
                    .collect();
                history.push(HistoryTurn::Assistant {
                    assistant_response_message: AssistantResponseMessage {
                        content: message.content.text(),
                        tool_uses,
                    },
                });
            }
            Role::System => {}
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| CwrTool {
                tool_specification: ToolSpecification {
                    name: tool.name.clone(),
                    description: tool.description.clone().unwrap_or_default(),
                    input_schema: ToolInputSchema {
                        json: tool.input_schema.clone(),
                    },
                },
            })
            .collect::<Vec<_>>()
    });

    Ok(GenerateAssistantRequest {
        conversation_state: ConversationState {
            chat_trigger_type: "MANUAL".to_string(),
            conversation_id,
            current_message: CurrentMessage {
                user_input_message: UserInputMessage {
                    content: current.content.text(),
                    model_id: Some(upstream_model.to_string()),
                    origin: Some("AI_EDITOR".to_string()),
                    user_input_message_context: Some(UserInputMessageContext { tools }),
                },
            },
            history,
        },
        profile_arn: profile_arn.map(|s| s.to_string()),
    })
}

// ============================================================================
// Inbound
// ============================================================================

/// Parse a buffered CWR response into a canonical response. The buffer is
/// an AWS binary event stream; decoded events flow through the
/// reconstruction engine.
pub fn parse_response(
    buf: &[u8],
    binding: &ProviderBinding,
    requested_model: &str,
) -> Result<ChatResponse, RelayError> {
    let outcome = eventstream::decode_events(buf);
    if outcome.events.is_empty() {
        return Err(RelayError::UpstreamParse(
            "CWR response contained no decodable events".to_string(),
        ));
    }
    if outcome.corrupt {
        log::warn!(
            "CWR event stream corrupt after {} events; continuing with partial decode",
            outcome.events.len()
        );
    }

    let mut engine = ToolCallReconstructor::new();
    let mut upstream_model = None;
    normalize_events(&outcome.events, &mut engine, &mut upstream_model);
    let mut content = engine.finish();
    if content.is_empty() {
        content.push(ContentBlock::text(""));
    }

    let model = match upstream_model {
        Some(id) => {
            let canonical = binding.canonical_model(&id);
            if canonical == id && !binding.model_map.values().any(|v| v == &id) {
                requested_model.to_string()
            } else {
                canonical
            }
        }
        None => requested_model.to_string(),
    };

    let stop_reason = match content.last() {
        Some(ContentBlock::ToolUse { .. }) => Some(StopReason::ToolUse),
        _ => None,
    };

    Ok(ChatResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        model,
        role: Role::Assistant,
        content,
        stop_reason,
        stop_sequence: None,
        usage: Usage::default(),
    })
}

/// Route decoded events into the reconstruction engine. Fragmented tool
/// events are authoritative: an event carrying tool metadata is never
/// rescanned as narration text, even if its content looks like a textual
/// tool call.
pub fn normalize_events(
    events: &[DecodedEvent],
    engine: &mut ToolCallReconstructor,
    upstream_model: &mut Option<String>,
) {
    let mut open_tool_id: Option<String> = None;

    for event in events {
        let payload = &event.payload;
        if upstream_model.is_none() {
            if let Some(id) = payload.get("modelId").and_then(Value::as_str) {
                *upstream_model = Some(id.to_string());
            }
        }

        let tool_use_id = payload.get("toolUseId").and_then(Value::as_str);
        if let Some(id) = tool_use_id {
            if open_tool_id.as_deref() != Some(id) {
                let name = payload
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("tool");
                engine.open_tool(id, name);
                open_tool_id = Some(id.to_string());
            }
            if let Some(fragment) = payload.get("input").and_then(Value::as_str) {
                engine.append_tool_input(fragment);
            }
            if payload.get("stop").and_then(Value::as_bool) == Some(true) {
                engine.close_tool();
                open_tool_id = None;
            }
            continue;
        }

        match event.event_type.as_str() {
            "assistantResponseEvent" | "followupPromptEvent" => {
                if let Some(text) = payload
                    .get("content")
                    .and_then(Value::as_str)
                    .or_else(|| payload.get("text").and_then(Value::as_str))
                {
                    engine.push_text(text);
                }
            }
            "messageStop" | "messageStopEvent" => {
                engine.close_tool();
                open_tool_id = None;
            }
            other => {
                log::debug!("ignoring CWR event type {}", other);
            }
        }
    }
}

// ============================== API types ==============================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAssistantRequest {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: String,
    pub conversation_id: String,
    pub current_message: CurrentMessage,
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HistoryTurn {
    #[serde(rename_all = "camelCase")]
    User { user_input_message: UserInputMessage },
    #[serde(rename_all = "camelCase")]
    Assistant {
        assistant_response_message: AssistantResponseMessage,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<CwrTool>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    pub tool_uses: Vec<CwrToolUse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CwrToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CwrTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInputSchema {
    pub json: Value,
}
