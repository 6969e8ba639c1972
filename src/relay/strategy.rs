// Streaming strategy selector for CWR. The upstream is called
// non-streaming on the wire even when the caller wants streaming; the
// relay simulates streaming from the buffered response, choosing between
// three processing strategies with a cheap probe.
//
// The probe only selects a strategy; the reconstruction engine stays
// authoritative for correctness. The selector commits to the first
// strategy whose output passes the envelope invariant checks and falls
// back to Buffered otherwise, so downstream callers always see exactly one
// valid event sequence.

use crate::relay::binding::ProviderBinding;
use crate::relay::cwr;
use crate::relay::eventstream::{self, DecodedEvent};
use crate::relay::types::{
    BlockDelta, ChatResponse, ContentBlock, MessageDeltaBody, RelayError, StreamEvent,
};

/// Probe window for tool-call hints.
const PROBE_WINDOW: usize = 1024;
/// Buffers under this size stream directly without batching.
const SMALL_BUFFER: usize = 8 * 1024;
/// Fragments at most this long are merge candidates for batching.
const BATCH_FRAGMENT_LEN: usize = 10;
/// At most this many fragments merge into one batch.
const BATCH_SIZE: usize = 50;
/// Text delta chunk size in the buffered synthesiser, in characters.
const TEXT_CHUNK: usize = 50;
/// Input-JSON delta chunk size in the buffered synthesiser, in characters.
const JSON_CHUNK: usize = 20;

const TOOL_HINTS: &[&str] = &["tool_use", "function_call", "Tool call:", "\"type\": \"tool_use\""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingStrategy {
    Direct,
    Batched,
    Buffered,
}

/// Pick a strategy from the buffered response bytes.
pub fn choose_strategy(buf: &[u8]) -> StreamingStrategy {
    let window = &buf[..buf.len().min(PROBE_WINDOW)];
    let probe = String::from_utf8_lossy(window);
    if TOOL_HINTS.iter().any(|hint| probe.contains(hint)) {
        return StreamingStrategy::Buffered;
    }
    if buf.len() < SMALL_BUFFER {
        StreamingStrategy::Direct
    } else {
        StreamingStrategy::Batched
    }
}

/// Simulate a downstream event stream from a buffered CWR response.
pub fn simulate_stream(
    buf: &[u8],
    binding: &ProviderBinding,
    requested_model: &str,
) -> Result<Vec<StreamEvent>, RelayError> {
    let strategy = choose_strategy(buf);
    let first_attempt = match strategy {
        StreamingStrategy::Direct => run_direct(buf, requested_model),
        StreamingStrategy::Batched => run_batched(buf, requested_model),
        StreamingStrategy::Buffered => run_buffered(buf, binding, requested_model),
    };

    let needs_fallback = match &first_attempt {
        Ok(events) => validate_envelope(events).is_err(),
        Err(_) => true,
    };
    if !needs_fallback {
        return first_attempt;
    }
    if strategy == StreamingStrategy::Buffered {
        // Buffered is the fallback; nothing left to try.
        return first_attempt;
    }

    log::warn!(
        "{:?} streaming strategy failed for a CWR response; falling back to buffered",
        strategy
    );
    let events = run_buffered(buf, binding, requested_model)?;
    validate_envelope(&events).map_err(RelayError::UpstreamParse)?;
    Ok(events)
}

// ============================================================================
// Direct and batched
// ============================================================================

/// Text fragments from decoded events, or an error when the buffer holds
/// anything a plain-text strategy cannot represent.
fn text_fragments(buf: &[u8]) -> Result<Vec<String>, RelayError> {
    let outcome = eventstream::decode_events(buf);
    if outcome.events.is_empty() {
        return Err(RelayError::UpstreamParse(
            "CWR response contained no decodable events".to_string(),
        ));
    }
    let mut fragments = Vec::new();
    for event in &outcome.events {
        if event.payload.get("toolUseId").is_some() {
            // The probe missed a tool call; this strategy cannot carry it.
            return Err(RelayError::UpstreamParse(
                "tool events in a text-only strategy".to_string(),
            ));
        }
        if let Some(text) = fragment_text(event) {
            if !text.is_empty() {
                fragments.push(text.to_string());
            }
        }
    }
    Ok(fragments)
}

fn fragment_text(event: &DecodedEvent) -> Option<&str> {
    match event.event_type.as_str() {
        "assistantResponseEvent" | "followupPromptEvent" => event
            .payload
            .get("content")
            .and_then(serde_json::Value::as_str)
            .or_else(|| event.payload.get("text").and_then(serde_json::Value::as_str)),
        _ => None,
    }
}

fn run_direct(buf: &[u8], requested_model: &str) -> Result<Vec<StreamEvent>, RelayError> {
    let fragments = text_fragments(buf)?;
    Ok(wrap_text_deltas(fragments, requested_model))
}

fn run_batched(buf: &[u8], requested_model: &str) -> Result<Vec<StreamEvent>, RelayError> {
    let fragments = text_fragments(buf)?;
    let mut batched: Vec<String> = Vec::new();
    let mut batch = String::new();
    let mut batch_len = 0usize;
    for fragment in fragments {
        let small = fragment.chars().count() <= BATCH_FRAGMENT_LEN;
        if small && batch_len < BATCH_SIZE {
            batch.push_str(&fragment);
            batch_len += 1;
            continue;
        }
        if !batch.is_empty() {
            batched.push(std::mem::take(&mut batch));
            batch_len = 0;
        }
        if small {
            batch.push_str(&fragment);
            batch_len = 1;
        } else {
            batched.push(fragment);
        }
    }
    if !batch.is_empty() {
        batched.push(batch);
    }
    Ok(wrap_text_deltas(batched, requested_model))
}

/// Wrap text deltas in a minimal valid envelope.
fn wrap_text_deltas(fragments: Vec<String>, requested_model: &str) -> Vec<StreamEvent> {
    let mut events = Vec::with_capacity(fragments.len() + 6);
    events.push(StreamEvent::MessageStart {
        message: ChatResponse::skeleton(
            format!("msg_{}", uuid::Uuid::new_v4().simple()),
            requested_model,
        ),
    });
    events.push(StreamEvent::Ping);
    events.push(StreamEvent::ContentBlockStart {
        index: 0,
        content_block: ContentBlock::text(""),
    });
    for fragment in fragments {
        events.push(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta { text: fragment },
        });
    }
    events.push(StreamEvent::ContentBlockStop { index: 0 });
    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: Some(crate::relay::types::StopReason::EndTurn),
            stop_sequence: None,
        },
        usage: None,
    });
    events.push(StreamEvent::MessageStop);
    events
}

// ============================================================================
// Buffered
// ============================================================================

/// Reconstruct the complete response, then synthesise the event sequence.
fn run_buffered(
    buf: &[u8],
    binding: &ProviderBinding,
    requested_model: &str,
) -> Result<Vec<StreamEvent>, RelayError> {
    let response = cwr::parse_response(buf, binding, requested_model)?;
    Ok(synthesize_events(&response))
}

/// Turn a complete response into a streaming sequence: skeleton start, a
/// ping, then each block streamed in bounded chunks.
pub fn synthesize_events(response: &ChatResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    events.push(StreamEvent::MessageStart {
        message: ChatResponse::skeleton(response.id.clone(), response.model.clone()),
    });
    events.push(StreamEvent::Ping);

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::text(""),
                });
                for chunk in char_chunks(text, TEXT_CHUNK) {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::TextDelta { text: chunk },
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
            }
            ContentBlock::ToolUse {
                id, name, input, ..
            } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::tool_use(
                        id.clone(),
                        name.clone(),
                        serde_json::json!({}),
                    ),
                });
                for chunk in char_chunks(&input.to_string(), JSON_CHUNK) {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: chunk,
                        },
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
            }
            ContentBlock::ToolResult { .. } => {
                // Assistant output never carries tool results.
            }
        }
    }

    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: Some(response.derived_stop_reason()),
            stop_sequence: None,
        },
        usage: None,
    });
    events.push(StreamEvent::MessageStop);
    events
}

fn char_chunks(text: &str, size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for (count, ch) in text.chars().enumerate() {
        if count > 0 && count % size == 0 {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ============================================================================
// Envelope invariants
// ============================================================================

/// Check the streaming invariants a downstream consumer relies on. The
/// selector commits to a strategy only when its output passes.
pub fn validate_envelope(events: &[StreamEvent]) -> Result<(), String> {
    if !matches!(events.first(), Some(StreamEvent::MessageStart { .. })) {
        return Err("sequence must begin with message_start".to_string());
    }
    if !matches!(events.last(), Some(StreamEvent::MessageStop)) {
        return Err("sequence must end with message_stop".to_string());
    }

    let mut starts = 0usize;
    let mut stops = 0usize;
    let mut open: Option<usize> = None;
    let mut next_index = 0usize;
    let mut saw_message_delta = false;

    for (position, event) in events.iter().enumerate() {
        match event {
            StreamEvent::MessageStart { .. } => {
                if position != 0 {
                    return Err("message_start must be the first event".to_string());
                }
            }
            StreamEvent::MessageStop => {
                if position != events.len() - 1 {
                    return Err("message_stop must be the last event".to_string());
                }
                if !saw_message_delta {
                    return Err("message_delta must precede message_stop".to_string());
                }
            }
            StreamEvent::MessageDelta { .. } => saw_message_delta = true,
            StreamEvent::ContentBlockStart { index, .. } => {
                if open.is_some() {
                    return Err(format!("block {} started while another is open", index));
                }
                if *index != next_index {
                    return Err(format!(
                        "non-contiguous block index {} (expected {})",
                        index, next_index
                    ));
                }
                open = Some(*index);
                starts += 1;
            }
            StreamEvent::ContentBlockDelta { index, .. } => {
                if open != Some(*index) {
                    return Err(format!("delta for block {} outside start/stop", index));
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if open != Some(*index) {
                    return Err(format!("stop for block {} that is not open", index));
                }
                open = None;
                next_index += 1;
                stops += 1;
            }
            StreamEvent::Ping => {}
        }
    }

    if open.is_some() {
        return Err("a content block was never closed".to_string());
    }
    if starts != stops {
        return Err(format!("{} starts but {} stops", starts, stops));
    }
    Ok(())
}
