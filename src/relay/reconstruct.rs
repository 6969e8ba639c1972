// Tool-call reconstruction engine.
//
// Upstreams sometimes emit tool calls as free-form text inside an assistant
// message instead of structured blocks. Three shapes are recovered:
//
//   1. `Tool call: Name({...})` with a balanced-braces object literal
//   2. `<Name>inner</Name>`, where `inner` becomes `{"query": inner}` for
//      tools known to take a single string argument
//   3. provider-native fragmented events: one event opens the tool with
//      {toolUseId, name}, later events append input JSON, a terminal event
//      closes it
//
// Forms 1 and 2 come from text scanning, form 3 from an event state
// machine. The two sources never cross-contaminate: fragmented input is
// accumulated verbatim and never rescanned as narration text.

use crate::relay::types::ContentBlock;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;

/// Tools whose XML-ish textual form carries a single string argument.
const SINGLE_STRING_ARG_TOOLS: &[&str] = &["WebSearch", "WebFetch", "Search", "Grep"];

// ============================================================================
// Reconstructor
// ============================================================================

#[derive(Debug)]
struct ActiveTool {
    id: String,
    name: String,
    json_fragments: String,
}

/// Accumulates text and tool fragments from one assistant response and
/// produces the final ordered content-block list.
#[derive(Debug)]
pub struct ToolCallReconstructor {
    text_buffer: String,
    active_tool: Option<ActiveTool>,
    emitted: Vec<ContentBlock>,
    used_ids: HashSet<String>,
    single_arg_tools: HashSet<String>,
}

impl Default for ToolCallReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallReconstructor {
    pub fn new() -> Self {
        ToolCallReconstructor {
            text_buffer: String::new(),
            active_tool: None,
            emitted: Vec::new(),
            used_ids: HashSet::new(),
            single_arg_tools: SINGLE_STRING_ARG_TOOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Register an extra tool name whose XML form takes one string argument.
    pub fn with_single_arg_tool(mut self, name: impl Into<String>) -> Self {
        self.single_arg_tools.insert(name.into());
        self
    }

    /// Append narration text and rescan for complete textual tool calls.
    pub fn push_text(&mut self, text: &str) {
        self.text_buffer.push_str(text);
        self.scan_text_buffer();
    }

    /// A fragmented tool call opened (form 3). Closes any prior open tool.
    pub fn open_tool(&mut self, id: impl Into<String>, name: impl Into<String>) {
        self.close_tool();
        self.active_tool = Some(ActiveTool {
            id: id.into(),
            name: name.into(),
            json_fragments: String::new(),
        });
    }

    /// Append an input JSON fragment to the open tool call.
    pub fn append_tool_input(&mut self, fragment: &str) {
        match &mut self.active_tool {
            Some(tool) => tool.json_fragments.push_str(fragment),
            None => {
                log::warn!("tool input fragment arrived with no open tool call; dropping");
            }
        }
    }

    /// Close the open tool call, parsing (or repairing) its input.
    pub fn close_tool(&mut self) {
        if let Some(tool) = self.active_tool.take() {
            self.used_ids.insert(tool.id.clone());
            let (input, repair_failed) = repair_input(&tool.json_fragments);
            self.emitted.push(ContentBlock::ToolUse {
                id: tool.id,
                name: tool.name,
                input,
                input_repair_failed: repair_failed,
                raw_input: if repair_failed {
                    Some(tool.json_fragments)
                } else {
                    None
                },
            });
        }
    }

    /// End of stream: close the open tool and flush residual narration.
    pub fn finish(mut self) -> Vec<ContentBlock> {
        self.close_tool();
        self.flush_text_through(self.text_buffer.len());
        self.emitted
    }

    /// Convenience for the single-string input form.
    pub fn reconstruct_text(text: &str) -> Vec<ContentBlock> {
        let mut engine = ToolCallReconstructor::new();
        engine.push_text(text);
        engine.finish()
    }

    // ------------------------------------------------------------------
    // Text scanning
    // ------------------------------------------------------------------

    fn scan_text_buffer(&mut self) {
        loop {
            // Form 1 is checked before form 2.
            let matched = match find_call_form(&self.text_buffer) {
                Some(m) => m,
                None => match self.find_xml_form() {
                    Some(m) => m,
                    None => return,
                },
            };

            self.flush_text_through(matched.start);
            // The matched substring was flushed out of the buffer by
            // flush_text_through relative to the old start, so recompute.
            let len = matched.end - matched.start;
            self.text_buffer.drain(..len);

            let id = self.next_tool_id();
            let (input, repair_failed) = matched.input;
            self.emitted.push(ContentBlock::ToolUse {
                id,
                name: matched.name,
                input,
                input_repair_failed: repair_failed,
                raw_input: matched.raw,
            });
        }
    }

    fn find_xml_form(&self) -> Option<TextMatch> {
        let (start, name, inner, end) = find_first_xml_pair(&self.text_buffer)?;
        let (input, repair_failed, raw) = if self.single_arg_tools.contains(&name) {
            (serde_json::json!({ "query": inner }), false, None)
        } else {
            match serde_json::from_str::<serde_json::Value>(&inner) {
                Ok(value) if value.is_object() => (value, false, None),
                _ => {
                    let (value, failed) = repair_input(&inner);
                    let raw = if failed { Some(inner.clone()) } else { None };
                    (value, failed, raw)
                }
            }
        };
        Some(TextMatch {
            start,
            end,
            name,
            input: (input, repair_failed),
            raw,
        })
    }

    fn flush_text_through(&mut self, end: usize) {
        if end == 0 {
            return;
        }
        let text: String = self.text_buffer.drain(..end).collect();
        if !text.is_empty() {
            self.emitted.push(ContentBlock::text(text));
        }
    }

    fn next_tool_id(&mut self) -> String {
        loop {
            let id = synthesize_tool_id();
            if self.used_ids.insert(id.clone()) {
                return id;
            }
        }
    }
}

struct TextMatch {
    start: usize,
    end: usize,
    name: String,
    input: (serde_json::Value, bool),
    raw: Option<String>,
}

/// Find a complete `Tool call: Name({...})` occurrence.
fn find_call_form(buf: &str) -> Option<TextMatch> {
    const MARKER: &str = "Tool call: ";
    let mut search_from = 0;
    while let Some(rel) = buf[search_from..].find(MARKER) {
        let start = search_from + rel;
        let after_marker = &buf[start + MARKER.len()..];

        if let Some((name, rest_offset)) = take_identifier(after_marker) {
            let rest = &after_marker[rest_offset..];
            if let Some(stripped) = rest.strip_prefix('(') {
                if stripped.starts_with('{') {
                    if let Some(obj_len) = balanced_object_len(stripped) {
                        if stripped[obj_len..].starts_with(')') {
                            let object = &stripped[..obj_len];
                            let end = start
                                + MARKER.len()
                                + rest_offset
                                + 1 // '('
                                + obj_len
                                + 1; // ')'
                            let (input, repair_failed) = repair_input(object);
                            let raw = if repair_failed {
                                Some(object.to_string())
                            } else {
                                None
                            };
                            return Some(TextMatch {
                                start,
                                end,
                                name: name.to_string(),
                                input: (input, repair_failed),
                                raw,
                            });
                        }
                    }
                    // Object still incomplete: wait for more text.
                    return None;
                }
            }
        }
        search_from = start + MARKER.len();
    }
    None
}

/// First balanced `<Name>...</Name>` pair. The XML grammar here is
/// deliberately loose; the first complete pair is authoritative even when
/// the inner content nests tags of the same name.
fn find_first_xml_pair(buf: &str) -> Option<(usize, String, String, usize)> {
    let mut search_from = 0;
    while let Some(rel) = buf[search_from..].find('<') {
        let start = search_from + rel;
        let after = &buf[start + 1..];
        if let Some((name, name_len)) = take_identifier(after) {
            if after[name_len..].starts_with('>') {
                let inner_start = start + 1 + name_len + 1;
                let closing = format!("</{}>", name);
                if let Some(close_rel) = buf[inner_start..].find(&closing) {
                    let inner = buf[inner_start..inner_start + close_rel].to_string();
                    let end = inner_start + close_rel + closing.len();
                    return Some((start, name.to_string(), inner, end));
                }
            }
        }
        search_from = start + 1;
    }
    None
}

fn take_identifier(s: &str) -> Option<(&str, usize)> {
    let mut len = 0;
    for (i, ch) in s.char_indices() {
        let ok = if i == 0 {
            ch.is_ascii_alphabetic() || ch == '_'
        } else {
            ch.is_ascii_alphanumeric() || ch == '_'
        };
        if ok {
            len = i + ch.len_utf8();
        } else {
            break;
        }
    }
    if len == 0 {
        None
    } else {
        Some((&s[..len], len))
    }
}

/// Length of the balanced `{...}` object starting at byte 0 of `s`, aware of
/// string literals and escapes. None when the object is not yet complete.
fn balanced_object_len(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Input repair
// ============================================================================

/// Parse accumulated tool input, repairing what can be repaired without
/// fabricating argument values. Returns the parsed object and whether the
/// repair failed (raw input should then be retained for diagnostics).
pub fn repair_input(raw: &str) -> (serde_json::Value, bool) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (serde_json::json!({}), false);
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return (value, false);
        }
    }
    // Empty between the outermost braces means nothing was lost.
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close && trimmed[open + 1..close].trim().is_empty() {
            return (serde_json::json!({}), false);
        }
    }
    (serde_json::json!({}), true)
}

/// Synthesize a tool-use id for calls reconstructed from text.
pub fn synthesize_tool_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("tool_{}_{}", millis, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::ContentBlock;

    fn tool_uses(blocks: &[ContentBlock]) -> Vec<(&str, &serde_json::Value)> {
        blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, input, .. } => Some((name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_call_form_recovers_single_tool_use() {
        let blocks = ToolCallReconstructor::reconstruct_text(
            r#"Tool call: WebSearch({"query":"k8s autoscaling"})"#,
        );
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::ToolUse { id, name, input, .. } => {
                assert_eq!(name, "WebSearch");
                assert_eq!(input["query"], "k8s autoscaling");
                let re = regex::Regex::new(r"^tool_\d+_[A-Za-z0-9]{6}$").unwrap();
                assert!(re.is_match(id), "unexpected id shape: {}", id);
            }
            other => panic!("expected tool use, got {:?}", other),
        }
    }

    #[test]
    fn test_call_form_with_surrounding_text() {
        let blocks = ToolCallReconstructor::reconstruct_text(
            r#"Let me look that up. Tool call: Calc({"a":1}) Done."#,
        );
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], ContentBlock::text("Let me look that up. "));
        assert!(blocks[1].is_tool_use());
        assert_eq!(blocks[2], ContentBlock::text(" Done."));
    }

    #[test]
    fn test_call_form_braces_inside_strings() {
        let blocks = ToolCallReconstructor::reconstruct_text(
            r#"Tool call: Write({"content":"fn main() { }"})"#,
        );
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1["content"], "fn main() { }");
    }

    #[test]
    fn test_call_form_split_across_fragments() {
        let mut engine = ToolCallReconstructor::new();
        engine.push_text("Tool call: WebSearch({\"query\":");
        engine.push_text("\"rust\"})");
        let blocks = engine.finish();
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1["query"], "rust");
    }

    #[test]
    fn test_xml_form_known_single_arg_tool() {
        let blocks = ToolCallReconstructor::reconstruct_text("<WebSearch>rust streams</WebSearch>");
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "WebSearch");
        assert_eq!(uses[0].1["query"], "rust streams");
    }

    #[test]
    fn test_xml_form_json_object_inner() {
        let blocks =
            ToolCallReconstructor::reconstruct_text(r#"<Calc>{"a":1,"b":2}</Calc>"#);
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1["a"], 1);
    }

    #[test]
    fn test_xml_form_first_pair_wins() {
        let blocks =
            ToolCallReconstructor::reconstruct_text("<WebSearch>a</WebSearch><WebSearch>b</WebSearch>");
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].1["query"], "a");
        assert_eq!(uses[1].1["query"], "b");
    }

    #[test]
    fn test_fragmented_tool_call() {
        let mut engine = ToolCallReconstructor::new();
        engine.open_tool("T1", "Calc");
        engine.append_tool_input("{\"a");
        engine.append_tool_input("\":1,\"b");
        engine.append_tool_input("\":2}");
        engine.close_tool();
        let blocks = engine.finish();
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::ToolUse { id, name, input, .. } => {
                assert_eq!(id, "T1");
                assert_eq!(name, "Calc");
                assert_eq!(input["a"], 1);
                assert_eq!(input["b"], 2);
            }
            other => panic!("expected tool use, got {:?}", other),
        }
    }

    #[test]
    fn test_new_fragmented_open_closes_prior() {
        let mut engine = ToolCallReconstructor::new();
        engine.open_tool("T1", "First");
        engine.append_tool_input("{\"x\":1}");
        engine.open_tool("T2", "Second");
        engine.append_tool_input("{}");
        let blocks = engine.finish();
        let uses = tool_uses(&blocks);
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "First");
        assert_eq!(uses[1].0, "Second");
    }

    #[test]
    fn test_incomplete_input_repair() {
        let mut engine = ToolCallReconstructor::new();
        engine.open_tool("T1", "Calc");
        engine.append_tool_input("{\"a\": 1, \"b\":");
        let blocks = engine.finish();
        match &blocks[0] {
            ContentBlock::ToolUse {
                input,
                input_repair_failed,
                raw_input,
                ..
            } => {
                assert_eq!(input, &serde_json::json!({}));
                assert!(input_repair_failed);
                assert_eq!(raw_input.as_deref(), Some("{\"a\": 1, \"b\":"));
            }
            other => panic!("expected tool use, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_braces_repair_cleanly() {
        assert_eq!(repair_input("{  }"), (serde_json::json!({}), false));
        assert_eq!(repair_input(""), (serde_json::json!({}), false));
        assert_eq!(repair_input("{\"a\":"), (serde_json::json!({}), true));
    }

    #[test]
    fn test_trailing_text_flushes() {
        let mut engine = ToolCallReconstructor::new();
        engine.push_text("plain answer");
        let blocks = engine.finish();
        assert_eq!(blocks, vec![ContentBlock::text("plain answer")]);
    }

    #[test]
    fn test_text_and_fragmented_do_not_cross_contaminate() {
        let mut engine = ToolCallReconstructor::new();
        engine.push_text("Narration ");
        engine.open_tool("T1", "Calc");
        engine.append_tool_input(r#"{"contains":"Tool call: Fake({})"}"#);
        engine.close_tool();
        let blocks = engine.finish();
        let uses = tool_uses(&blocks);
        // The embedded marker inside the fragmented input is data, not text.
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "Calc");
        assert_eq!(uses[0].1["contains"], "Tool call: Fake({})");
    }

    #[test]
    fn test_synthesized_ids_unique() {
        let mut engine = ToolCallReconstructor::new();
        engine.push_text(r#"Tool call: A({}) Tool call: B({})"#);
        let blocks = engine.finish();
        let ids: Vec<_> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }
}
