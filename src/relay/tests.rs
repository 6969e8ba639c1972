// End-to-end scenarios across the relay core: canonical request in, mock
// upstream wire bytes back, canonical response or event sequence out.

use crate::relay::binding::{ProviderBinding, ProviderKind, RotationPolicy};
use crate::relay::credentials::{CredentialManager, MemStore, RefreshedTokens, TokenRefresher};
use crate::relay::eventstream;
use crate::relay::strategy;
use crate::relay::transport::{HttpTransport, UpstreamBody, UpstreamRequest, UpstreamResponse};
use crate::relay::types::*;
use crate::relay::ProviderClient;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_test_logging() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

struct ScriptedTransport {
    responses: Mutex<VecDeque<(u16, Bytes)>>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<(u16, Bytes)>) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request(&self, index: usize) -> UpstreamRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    fn pop(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        self.requests.lock().unwrap().push(req);
        let (status, body) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted transport exhausted");
        Ok(UpstreamResponse {
            status,
            body: UpstreamBody::Full(body),
        })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        self.pop(req)
    }

    async fn post_stream(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        self.pop(req)
    }
}

struct RecordingRefresher {
    refreshed: Mutex<Vec<String>>,
}

impl RecordingRefresher {
    fn new() -> Arc<Self> {
        Arc::new(RecordingRefresher {
            refreshed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl TokenRefresher for RecordingRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RelayError> {
        self.refreshed.lock().unwrap().push(refresh_token.to_string());
        Ok(RefreshedTokens {
            access_token: "refreshed-token".to_string(),
            refresh_token: None,
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(8)),
        })
    }
}

async fn credentials(
    names: &[&str],
    refresher: Arc<dyn TokenRefresher>,
) -> Arc<CredentialManager> {
    let store = MemStore::new();
    for name in names {
        store.insert(
            *name,
            serde_json::json!({
                "accessToken": format!("token-{}", name),
                "refreshToken": format!("refresh-{}", name),
            })
            .to_string(),
        );
    }
    let paths: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    Arc::new(
        CredentialManager::load(
            "scenario",
            &paths,
            RotationPolicy {
                cooldown_ms: 0,
                refresh_backoff_ms: 0,
                ..RotationPolicy::default()
            },
            Arc::new(store),
            refresher,
        )
        .await,
    )
}

fn cwr_binding() -> ProviderBinding {
    ProviderBinding::new("cwr", ProviderKind::Cwr, "https://cwr.test")
}

fn one_turn(prompt: &str, model: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        max_tokens: 1024,
        temperature: None,
        stream: false,
        tools: None,
        system: None,
        metadata: RequestMeta {
            request_id: "req-scenario".to_string(),
            ..RequestMeta::default()
        },
    }
}

#[tokio::test]
async fn test_cwr_plain_text() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&eventstream::encode_event(
        "assistantResponseEvent",
        &serde_json::json!({"content": "4"}),
    ));
    wire.extend_from_slice(&eventstream::encode_event(
        "messageStop",
        &serde_json::json!({}),
    ));
    let transport = ScriptedTransport::new(vec![(200, Bytes::from(wire))]);
    let client = ProviderClient::new(
        cwr_binding(),
        credentials(&["a.json"], RecordingRefresher::new()).await,
        transport,
    );

    let resp = client.send(&one_turn("What is 2+2?", "claude-x")).await.unwrap();
    assert_eq!(resp.content, vec![ContentBlock::text("4")]);
    assert_eq!(resp.stop_reason, None);
    assert_eq!(resp.model, "claude-x");
    assert_eq!(resp.role, Role::Assistant);
}

#[tokio::test]
async fn test_cwr_text_form_tool_call() {
    let wire = eventstream::encode_event(
        "assistantResponseEvent",
        &serde_json::json!({
            "content": "Tool call: WebSearch({\"query\":\"k8s autoscaling\"})"
        }),
    );
    let transport = ScriptedTransport::new(vec![(200, Bytes::from(wire))]);
    let client = ProviderClient::new(
        cwr_binding(),
        credentials(&["a.json"], RecordingRefresher::new()).await,
        transport,
    );

    let resp = client
        .send(&one_turn("search the web for k8s autoscaling", "claude-x"))
        .await
        .unwrap();
    assert_eq!(resp.content.len(), 1);
    match &resp.content[0] {
        ContentBlock::ToolUse { id, name, input, .. } => {
            assert_eq!(name, "WebSearch");
            assert_eq!(input, &serde_json::json!({"query": "k8s autoscaling"}));
            let re = regex::Regex::new(r"^tool_\d+_[A-Za-z0-9]{6}$").unwrap();
            assert!(re.is_match(id), "id {} does not match the expected shape", id);
        }
        other => panic!("expected a tool use block, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cwr_fragmented_tool_call() {
    let mut wire = Vec::new();
    for fragment in ["{\"a", "\":1,\"b", "\":2}"] {
        wire.extend_from_slice(&eventstream::encode_event(
            "toolUseEvent",
            &serde_json::json!({"toolUseId": "T1", "name": "Calc", "input": fragment}),
        ));
    }
    wire.extend_from_slice(&eventstream::encode_event(
        "toolUseEvent",
        &serde_json::json!({"toolUseId": "T1", "name": "Calc", "stop": true}),
    ));
    let transport = ScriptedTransport::new(vec![(200, Bytes::from(wire))]);
    let client = ProviderClient::new(
        cwr_binding(),
        credentials(&["a.json"], RecordingRefresher::new()).await,
        transport,
    );

    let resp = client.send(&one_turn("add 1 and 2", "claude-x")).await.unwrap();
    assert_eq!(
        resp.content,
        vec![ContentBlock::tool_use(
            "T1",
            "Calc",
            serde_json::json!({"a": 1, "b": 2})
        )]
    );
}

#[tokio::test]
async fn test_credential_rotation_on_auth_failure() {
    init_test_logging();
    let refresher = RecordingRefresher::new();
    let creds = credentials(&["a.json", "b.json"], refresher.clone()).await;

    let ok_body = {
        let wire = eventstream::encode_event(
            "assistantResponseEvent",
            &serde_json::json!({"content": "ok"}),
        );
        Bytes::from(wire)
    };
    let transport = ScriptedTransport::new(vec![(401, Bytes::from("expired")), (200, ok_body)]);
    let client = ProviderClient::new(cwr_binding(), creds.clone(), transport.clone())
        .with_retry_base(Duration::from_millis(1));

    client.send(&one_turn("hello", "claude-x")).await.unwrap();

    // Round robin tried A first; the 401 reported a failure and kicked off
    // a refresh, then the retry picked B and succeeded.
    let first = transport.request(0);
    let second = transport.request(1);
    assert_eq!(
        first.headers[0].1, "Bearer token-a.json",
        "first attempt should use credential A"
    );
    assert_eq!(second.headers[0].1, "Bearer token-b.json");

    assert_eq!(creds.state_of("a.json").unwrap().consecutive_errors, 1);
    let b = creds.state_of("b.json").unwrap();
    assert_eq!(b.consecutive_errors, 0);
    assert_eq!(b.successful_requests, 1);
    assert_eq!(
        refresher.refreshed.lock().unwrap().as_slice(),
        ["refresh-a.json"]
    );
}

#[tokio::test]
async fn test_openai_streaming_tool_call_sequence() {
    let chunks = [
        serde_json::json!({"id": "chatcmpl-1", "model": "gpt-x",
            "choices": [{"delta": {"role": "assistant"}, "finish_reason": null}]}),
        serde_json::json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "c1", "function": {"name": "f"}}]}, "finish_reason": null}]}),
        serde_json::json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"x"}}]}, "finish_reason": null}]}),
        serde_json::json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\":"}}]}, "finish_reason": null}]}),
        serde_json::json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "1}"}}]}, "finish_reason": null}]}),
        serde_json::json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
    ];
    let mut sse = String::new();
    for chunk in &chunks {
        sse.push_str(&format!("data: {}\n\n", chunk));
    }
    sse.push_str("data: [DONE]\n\n");

    let transport = ScriptedTransport::new(vec![(200, Bytes::from(sse))]);
    let binding = ProviderBinding::new("oai", ProviderKind::OpenaiCompatible, "https://oai.test");
    let client = ProviderClient::new(
        binding,
        credentials(&["a.json"], RecordingRefresher::new()).await,
        transport,
    );

    let mut req = one_turn("use the tool", "gpt-x");
    req.stream = true;
    let events: Vec<StreamEvent> = client
        .stream(&req)
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;

    strategy::validate_envelope(&events).unwrap();
    assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
    assert!(matches!(events[1], StreamEvent::Ping));
    match &events[2] {
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::ToolUse { id, name, input, .. },
        } => {
            assert_eq!(id, "c1");
            assert_eq!(name, "f");
            assert_eq!(input, &serde_json::json!({}));
        }
        other => panic!("expected tool-use block start, got {:?}", other),
    }
    let json_deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::InputJsonDelta { partial_json },
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(json_deltas.len(), 3);
    assert_eq!(json_deltas.concat(), "{\"x\":1}");
    assert!(matches!(events[6], StreamEvent::ContentBlockStop { index: 0 }));
    assert!(matches!(
        &events[7],
        StreamEvent::MessageDelta { delta, .. }
            if delta.stop_reason == Some(StopReason::ToolUse)
    ));
    assert!(matches!(events[8], StreamEvent::MessageStop));
}

#[tokio::test]
async fn test_gemini_schema_stripping_end_to_end() {
    let ok = serde_json::json!({
        "candidates": [{"content": {"role": "model", "parts": [{"text": "done"}]},
            "finishReason": "STOP"}],
    });
    let transport = ScriptedTransport::new(vec![(200, Bytes::from(ok.to_string()))]);
    let binding = ProviderBinding::new("gem", ProviderKind::Gemini, "https://gem.test");
    let client = ProviderClient::new(
        binding,
        credentials(&["g.json"], RecordingRefresher::new()).await,
        transport.clone(),
    );

    let mut req = one_turn("search", "gemini-x");
    req.tools = Some(vec![ToolSpec {
        name: "search".to_string(),
        description: Some("search things".to_string()),
        input_schema: serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {"q": {"type": "string", "minLength": 1}},
            "required": ["q"],
        }),
    }]);
    client.send(&req).await.unwrap();

    let body = transport.request(0).body;
    let parameters = &body["tools"][0]["functionDeclarations"][0]["parameters"];
    let keys: Vec<&str> = parameters
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys.len(), 3);
    for key in ["type", "properties", "required"] {
        assert!(keys.contains(&key), "missing {} in {:?}", key, keys);
    }
    let q = parameters["properties"]["q"].as_object().unwrap();
    assert_eq!(q.len(), 1);
    assert_eq!(q["type"], "string");
}

#[tokio::test]
async fn test_anthropic_passthrough_round_trip() {
    let upstream_response = serde_json::json!({
        "id": "msg_up",
        "model": "claude-x",
        "role": "assistant",
        "content": [{"type": "text", "text": "pong"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 2, "output_tokens": 1}
    });
    let transport = ScriptedTransport::new(vec![(200, Bytes::from(upstream_response.to_string()))]);
    let mut binding = ProviderBinding::new(
        "anthropic",
        ProviderKind::AnthropicPassthrough,
        "https://api.anthropic.test",
    );
    binding.credential_paths = vec!["k.json".to_string()];
    binding.rotation.cooldown_ms = 0;

    let store = MemStore::new();
    store.insert(
        "k.json",
        serde_json::json!({"accessToken": "token-k.json", "refreshToken": "r"}).to_string(),
    );
    let creds = Arc::new(
        CredentialManager::for_binding(&binding, Arc::new(store), RecordingRefresher::new()).await,
    );
    let client = ProviderClient::new(binding, creds, transport.clone());

    let resp = client.send(&one_turn("ping", "claude-x")).await.unwrap();
    assert_eq!(resp.content, vec![ContentBlock::text("pong")]);
    assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));

    let sent = transport.request(0);
    assert_eq!(sent.url, "https://api.anthropic.test/v1/messages");
    assert!(sent
        .headers
        .contains(&("x-api-key".to_string(), "token-k.json".to_string())));
    assert!(sent
        .headers
        .contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
    assert_eq!(sent.body["messages"][0]["content"], "ping");
}
