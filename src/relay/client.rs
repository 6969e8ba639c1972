// Provider client: one per binding. Validates canonical requests, acquires
// credentials, invokes the right translator, performs the HTTP call through
// the transport seam, and maps failures into the error taxonomy.
//
// Recovery is bounded: one credential rotation on an auth failure, up to
// three retries with exponential backoff on transients, one strategy
// fallback inside the CWR streaming path. Everything else surfaces.

use crate::relay::binding::{ProviderBinding, ProviderKind};
use crate::relay::credentials::{AcquiredCredential, CredentialManager};
use crate::relay::transport::{HttpTransport, UpstreamBody, UpstreamRequest, UpstreamResponse};
use crate::relay::types::{ChatRequest, ChatResponse, RelayError, StreamEvent};
use crate::relay::{anthropic, cwr, gemini, openai, strategy};
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Maximum retries for transient failures.
const TRANSIENT_RETRIES: u32 = 3;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, RelayError>> + Send>>;

pub struct ProviderClient {
    binding: ProviderBinding,
    credentials: Arc<CredentialManager>,
    transport: Arc<dyn HttpTransport>,
    /// Base delay for transient backoff; `base * 2^attempt`.
    retry_base: Duration,
}

impl ProviderClient {
    pub fn new(
        binding: ProviderBinding,
        credentials: Arc<CredentialManager>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        ProviderClient {
            binding,
            credentials,
            transport,
            retry_base: Duration::from_secs(1),
        }
    }

    /// Override the transient backoff base. Tests use a short base.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn binding(&self) -> &ProviderBinding {
        &self.binding
    }

    // ------------------------------------------------------------------
    // Non-streaming
    // ------------------------------------------------------------------

    pub async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, RelayError> {
        req.validate()?;
        let upstream_model = self.binding.upstream_model(&req.model);

        let (_credential, response) = self.call_with_retries(req, &upstream_model, false).await?;
        let bytes = response.into_bytes().await?;

        let response = match self.binding.kind {
            ProviderKind::Cwr => cwr::parse_response(&bytes, &self.binding, &req.model)?,
            ProviderKind::OpenaiCompatible => openai::parse_response(&bytes, &req.model)?,
            ProviderKind::Gemini => gemini::parse_response(&bytes, &req.model)?,
            ProviderKind::AnthropicPassthrough => anthropic::parse_response(&bytes)?,
        };

        if response.has_repaired_tool_input() {
            log::warn!(
                "request {}: tool input required repair; raw input retained on the block",
                req.metadata.request_id
            );
        }
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    pub async fn stream(&self, req: &ChatRequest) -> Result<EventStream, RelayError> {
        req.validate()?;
        let upstream_model = self.binding.upstream_model(&req.model);

        // CWR is called non-streaming on the wire; the strategy selector
        // simulates the downstream stream from the buffered response.
        if self.binding.kind == ProviderKind::Cwr {
            let (_credential, response) =
                self.call_with_retries(req, &upstream_model, false).await?;
            let bytes = response.into_bytes().await?;
            let events = strategy::simulate_stream(&bytes, &self.binding, &req.model)?;
            return Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))));
        }

        let (_credential, response) = self.call_with_retries(req, &upstream_model, true).await?;
        let bytes: crate::relay::transport::ByteStream = match response.body {
            UpstreamBody::Stream(stream) => stream,
            UpstreamBody::Full(bytes) => Box::pin(futures::stream::iter(vec![Ok(bytes)])),
        };

        let events = match self.binding.kind {
            ProviderKind::OpenaiCompatible => openai::stream_events(bytes, req.model.clone()),
            ProviderKind::Gemini => gemini::stream_events(bytes, req.model.clone()),
            ProviderKind::AnthropicPassthrough => anthropic::stream_events(bytes),
            ProviderKind::Cwr => unreachable!("handled above"),
        };
        Ok(events)
    }

    /// Like `stream`, with cooperative cancellation. On cancel the upstream
    /// read is dropped and, if a `message_start` already went out, a
    /// terminal `message_stop` is synthesised so the consumer still sees a
    /// closed sequence. Cancellation never reports a credential failure.
    pub async fn stream_with_cancel(
        &self,
        req: &ChatRequest,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) -> Result<EventStream, RelayError> {
        let inner = self.stream(req).await?;
        let out = stream! {
            futures::pin_mut!(inner);
            let mut started = false;
            loop {
                enum Step {
                    Cancelled,
                    Item(Option<Result<StreamEvent, RelayError>>),
                }
                let step = tokio::select! {
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            Step::Cancelled
                        } else {
                            continue;
                        }
                    }
                    item = inner.next() => Step::Item(item),
                };
                match step {
                    Step::Cancelled => {
                        if started {
                            yield Ok(StreamEvent::MessageStop);
                        } else {
                            yield Err(RelayError::Cancelled);
                        }
                        return;
                    }
                    Step::Item(Some(event)) => {
                        if matches!(event, Ok(StreamEvent::MessageStart { .. })) {
                            started = true;
                        }
                        let stop = matches!(event, Ok(StreamEvent::MessageStop));
                        yield event;
                        if stop {
                            return;
                        }
                    }
                    Step::Item(None) => return,
                }
            }
        };
        Ok(Box::pin(out))
    }

    // ------------------------------------------------------------------
    // Call loop
    // ------------------------------------------------------------------

    /// Perform the upstream call with credential rotation and transient
    /// retries. Returns the first 2xx response.
    async fn call_with_retries(
        &self,
        req: &ChatRequest,
        upstream_model: &str,
        streaming_body: bool,
    ) -> Result<(AcquiredCredential, UpstreamResponse), RelayError> {
        let request_id = &req.metadata.request_id;
        let mut exclude: Option<String> = None;
        let mut auth_retried = false;
        let mut pending_auth_error: Option<RelayError> = None;
        let mut transient_attempt: u32 = 0;

        loop {
            let credential = match self
                .credentials
                .acquire(request_id, exclude.as_deref())
                .await
            {
                Ok(credential) => credential,
                // With no alternative credential to rotate to, the auth
                // failure itself is the more useful error.
                Err(err) => return Err(pending_auth_error.take().unwrap_or(err)),
            };
            let upstream = self.build_upstream_request(req, upstream_model, &credential)?;

            let result = if streaming_body {
                self.transport.post_stream(upstream).await
            } else {
                self.transport.post(upstream).await
            };

            let response = match result {
                Ok(response) => response,
                Err(err) if err.is_transient() && transient_attempt < TRANSIENT_RETRIES => {
                    self.credentials
                        .report_failure(&credential.source_path, None)
                        .await;
                    let delay = self.retry_base * 2u32.pow(transient_attempt);
                    transient_attempt += 1;
                    log::warn!(
                        "request {}: transport error ({}); retry {} in {:?}",
                        request_id,
                        err,
                        transient_attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => {
                    self.credentials
                        .report_failure(&credential.source_path, None)
                        .await;
                    return Err(err);
                }
            };

            if (200..300).contains(&response.status) {
                self.credentials.report_success(&credential.source_path);
                return Ok((credential, response));
            }

            let status = response.status;
            let body = response
                .into_bytes()
                .await
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();

            match status {
                401 | 403 => {
                    self.credentials
                        .report_failure(&credential.source_path, Some(status))
                        .await;
                    if !auth_retried {
                        auth_retried = true;
                        exclude = Some(credential.source_path.clone());
                        pending_auth_error = Some(RelayError::UpstreamAuth {
                            status,
                            message: body,
                        });
                        log::warn!(
                            "request {}: HTTP {} from {}; rotating credential",
                            request_id,
                            status,
                            self.binding.name
                        );
                        continue;
                    }
                    return Err(RelayError::UpstreamAuth {
                        status,
                        message: body,
                    });
                }
                400 => {
                    // Not a credential fault and never retried; the error
                    // names the model that was actually sent.
                    return Err(RelayError::UpstreamBadRequest {
                        model: upstream_model.to_string(),
                        message: body,
                    });
                }
                429 | 500..=599 => {
                    self.credentials
                        .report_failure(&credential.source_path, Some(status))
                        .await;
                    if transient_attempt < TRANSIENT_RETRIES {
                        let delay = self.retry_base * 2u32.pow(transient_attempt);
                        transient_attempt += 1;
                        log::warn!(
                            "request {}: HTTP {}; retry {} in {:?}",
                            request_id,
                            status,
                            transient_attempt,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(RelayError::UpstreamTransient {
                        status: Some(status),
                        message: body,
                    });
                }
                _ => {
                    self.credentials
                        .report_failure(&credential.source_path, Some(status))
                        .await;
                    return Err(RelayError::from_status(status, upstream_model, body));
                }
            }
        }
    }

    fn build_upstream_request(
        &self,
        req: &ChatRequest,
        upstream_model: &str,
        credential: &AcquiredCredential,
    ) -> Result<UpstreamRequest, RelayError> {
        let timeout = Duration::from_secs(self.binding.http_timeout_secs);
        let endpoint = self.binding.endpoint.trim_end_matches('/');

        let (url, headers, body) = match self.binding.kind {
            ProviderKind::Cwr => {
                let body = cwr::build_request(
                    req,
                    upstream_model,
                    credential.profile_arn.as_deref(),
                )?;
                let mut headers = vec![(
                    "Authorization".to_string(),
                    format!("Bearer {}", credential.access_token),
                )];
                if let Some(arn) = &credential.profile_arn {
                    headers.push(("X-Profile-Arn".to_string(), arn.clone()));
                }
                if let Some(method) = &credential.auth_method {
                    headers.push(("X-Auth-Method".to_string(), method.clone()));
                }
                (
                    format!("{}{}", endpoint, cwr::GENERATE_PATH),
                    headers,
                    serde_json::to_value(body)?,
                )
            }
            ProviderKind::OpenaiCompatible => {
                let body = openai::build_request(req, upstream_model);
                (
                    format!("{}{}", endpoint, openai::CHAT_COMPLETIONS_PATH),
                    vec![(
                        "Authorization".to_string(),
                        format!("Bearer {}", credential.access_token),
                    )],
                    serde_json::to_value(body)?,
                )
            }
            ProviderKind::Gemini => {
                let body = gemini::build_request(req);
                let path = gemini::generate_path(upstream_model, req.stream);
                let sep = if path.contains('?') { '&' } else { '?' };
                (
                    format!(
                        "{}{}{}key={}",
                        endpoint, path, sep, credential.access_token
                    ),
                    Vec::new(),
                    serde_json::to_value(body)?,
                )
            }
            ProviderKind::AnthropicPassthrough => {
                let body = anthropic::build_request(
                    req,
                    upstream_model,
                    self.binding.passthrough_strip_tools,
                );
                (
                    format!("{}{}", endpoint, anthropic::MESSAGES_PATH),
                    vec![
                        ("x-api-key".to_string(), credential.access_token.clone()),
                        (
                            "anthropic-version".to_string(),
                            anthropic::ANTHROPIC_VERSION.to_string(),
                        ),
                    ],
                    serde_json::to_value(body)?,
                )
            }
        };

        Ok(UpstreamRequest {
            url,
            headers,
            body,
            timeout,
        })
    }
}
