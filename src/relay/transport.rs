// Outbound HTTP seam. The provider client talks to upstreams through this
// trait so the relay core can be exercised against a test double.

use crate::relay::types::RelayError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

/// Streaming responses stall out when no bytes arrive for this long; total
/// duration is unbounded.
pub const IDLE_READ_TIMEOUT_SECS: u64 = 60;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    pub timeout: Duration,
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(ByteStream),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    /// Buffer the body regardless of how it arrived.
    pub async fn into_bytes(self) -> Result<Bytes, RelayError> {
        match self.body {
            UpstreamBody::Full(bytes) => Ok(bytes),
            UpstreamBody::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST and buffer the full response body.
    async fn post(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError>;
    /// POST and hand back the response body as a byte stream.
    async fn post_stream(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError>;
}

/// Production transport over reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        let mut builder = self
            .client
            .post(&req.url)
            .timeout(req.timeout)
            .json(&req.body);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        Ok(UpstreamResponse {
            status,
            body: UpstreamBody::Full(bytes),
        })
    }

    async fn post_stream(&self, req: UpstreamRequest) -> Result<UpstreamResponse, RelayError> {
        // No per-request timeout here: it would bound the whole body read.
        // Liveness comes from the idle timeout on the chunk stream.
        let mut builder = self.client.post(&req.url).json(&req.body);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();

        let chunks = response.bytes_stream();
        let idle = Duration::from_secs(IDLE_READ_TIMEOUT_SECS);
        let stream = tokio_stream::StreamExt::timeout(chunks, idle).map(|item| match item {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(RelayError::Network(err)),
            Err(_elapsed) => Err(RelayError::UpstreamTransient {
                status: None,
                message: format!("no bytes received for {}s", IDLE_READ_TIMEOUT_SECS),
            }),
        });
        Ok(UpstreamResponse {
            status,
            body: UpstreamBody::Stream(Box::pin(stream)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_into_bytes_buffers_stream() {
        let chunks: Vec<Result<Bytes, RelayError>> =
            vec![Ok(Bytes::from("ab")), Ok(Bytes::from("cd"))];
        let resp = UpstreamResponse {
            status: 200,
            body: UpstreamBody::Stream(Box::pin(futures::stream::iter(chunks))),
        };
        assert_eq!(resp.into_bytes().await.unwrap(), Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn test_into_bytes_propagates_stream_error() {
        let chunks: Vec<Result<Bytes, RelayError>> = vec![
            Ok(Bytes::from("ab")),
            Err(RelayError::UpstreamTransient {
                status: None,
                message: "reset".to_string(),
            }),
        ];
        let resp = UpstreamResponse {
            status: 200,
            body: UpstreamBody::Stream(Box::pin(futures::stream::iter(chunks))),
        };
        assert!(resp.into_bytes().await.is_err());
    }
}
