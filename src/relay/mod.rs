// Relay core
// Translates Anthropic-shaped requests to heterogeneous upstream LLM
// providers and rebuilds faithful Anthropic-shaped responses.

pub mod anthropic;
pub mod binding;
pub mod client;
pub mod credentials;
pub mod cwr;
pub mod eventstream;
pub mod gemini;
pub mod openai;
pub mod reconstruct;
pub mod strategy;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export main types
pub use binding::{ProviderBinding, ProviderKind, RotationPolicy, RotationStrategy};
pub use client::{EventStream, ProviderClient};
pub use credentials::{
    AcquiredCredential, Credential, CredentialManager, CredentialState, CwrTokenRefresher,
    DiskStore, FileStore, MemStore, TokenRefresher,
};
pub use reconstruct::ToolCallReconstructor;
pub use strategy::{choose_strategy, StreamingStrategy};
pub use transport::{HttpTransport, ReqwestTransport};
pub use types::{
    BlockDelta, ChatMessage, ChatRequest, ChatResponse, ContentBlock, MessageContent, RelayError,
    RequestMeta, Role, StopReason, StreamEvent, ToolSpec, Usage,
};
