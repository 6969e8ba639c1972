pub mod relay;

// Re-export commonly used items for convenience
pub use relay::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, CredentialManager, MessageContent,
    ProviderBinding, ProviderClient, ProviderKind, RelayError, Role, StopReason, StreamEvent,
};
