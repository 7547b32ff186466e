pub mod adapter;
pub mod deepgram;
pub mod openai;
pub mod registry;
pub mod whisper;

pub use adapter::{
    ChatMessage, CompletionRequest, CompletionResult, ProviderAdapter, ProviderError,
    ProviderEvent, ProviderStream, ServiceKind, StreamFrame, StreamRequest,
};
pub use registry::ProviderRegistry;
