use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// The capability class of an upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    SpeechToText,
    LanguageModel,
}

impl ServiceKind {
    /// Short wire code embedded in session identifiers and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceKind::SpeechToText => "stt",
            ServiceKind::LanguageModel => "llm",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "stt" => Some(ServiceKind::SpeechToText),
            "llm" => Some(ServiceKind::LanguageModel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Parameters for opening a streaming session against a provider.
#[derive(Debug, Clone)]
pub enum StreamRequest {
    Transcription {
        language: Option<String>,
        sample_rate: u32,
    },
    Completion {
        model: String,
        messages: Vec<ChatMessage>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    },
}

/// One inbound client frame relayed into an open provider stream.
#[derive(Debug)]
pub enum StreamFrame {
    Audio(Vec<u8>),
    Text(String),
}

/// Results pushed by an adapter into the session's event queue.
///
/// Adapters never touch gateway state; everything they produce flows
/// through the `mpsc::Sender` handed to `open_stream`, and only the
/// session's owning task consumes it.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Interim transcript for the segment currently being spoken.
    Partial(String),
    /// Final transcript for a completed segment.
    Final(String),
    /// One incremental chunk of language-model output.
    Chunk(String),
    /// Terminal language-model result with authoritative token counts.
    Complete {
        content: String,
        tokens_in: u64,
        tokens_out: u64,
    },
    /// Terminal upstream error; the session will be torn down.
    Error(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("Provider does not support streaming")]
    UnsupportedCapability,
    #[error("Session closed")]
    SessionClosed,
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Upstream failure: {0}")]
    Upstream(String),
}

/// One-shot batch work for providers that cannot (or need not) stream.
#[derive(Debug, Clone)]
pub enum CompletionRequest {
    Transcription {
        audio: Vec<u8>,
        language: Option<String>,
        sample_rate: u32,
    },
    Chat {
        model: String,
        messages: Vec<ChatMessage>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub audio_seconds: f64,
}

/// A live upstream link owned by exactly one session.
#[async_trait]
pub trait ProviderStream: Send + Sync {
    /// Relays one client frame upstream. Fails with `SessionClosed` once
    /// the upstream link has terminated.
    async fn send(&mut self, frame: StreamFrame) -> Result<(), ProviderError>;

    /// Closes the upstream link. Idempotent; a second call is a no-op.
    async fn stop(&mut self) -> Result<(), ProviderError>;
}

/// Uniform interface around one upstream speech or language-model service.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    /// Registry name for this adapter.
    fn name(&self) -> &str;

    fn kind(&self) -> ServiceKind;

    /// Whether this adapter can serve incremental streaming sessions.
    /// Batch-only adapters still implement `complete`.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Model used when the client does not pick one; recorded in usage
    /// records for sessions that never name a model explicitly.
    fn default_model(&self) -> &str;

    /// Opens a streaming session. Results arrive on `events`; the handle
    /// returned is exclusively owned by the calling session.
    async fn open_stream(
        &self,
        request: StreamRequest,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<Box<dyn ProviderStream>, ProviderError>;

    /// Performs one-shot batch work.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult, ProviderError>;

    /// Cost in USD for the given quantity of work. Input units are audio
    /// seconds for speech providers and prompt tokens for language models;
    /// output units are completion tokens (0 for speech).
    fn cost(&self, model: &str, input_units: f64, output_units: f64) -> f64;
}

/// Rough token estimate for providers that do not report usage.
pub(crate) fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
