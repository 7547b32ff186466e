use serde::{Deserialize, Serialize};
use thiserror::Error;
use voxgate_providers::adapter::ChatMessage;

/// Frames the client may send. Every frame carries a `type` discriminator;
/// the remaining fields are camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    StartTranscription {
        provider: Option<String>,
        language: Option<String>,
        #[serde(rename = "sampleRate")]
        sample_rate: Option<u32>,
    },
    AudioData {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "audioData")]
        audio_data: String,
    },
    StartLlmStream {
        provider: Option<String>,
        model: String,
        messages: Vec<ChatMessage>,
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    },
    StopSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "auth",
    "start_transcription",
    "audio_data",
    "start_llm_stream",
    "stop_session",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid message format")]
    Malformed,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// Parses one inbound text frame. Unknown `type` values are reported by
/// name; everything else that fails to parse is a single malformed-frame
/// error so clients cannot probe field structure through error text.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|_| FrameError::Malformed)?;
    let ty = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(FrameError::Malformed)?;
    if !KNOWN_TYPES.contains(&ty) {
        return Err(FrameError::UnknownType(ty.to_string()));
    }
    serde_json::from_value(value).map_err(|_| FrameError::Malformed)
}

/// Frames the gateway sends to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: String,
        plan: String,
    },
    AuthError {
        error: String,
    },
    TranscriptionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        provider: String,
        status: String,
    },
    LlmStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        model: String,
        status: String,
    },
    Transcript {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    PartialTranscript {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    LlmChunk {
        #[serde(rename = "sessionId")]
        session_id: String,
        content: String,
    },
    LlmComplete {
        #[serde(rename = "sessionId")]
        session_id: String,
        result: String,
    },
    SessionStopped {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Seconds the session spent streaming.
        duration: f64,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","error":"internal"}"#.to_string())
    }
}
