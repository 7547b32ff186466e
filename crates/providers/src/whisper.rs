use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use voxgate_config::ProviderSettings;

use crate::adapter::{
    CompletionRequest, CompletionResult, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderStream, ServiceKind, StreamRequest, estimate_tokens,
};

/// Batch-only speech-to-text via the OpenAI `audio/transcriptions`
/// endpoint. Streaming starts against this adapter are rejected by the
/// session manager before any connection is attempted.
pub struct WhisperAdapter {
    api_key: Option<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

/// USD per audio minute.
const PRICE_PER_MINUTE: f64 = 0.006;

impl WhisperAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            api_key: settings.openai_api_key.clone(),
            base_url: settings.openai_base_url.clone(),
            model: settings.whisper_model.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::ConfigurationMissing("openai_api_key".to_string()))
    }
}

#[async_trait]
impl ProviderAdapter for WhisperAdapter {
    fn name(&self) -> &str {
        "whisper-batch"
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::SpeechToText
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn open_stream(
        &self,
        _request: StreamRequest,
        _events: mpsc::Sender<ProviderEvent>,
    ) -> Result<Box<dyn ProviderStream>, ProviderError> {
        Err(ProviderError::UnsupportedCapability)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult, ProviderError> {
        let CompletionRequest::Transcription {
            audio,
            language,
            sample_rate,
        } = request
        else {
            return Err(ProviderError::Upstream(
                "whisper-batch serves transcription only".to_string(),
            ));
        };
        let api_key = self.api_key()?;

        // 16-bit mono PCM duration; billed before the upstream call so
        // failed requests still carry the attempted quantity.
        let audio_seconds = audio.len() as f64 / (2.0 * sample_rate as f64);

        let file = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone());
        if let Some(lang) = language {
            form = form.text("language", lang);
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(format!("transcription request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream(format!(
                "transcription returned {status}: {body}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(format!("transcription parse failed: {e}")))?;
        let content = value["text"].as_str().unwrap_or_default().to_string();
        debug!(audio_seconds, chars = content.len(), "batch transcription complete");

        let tokens_out = estimate_tokens(&content);
        Ok(CompletionResult {
            content,
            tokens_in: 0,
            tokens_out,
            audio_seconds,
        })
    }

    fn cost(&self, _model: &str, input_units: f64, _output_units: f64) -> f64 {
        (input_units / 60.0) * PRICE_PER_MINUTE
    }
}
