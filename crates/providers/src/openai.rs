use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use voxgate_config::ProviderSettings;

use crate::adapter::{
    ChatMessage, CompletionRequest, CompletionResult, ProviderAdapter, ProviderError,
    ProviderEvent, ProviderStream, ServiceKind, StreamFrame, StreamRequest, estimate_tokens,
};

/// Streaming chat completions over the OpenAI SSE API, plus a one-shot
/// batch path for non-streaming callers.
pub struct OpenAiAdapter {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

/// USD per 1K tokens, (model, prompt, completion).
const PRICE_PER_1K: &[(&str, f64, f64)] = &[
    ("gpt-4o", 0.0025, 0.01),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4.1", 0.002, 0.008),
];

const DEFAULT_PROMPT_RATE: f64 = 0.001;
const DEFAULT_COMPLETION_RATE: f64 = 0.002;

impl OpenAiAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            api_key: settings.openai_api_key.clone(),
            base_url: settings.openai_base_url.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::ConfigurationMissing("openai_api_key".to_string()))
    }

    fn chat_body(
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        temperature: Option<f64>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max) = max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::LanguageModel
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        "gpt-4o-mini"
    }

    async fn open_stream(
        &self,
        request: StreamRequest,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<Box<dyn ProviderStream>, ProviderError> {
        let StreamRequest::Completion {
            model,
            messages,
            max_tokens,
            temperature,
        } = request
        else {
            return Err(ProviderError::Upstream(
                "openai serves completion streams only".to_string(),
            ));
        };
        let api_key = self.api_key()?;

        let body = Self::chat_body(&model, &messages, max_tokens, temperature, true);
        let prompt_estimate: u64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();

        let mut source = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .eventsource()
            .map_err(|e| ProviderError::Upstream(format!("completion request failed: {e}")))?;

        let closed = Arc::new(AtomicBool::new(false));
        let task_closed = closed.clone();
        let task = tokio::spawn(async move {
            let mut content = String::new();
            let mut tokens_in = prompt_estimate;
            let mut tokens_out = 0u64;
            let mut reported_usage = false;

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        if msg.data == "[DONE]" {
                            break;
                        }
                        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&msg.data)
                        else {
                            continue;
                        };
                        if let Some(delta) = parsed["choices"][0]["delta"]["content"].as_str()
                            && !delta.is_empty()
                        {
                            content.push_str(delta);
                            if events.send(ProviderEvent::Chunk(delta.to_string())).await.is_err() {
                                source.close();
                                task_closed.store(true, Ordering::Release);
                                return;
                            }
                        }
                        if parsed["usage"].is_object() {
                            tokens_in = parsed["usage"]["prompt_tokens"]
                                .as_u64()
                                .unwrap_or(tokens_in);
                            tokens_out = parsed["usage"]["completion_tokens"]
                                .as_u64()
                                .unwrap_or(tokens_out);
                            reported_usage = true;
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        warn!(%e, "openai stream error");
                        let _ = events.send(ProviderEvent::Error(e.to_string())).await;
                        source.close();
                        task_closed.store(true, Ordering::Release);
                        return;
                    }
                }
            }
            source.close();
            task_closed.store(true, Ordering::Release);

            if !reported_usage {
                tokens_out = estimate_tokens(&content);
            }
            debug!(tokens_in, tokens_out, "openai stream complete");
            let _ = events
                .send(ProviderEvent::Complete {
                    content,
                    tokens_in,
                    tokens_out,
                })
                .await;
        });

        Ok(Box::new(OpenAiStream {
            closed,
            stopped: false,
            task: task.abort_handle(),
        }))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult, ProviderError> {
        let CompletionRequest::Chat {
            model,
            messages,
            max_tokens,
            temperature,
        } = request
        else {
            return Err(ProviderError::Upstream(
                "openai serves chat completions only".to_string(),
            ));
        };
        let api_key = self.api_key()?;

        let body = Self::chat_body(&model, &messages, max_tokens, temperature, false);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(format!("completion request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream(format!(
                "completion returned {status}: {body}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(format!("completion parse failed: {e}")))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(CompletionResult {
            tokens_in: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            tokens_out: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            audio_seconds: 0.0,
            content,
        })
    }

    fn cost(&self, model: &str, input_units: f64, output_units: f64) -> f64 {
        let (prompt_rate, completion_rate) = PRICE_PER_1K
            .iter()
            .find(|(m, _, _)| *m == model)
            .map(|(_, p, c)| (*p, *c))
            .unwrap_or((DEFAULT_PROMPT_RATE, DEFAULT_COMPLETION_RATE));
        (input_units / 1000.0) * prompt_rate + (output_units / 1000.0) * completion_rate
    }
}

/// Handle for an in-flight SSE completion. The prompt is sent in full at
/// open time, so there is nothing to relay upstream mid-stream; `send`
/// only reports whether the upstream link is still alive.
struct OpenAiStream {
    closed: Arc<AtomicBool>,
    stopped: bool,
    task: tokio::task::AbortHandle,
}

#[async_trait]
impl ProviderStream for OpenAiStream {
    async fn send(&mut self, _frame: StreamFrame) -> Result<(), ProviderError> {
        if self.stopped || self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::SessionClosed);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProviderError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.task.abort();
        Ok(())
    }
}
