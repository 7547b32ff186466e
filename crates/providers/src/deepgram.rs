use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use futures::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use voxgate_config::ProviderSettings;

use crate::adapter::{
    CompletionRequest, CompletionResult, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderStream, ServiceKind, StreamFrame, StreamRequest,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Streaming speech-to-text over Deepgram's realtime WebSocket API.
///
/// Interim results map to `ProviderEvent::Partial`, finalized segments to
/// `ProviderEvent::Final`. Batch transcription is not served by this
/// adapter; the registry carries a separate batch provider for that.
pub struct DeepgramAdapter {
    api_key: Option<String>,
    base_url: String,
}

/// USD per audio minute, streaming tier.
const PRICE_PER_MINUTE: &[(&str, f64)] = &[
    ("nova-2", 0.0059),
    ("nova-3", 0.0077),
    ("enhanced", 0.0145),
    ("base", 0.0125),
];

const DEFAULT_MODEL: &str = "nova-2";

impl DeepgramAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            api_key: settings.deepgram_api_key.clone(),
            base_url: settings.deepgram_url.clone(),
        }
    }

    fn listen_url(&self, language: Option<&str>, sample_rate: u32) -> String {
        let mut url = format!(
            "{}?model={DEFAULT_MODEL}&encoding=linear16&sample_rate={sample_rate}&interim_results=true&punctuate=true",
            self.base_url
        );
        if let Some(lang) = language {
            url.push_str(&format!("&language={}", urlencoding::encode(lang)));
        }
        url
    }
}

#[async_trait]
impl ProviderAdapter for DeepgramAdapter {
    fn name(&self) -> &str {
        "deepgram"
    }

    fn kind(&self) -> ServiceKind {
        ServiceKind::SpeechToText
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    async fn open_stream(
        &self,
        request: StreamRequest,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<Box<dyn ProviderStream>, ProviderError> {
        let StreamRequest::Transcription {
            language,
            sample_rate,
        } = request
        else {
            return Err(ProviderError::Upstream(
                "deepgram serves transcription streams only".to_string(),
            ));
        };

        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::ConfigurationMissing("deepgram_api_key".to_string()))?;

        let url = self.listen_url(language.as_deref(), sample_rate);
        let mut ws_request = url
            .clone()
            .into_client_request()
            .map_err(|e| ProviderError::Upstream(format!("invalid upstream url: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Token {api_key}"))
            .map_err(|e| ProviderError::Upstream(format!("invalid api key: {e}")))?;
        ws_request.headers_mut().insert("Authorization", auth);

        let (stream, _response) = connect_async(ws_request)
            .await
            .map_err(|e| ProviderError::Upstream(format!("deepgram connect failed: {e}")))?;
        debug!(%url, "deepgram upstream connected");

        let (write, mut read) = stream.split();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_listen_message(&text) {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%e, "deepgram upstream read error");
                        let _ = events.send(ProviderEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Release);
            debug!("deepgram upstream reader exited");
        });

        Ok(Box::new(DeepgramStream {
            write,
            closed,
            stopped: false,
            reader,
        }))
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResult, ProviderError> {
        Err(ProviderError::UnsupportedCapability)
    }

    fn cost(&self, model: &str, input_units: f64, _output_units: f64) -> f64 {
        let rate = PRICE_PER_MINUTE
            .iter()
            .find(|(m, _)| *m == model)
            .map(|(_, r)| *r)
            .unwrap_or_else(|| {
                PRICE_PER_MINUTE
                    .iter()
                    .find(|(m, _)| *m == DEFAULT_MODEL)
                    .map(|(_, r)| *r)
                    .unwrap_or(0.0)
            });
        (input_units / 60.0) * rate
    }
}

/// Extracts a transcript event from one Deepgram `listen` message.
fn parse_listen_message(text: &str) -> Option<ProviderEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let transcript = value["channel"]["alternatives"][0]["transcript"].as_str()?;
    if transcript.is_empty() {
        return None;
    }
    let is_final = value["is_final"].as_bool().unwrap_or(false);
    Some(if is_final {
        ProviderEvent::Final(transcript.to_string())
    } else {
        ProviderEvent::Partial(transcript.to_string())
    })
}

struct DeepgramStream {
    write: WsSink,
    closed: Arc<AtomicBool>,
    stopped: bool,
    reader: tokio::task::JoinHandle<()>,
}

/// How long `stop` waits for the upstream to drain buffered audio and
/// deliver its remaining finals before the reader is aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
impl ProviderStream for DeepgramStream {
    async fn send(&mut self, frame: StreamFrame) -> Result<(), ProviderError> {
        if self.stopped || self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::SessionClosed);
        }
        let msg = match frame {
            StreamFrame::Audio(bytes) => Message::binary(bytes),
            StreamFrame::Text(text) => Message::text(text),
        };
        self.write.send(msg).await.map_err(|e| {
            self.closed.store(true, Ordering::Release);
            ProviderError::Upstream(format!("deepgram send failed: {e}"))
        })
    }

    async fn stop(&mut self) -> Result<(), ProviderError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        if !self.closed.load(Ordering::Acquire) {
            // Flush pending audio through Deepgram's drain handshake. The
            // upstream replies with the remaining finals and then closes,
            // so wait for the reader to forward them before giving up.
            let _ = self
                .write
                .send(Message::text(r#"{"type":"CloseStream"}"#))
                .await;
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut self.reader)
                .await
                .is_err()
            {
                self.reader.abort();
            }
            let _ = self.write.close().await;
        } else {
            self.reader.abort();
        }
        Ok(())
    }
}
