use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxgate_providers::adapter::{
    ChatMessage, ProviderAdapter, ProviderEvent, ServiceKind, StreamFrame, StreamRequest,
};
use voxgate_services::auth::Identity;
use voxgate_services::usage::UsageMetrics;

use super::SessionEvent;
use super::session::{ActiveSession, SessionMeta, authorize, mint_session_id, session_owner};
use super::storage::{ConnectionHandle, WsSender};
use crate::error::GatewayError;
use crate::protocol::{ClientFrame, ServerFrame, parse_client_frame};
use crate::state::AppState;

/// Per-connection state, exclusively owned by the connection's task.
struct Conn {
    id: String,
    sender: WsSender,
    events: mpsc::Sender<SessionEvent>,
    identity: Option<Identity>,
    session: Option<ActiveSession>,
}

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, "WebSocket connected");

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));
    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(256);
    let alive = Arc::new(AtomicBool::new(true));

    state.connections.add(
        connection_id.clone(),
        ConnectionHandle {
            sender: sender.clone(),
            alive: alive.clone(),
            events: events_tx.clone(),
        },
    );

    send_frame(
        &sender,
        &ServerFrame::Connected {
            connection_id: connection_id.clone(),
        },
    )
    .await;

    let mut conn = Conn {
        id: connection_id.clone(),
        sender: sender.clone(),
        events: events_tx,
        identity: None,
        session: None,
    };

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                alive.store(true, Ordering::Relaxed);
                match msg {
                    Ok(Message::Text(text)) => {
                        if !handle_client_frame(&state, &mut conn, &text).await {
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let mut guard = sender.lock().await;
                        let _ = guard.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!(%connection_id, %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
            ev = events_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    SessionEvent::Provider { session_id, event } => {
                        handle_provider_event(&state, &mut conn, &session_id, event).await;
                    }
                    SessionEvent::Expired => {
                        info!(%connection_id, "liveness sweep expired connection, closing");
                        break;
                    }
                }
            }
        }
    }

    // Connection loss tears down any session it still owns. The work the
    // provider already delivered counts as successful.
    if let Some(session) = conn.session.take() {
        teardown_session(&state, session, true, None).await;
    }
    state.connections.remove(&connection_id);
    info!(%connection_id, "WebSocket disconnected");
}

async fn send_frame(sender: &WsSender, frame: &ServerFrame) {
    let mut guard = sender.lock().await;
    let _ = guard.send(Message::text(frame.to_json())).await;
}

async fn send_error(sender: &WsSender, error: &GatewayError) {
    send_frame(
        sender,
        &ServerFrame::Error {
            error: error.to_string(),
        },
    )
    .await;
}

/// Dispatches one inbound text frame. Returns `false` when the
/// connection must close.
async fn handle_client_frame(state: &AppState, conn: &mut Conn, text: &str) -> bool {
    let frame = match parse_client_frame(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(connection_id = %conn.id, %e, "rejected client frame");
            send_frame(
                &conn.sender,
                &ServerFrame::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return true;
        }
    };

    match frame {
        ClientFrame::Auth { token } => handle_auth(state, conn, &token).await,
        ClientFrame::StartTranscription {
            provider,
            language,
            sample_rate,
        } => {
            handle_start_transcription(state, conn, provider, language, sample_rate).await;
            true
        }
        ClientFrame::AudioData {
            session_id,
            audio_data,
        } => {
            handle_audio_data(state, conn, &session_id, &audio_data).await;
            true
        }
        ClientFrame::StartLlmStream {
            provider,
            model,
            messages,
            max_tokens,
            temperature,
        } => {
            handle_start_llm(state, conn, provider, model, messages, max_tokens, temperature)
                .await;
            true
        }
        ClientFrame::StopSession { session_id } => {
            handle_stop_session(state, conn, &session_id).await;
            true
        }
    }
}

/// Consumes the identity frame. Only valid before the connection is
/// authenticated; a later `auth` frame is rejected so the identity can
/// never change out from under a live session id. A rejected token gets
/// an `auth_error` frame and then the connection is closed.
async fn handle_auth(state: &AppState, conn: &mut Conn, token: &str) -> bool {
    if conn.identity.is_some() {
        send_frame(
            &conn.sender,
            &ServerFrame::Error {
                error: "Already authenticated".to_string(),
            },
        )
        .await;
        return true;
    }
    match state.verifier.verify(token) {
        Ok(identity) => {
            info!(connection_id = %conn.id, user_id = %identity.user_id, plan = %identity.plan, "authenticated");
            send_frame(
                &conn.sender,
                &ServerFrame::AuthSuccess {
                    user_id: identity.user_id.clone(),
                    plan: identity.plan.clone(),
                },
            )
            .await;
            conn.identity = Some(identity);
            true
        }
        Err(e) => {
            warn!(connection_id = %conn.id, %e, "authentication rejected");
            send_frame(
                &conn.sender,
                &ServerFrame::AuthError {
                    error: e.to_string(),
                },
            )
            .await;
            false
        }
    }
}

/// Resolves the adapter for a streaming start, enforcing kind and
/// streaming capability before any connection attempt.
fn resolve_streaming_adapter(
    state: &AppState,
    provider: Option<&str>,
    kind: ServiceKind,
) -> Result<Arc<dyn ProviderAdapter>, GatewayError> {
    let adapter = match provider {
        Some(name) => state
            .registry
            .get(name)
            .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))?,
        None => state
            .registry
            .default_streaming(kind)
            .ok_or_else(|| GatewayError::UpstreamFailure("no streaming provider configured".to_string()))?,
    };
    if adapter.kind() != kind || !adapter.supports_streaming() {
        return Err(GatewayError::UnsupportedCapability);
    }
    Ok(adapter)
}

/// Runs the admission check and reports a rejection to the client.
/// Returns the identity so callers cannot skip the authentication gate.
async fn negotiate(state: &AppState, conn: &Conn) -> Option<Identity> {
    let Some(identity) = conn.identity.clone() else {
        send_frame(
            &conn.sender,
            &ServerFrame::Error {
                error: "Not authenticated".to_string(),
            },
        )
        .await;
        return None;
    };

    if conn.session.is_some() {
        send_frame(
            &conn.sender,
            &ServerFrame::Error {
                error: "Session already active".to_string(),
            },
        )
        .await;
        return None;
    }

    let decision = state
        .admission
        .admit(Some(&identity.user_id), None, Some(&identity.plan));
    if !decision.allowed {
        send_error(
            &conn.sender,
            &GatewayError::AdmissionRejected {
                retry_after_secs: decision.retry_after_secs,
            },
        )
        .await;
        return None;
    }

    Some(identity)
}

fn spawn_forwarder(
    session_id: String,
    mut rx: mpsc::Receiver<ProviderEvent>,
    events: mpsc::Sender<SessionEvent>,
) -> AbortHandle {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let forwarded = events
                .send(SessionEvent::Provider {
                    session_id: session_id.clone(),
                    event,
                })
                .await;
            if forwarded.is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

async fn handle_start_transcription(
    state: &AppState,
    conn: &mut Conn,
    provider: Option<String>,
    language: Option<String>,
    sample_rate: Option<u32>,
) {
    let Some(identity) = negotiate(state, conn).await else {
        return;
    };

    let adapter = match resolve_streaming_adapter(state, provider.as_deref(), ServiceKind::SpeechToText) {
        Ok(a) => a,
        Err(e) => {
            send_error(&conn.sender, &e).await;
            return;
        }
    };

    let sample_rate = sample_rate.unwrap_or(16_000);
    let session_id = mint_session_id(&identity.user_id, ServiceKind::SpeechToText);
    let (provider_tx, provider_rx) = mpsc::channel(64);

    let stream = match adapter
        .open_stream(
            StreamRequest::Transcription {
                language,
                sample_rate,
            },
            provider_tx,
        )
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(connection_id = %conn.id, provider = adapter.name(), %e, "provider connect failed");
            send_error(&conn.sender, &e.into()).await;
            return;
        }
    };

    let forwarder = spawn_forwarder(session_id.clone(), provider_rx, conn.events.clone());
    state.sessions.insert(
        session_id.clone(),
        SessionMeta {
            connection_id: conn.id.clone(),
            kind: ServiceKind::SpeechToText,
        },
    );
    let model = adapter.default_model().to_string();
    conn.session = Some(ActiveSession {
        id: session_id.clone(),
        kind: ServiceKind::SpeechToText,
        provider: adapter.clone(),
        model,
        sample_rate,
        started: Instant::now(),
        stream,
        content: String::new(),
        tokens_in: 0,
        tokens_out: 0,
        audio_seconds: 0.0,
        forwarder,
    });

    info!(connection_id = %conn.id, %session_id, provider = adapter.name(), "transcription session started");
    send_frame(
        &conn.sender,
        &ServerFrame::TranscriptionStarted {
            session_id,
            provider: adapter.name().to_string(),
            status: "listening".to_string(),
        },
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_start_llm(
    state: &AppState,
    conn: &mut Conn,
    provider: Option<String>,
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
) {
    let Some(identity) = negotiate(state, conn).await else {
        return;
    };

    let adapter = match resolve_streaming_adapter(state, provider.as_deref(), ServiceKind::LanguageModel) {
        Ok(a) => a,
        Err(e) => {
            send_error(&conn.sender, &e).await;
            return;
        }
    };

    let session_id = mint_session_id(&identity.user_id, ServiceKind::LanguageModel);
    let (provider_tx, provider_rx) = mpsc::channel(64);

    let stream = match adapter
        .open_stream(
            StreamRequest::Completion {
                model: model.clone(),
                messages,
                max_tokens,
                temperature,
            },
            provider_tx,
        )
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(connection_id = %conn.id, provider = adapter.name(), %e, "provider connect failed");
            send_error(&conn.sender, &e.into()).await;
            return;
        }
    };

    let forwarder = spawn_forwarder(session_id.clone(), provider_rx, conn.events.clone());
    state.sessions.insert(
        session_id.clone(),
        SessionMeta {
            connection_id: conn.id.clone(),
            kind: ServiceKind::LanguageModel,
        },
    );
    conn.session = Some(ActiveSession {
        id: session_id.clone(),
        kind: ServiceKind::LanguageModel,
        provider: adapter.clone(),
        model: model.clone(),
        sample_rate: 0,
        started: Instant::now(),
        stream,
        content: String::new(),
        tokens_in: 0,
        tokens_out: 0,
        audio_seconds: 0.0,
        forwarder,
    });

    info!(connection_id = %conn.id, %session_id, %model, "llm session started");
    send_frame(
        &conn.sender,
        &ServerFrame::LlmStarted {
            session_id,
            model,
            status: "streaming".to_string(),
        },
    )
    .await;
}

async fn handle_audio_data(state: &AppState, conn: &mut Conn, session_id: &str, audio_data: &str) {
    let Some(identity) = conn.identity.clone() else {
        send_frame(
            &conn.sender,
            &ServerFrame::Error {
                error: "Not authenticated".to_string(),
            },
        )
        .await;
        return;
    };

    if let Err(e) = authorize(session_id, &identity.user_id) {
        send_error(&conn.sender, &e).await;
        return;
    }

    let owns_it = conn.session.as_ref().is_some_and(|s| s.id == session_id);
    if !owns_it {
        send_error(&conn.sender, &GatewayError::InvalidSession).await;
        return;
    }

    let bytes = match BASE64.decode(audio_data) {
        Ok(b) => b,
        Err(_) => {
            send_error(&conn.sender, &GatewayError::MalformedFrame).await;
            return;
        }
    };

    let Some(session) = conn.session.as_mut() else {
        return;
    };
    session.audio_seconds += bytes.len() as f64 / (2.0 * f64::from(session.sample_rate.max(1)));

    if let Err(e) = session.stream.send(StreamFrame::Audio(bytes)).await {
        warn!(connection_id = %conn.id, %session_id, %e, "relay to provider failed");
        send_error(&conn.sender, &GatewayError::UpstreamFailure(e.to_string())).await;
        if let Some(session) = conn.session.take() {
            teardown_session(state, session, false, Some(e.to_string())).await;
        }
    }
}

async fn handle_stop_session(state: &AppState, conn: &mut Conn, session_id: &str) {
    let Some(identity) = conn.identity.clone() else {
        send_frame(
            &conn.sender,
            &ServerFrame::Error {
                error: "Not authenticated".to_string(),
            },
        )
        .await;
        return;
    };

    if let Err(e) = authorize(session_id, &identity.user_id) {
        send_error(&conn.sender, &e).await;
        return;
    }

    let owns_it = conn.session.as_ref().is_some_and(|s| s.id == session_id);
    if !owns_it {
        send_error(&conn.sender, &GatewayError::InvalidSession).await;
        return;
    }

    if let Some(session) = conn.session.take() {
        let duration = teardown_session(state, session, true, None)
            .await
            .unwrap_or(0.0);
        send_frame(
            &conn.sender,
            &ServerFrame::SessionStopped {
                session_id: session_id.to_string(),
                duration,
            },
        )
        .await;
    }
}

/// Forwards one provider event to the client, closing the session on a
/// terminal event. Events for a session this connection no longer owns
/// are dropped; the forwarder task that sent them is already doomed.
async fn handle_provider_event(
    state: &AppState,
    conn: &mut Conn,
    session_id: &str,
    event: ProviderEvent,
) {
    let owns_it = conn.session.as_ref().is_some_and(|s| s.id == session_id);
    if !owns_it {
        debug!(connection_id = %conn.id, %session_id, "dropping event for closed session");
        return;
    }

    match event {
        ProviderEvent::Partial(text) => {
            send_frame(
                &conn.sender,
                &ServerFrame::PartialTranscript {
                    session_id: session_id.to_string(),
                    data: text,
                },
            )
            .await;
        }
        ProviderEvent::Final(text) => {
            if let Some(session) = conn.session.as_mut() {
                if !session.content.is_empty() {
                    session.content.push(' ');
                }
                session.content.push_str(&text);
            }
            send_frame(
                &conn.sender,
                &ServerFrame::Transcript {
                    session_id: session_id.to_string(),
                    data: text,
                },
            )
            .await;
        }
        ProviderEvent::Chunk(content) => {
            if let Some(session) = conn.session.as_mut() {
                session.content.push_str(&content);
            }
            send_frame(
                &conn.sender,
                &ServerFrame::LlmChunk {
                    session_id: session_id.to_string(),
                    content,
                },
            )
            .await;
        }
        ProviderEvent::Complete {
            content,
            tokens_in,
            tokens_out,
        } => {
            let result = if let Some(session) = conn.session.as_mut() {
                session.tokens_in = tokens_in;
                session.tokens_out = tokens_out;
                if !content.is_empty() {
                    session.content = content;
                }
                session.content.clone()
            } else {
                content
            };
            send_frame(
                &conn.sender,
                &ServerFrame::LlmComplete {
                    session_id: session_id.to_string(),
                    result,
                },
            )
            .await;
            if let Some(session) = conn.session.take() {
                teardown_session(state, session, true, None).await;
            }
        }
        ProviderEvent::Error(e) => {
            warn!(connection_id = %conn.id, %session_id, error = %e, "provider reported terminal error");
            send_error(&conn.sender, &GatewayError::UpstreamFailure(e.clone())).await;
            if let Some(session) = conn.session.take() {
                teardown_session(state, session, false, Some(e)).await;
            }
        }
    }
}

/// Closes the provider stream, removes the session from the live table
/// and records usage. The table removal is the exactly-once guard: the
/// caller that loses the race gets `None` and records nothing.
pub(crate) async fn teardown_session(
    state: &AppState,
    mut session: ActiveSession,
    success: bool,
    error: Option<String>,
) -> Option<f64> {
    session.forwarder.abort();
    if let Err(e) = session.stream.stop().await {
        debug!(session_id = %session.id, %e, "provider stop failed");
    }

    state.sessions.remove(&session.id)?;

    let duration = session.started.elapsed().as_secs_f64();
    let (input_units, output_units) = match session.kind {
        ServiceKind::SpeechToText => (session.audio_seconds, 0.0),
        ServiceKind::LanguageModel => (session.tokens_in as f64, session.tokens_out as f64),
    };
    let cost = session.provider.cost(&session.model, input_units, output_units);
    let identity = session_owner(&session.id).unwrap_or("unknown").to_string();

    let metrics = UsageMetrics {
        identity,
        service: session.kind.code().to_string(),
        provider: session.provider.name().to_string(),
        model: session.model.clone(),
        tokens_in: session.tokens_in,
        tokens_out: session.tokens_out,
        audio_seconds: session.audio_seconds,
        cost,
        success,
        error,
    };

    // Fire and forget relative to the response path.
    let recorder = state.recorder.clone();
    tokio::spawn(async move {
        recorder.record(metrics).await;
    });

    info!(session_id = %session.id, duration, success, "session closed");
    Some(duration)
}
