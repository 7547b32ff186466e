use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::json;

use crate::fixtures::test_app::TestApp;

fn audio_frame(session_id: &str, bytes: &[u8]) -> serde_json::Value {
    json!({
        "type": "audio_data",
        "sessionId": session_id,
        "audioData": BASE64.encode(bytes),
    })
}

#[tokio::test]
async fn full_transcription_lifecycle_records_usage_once() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    assert_eq!(ws.handshake(&app.token("user-1", "pro")).await["type"], "auth_success");

    ws.send_json(&json!({
        "type": "start_transcription",
        "provider": "streaming-x",
        "language": "en",
        "sampleRate": 16000,
    }))
    .await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "transcription_started");
    assert_eq!(started["provider"], "streaming-x");
    assert_eq!(started["status"], "listening");
    let session_id = started["sessionId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("user-1:stt:"));

    ws.send_json(&audio_frame(&session_id, &[0u8; 3200])).await;
    let partial = ws.recv_json().await;
    assert_eq!(partial["type"], "partial_transcript");
    assert_eq!(partial["sessionId"], session_id.as_str());
    assert_eq!(partial["data"], "partial 1");
    let finald = ws.recv_json().await;
    assert_eq!(finald["type"], "transcript");
    assert_eq!(finald["data"], "segment 1");

    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    let stopped = ws.recv_json().await;
    assert_eq!(stopped["type"], "session_stopped");
    assert_eq!(stopped["sessionId"], session_id.as_str());
    assert!(stopped["duration"].as_f64().unwrap() >= 0.0);

    let records = app.wait_for_usage(1).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.metrics.identity, "user-1");
    assert_eq!(record.metrics.service, "stt");
    assert_eq!(record.metrics.provider, "streaming-x");
    assert!(record.metrics.success);
    // 3200 bytes of 16 kHz 16-bit mono is 0.1 seconds.
    assert!((record.metrics.audio_seconds - 0.1).abs() < 1e-9);

    // The stop already tore the session down; no second record appears.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(app.sink.records().len(), 1);
    assert_eq!(app.health().await["sessions"], 0);
}

#[tokio::test]
async fn batch_only_provider_cannot_stream() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "openai-batch" }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Provider does not support streaming");

    // No session was created.
    assert_eq!(app.health().await["sessions"], 0);
    assert!(app.sink.is_empty());
}

#[tokio::test]
async fn foreign_session_id_with_same_identity_is_invalid() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "transcription_started");

    // Well-formed id minted for this identity, but not this session.
    ws.send_json(&audio_frame("user-1:stt:1234567890", &[0u8; 16]))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Invalid session");
}

#[tokio::test]
async fn another_identitys_session_id_is_denied() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&audio_frame("user-2:stt:1234567890", &[0u8; 16]))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Access denied");
}

#[tokio::test]
async fn second_stop_is_an_invalid_session() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let started = ws.recv_json().await;
    let session_id = started["sessionId"].as_str().unwrap().to_string();

    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    assert_eq!(ws.recv_json().await["type"], "session_stopped");

    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Invalid session");

    // Exactly one usage record despite the double stop.
    app.wait_for_usage(1).await;
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(app.sink.records().len(), 1);
}

#[tokio::test]
async fn invalid_base64_audio_is_a_malformed_frame() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let started = ws.recv_json().await;
    let session_id = started["sessionId"].as_str().unwrap().to_string();

    ws.send_json(&json!({
        "type": "audio_data",
        "sessionId": session_id,
        "audioData": "%%% not base64 %%%",
    }))
    .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Invalid message format");

    // Session is still live and usable.
    ws.send_json(&audio_frame(&session_id, &[0u8; 16])).await;
    assert_eq!(ws.recv_json().await["type"], "partial_transcript");
}

#[tokio::test]
async fn failed_provider_connect_creates_no_session() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "flaky" }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Upstream failure: connection refused");

    assert_eq!(app.health().await["sessions"], 0);

    // The connection recovered; a working provider still starts.
    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    assert_eq!(ws.recv_json().await["type"], "transcription_started");
}

#[tokio::test]
async fn mid_stream_provider_error_records_a_failure() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "dropping" }))
        .await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "transcription_started");
    let session_id = started["sessionId"].as_str().unwrap().to_string();

    ws.send_json(&audio_frame(&session_id, &[0u8; 320])).await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Upstream failure: upstream dropped");

    let records = app.wait_for_usage(1).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(!record.metrics.success);
    assert_eq!(record.metrics.error.as_deref(), Some("upstream dropped"));
    assert_eq!(record.metrics.provider, "dropping");
    assert_eq!(app.health().await["sessions"], 0);

    // The error tore the session down; a later stop is invalid.
    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["error"], "Invalid session");
}

#[tokio::test]
async fn connection_loss_tears_down_and_records_usage() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    assert_eq!(ws.recv_json().await["type"], "transcription_started");
    assert_eq!(app.health().await["sessions"], 1);

    drop(ws);

    let records = app.wait_for_usage(1).await;
    assert!(records[0].metrics.success);
    assert_eq!(app.health().await["sessions"], 0);
}
