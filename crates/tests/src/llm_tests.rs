use serde_json::json;

use crate::fixtures::test_app::TestApp;

fn chat_start(provider: Option<&str>) -> serde_json::Value {
    let mut frame = json!({
        "type": "start_llm_stream",
        "model": "mock-model",
        "messages": [
            { "role": "system", "content": "You are terse." },
            { "role": "user", "content": "Say hello." },
        ],
        "max_tokens": 64,
        "temperature": 0.2,
    });
    if let Some(p) = provider {
        frame["provider"] = json!(p);
    }
    frame
}

#[tokio::test]
async fn llm_stream_relays_chunks_then_completes() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "pro")).await;

    ws.send_json(&chat_start(Some("mock-llm"))).await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "llm_started");
    assert_eq!(started["model"], "mock-model");
    assert_eq!(started["status"], "streaming");
    let session_id = started["sessionId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("user-1:llm:"));

    let chunk = ws.recv_json().await;
    assert_eq!(chunk["type"], "llm_chunk");
    assert_eq!(chunk["content"], "Hello");
    let chunk = ws.recv_json().await;
    assert_eq!(chunk["content"], " there");

    let complete = ws.recv_json().await;
    assert_eq!(complete["type"], "llm_complete");
    assert_eq!(complete["sessionId"], session_id.as_str());
    assert_eq!(complete["result"], "Hello there");

    let records = app.wait_for_usage(1).await;
    let record = &records[0];
    assert_eq!(record.metrics.service, "llm");
    assert_eq!(record.metrics.provider, "mock-llm");
    assert_eq!(record.metrics.model, "mock-model");
    assert_eq!(record.metrics.tokens_in, 12);
    assert_eq!(record.metrics.tokens_out, 4);
    assert!(record.metrics.success);
    assert!(record.metrics.cost > 0.0);

    // Completion already closed the session.
    assert_eq!(app.health().await["sessions"], 0);
    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    let err = ws.recv_type("error").await;
    assert_eq!(err["error"], "Invalid session");
}

#[tokio::test]
async fn omitted_provider_falls_back_to_a_streaming_default() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "pro")).await;

    ws.send_json(&chat_start(None)).await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "llm_started");

    let records = app.wait_for_usage(1).await;
    assert_eq!(records[0].metrics.provider, "mock-llm");
}

#[tokio::test]
async fn speech_provider_cannot_serve_llm_start() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "pro")).await;

    ws.send_json(&chat_start(Some("streaming-x"))).await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Provider does not support streaming");
    assert_eq!(app.health().await["sessions"], 0);
}

#[tokio::test]
async fn only_one_session_per_connection() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "pro")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    assert_eq!(ws.recv_json().await["type"], "transcription_started");

    ws.send_json(&chat_start(Some("mock-llm"))).await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Session already active");
}
