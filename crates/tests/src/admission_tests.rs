use serde_json::json;
use voxgate_config::Settings;

use crate::fixtures::test_app::TestApp;

fn tight_settings(free_limit: u32) -> Settings {
    let mut settings = Settings::default();
    settings.admission.free_limit = free_limit;
    settings.admission.window_secs = 60;
    settings
}

#[tokio::test]
async fn start_beyond_the_window_limit_is_rejected() {
    let app = TestApp::spawn_with(tight_settings(1)).await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "transcription_started");
    let session_id = started["sessionId"].as_str().unwrap().to_string();

    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    assert_eq!(ws.recv_json().await["type"], "session_stopped");

    // Stopping does not refund the window; the second start this minute
    // is over budget.
    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    let text = err["error"].as_str().unwrap();
    assert!(
        text.starts_with("Rate limit exceeded, retry after"),
        "unexpected error: {text}"
    );
    assert_eq!(app.health().await["sessions"], 0);
}

#[tokio::test]
async fn identities_have_independent_windows() {
    let app = TestApp::spawn_with(tight_settings(1)).await;

    let mut first = app.connect_ws().await;
    first.handshake(&app.token("user-1", "free")).await;
    first
        .send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    assert_eq!(first.recv_json().await["type"], "transcription_started");

    // user-1 exhausted their window; user-2 is unaffected.
    let mut second = app.connect_ws().await;
    second.handshake(&app.token("user-2", "free")).await;
    second
        .send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    assert_eq!(second.recv_json().await["type"], "transcription_started");
}

#[tokio::test]
async fn plan_tier_raises_the_limit() {
    let app = TestApp::spawn_with(tight_settings(1)).await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "pro")).await;

    // The pro limit (default 120) applies, not the free limit of 1.
    for _ in 0..3 {
        ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
            .await;
        let started = ws.recv_json().await;
        assert_eq!(started["type"], "transcription_started");
        let session_id = started["sessionId"].as_str().unwrap().to_string();
        ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
            .await;
        assert_eq!(ws.recv_json().await["type"], "session_stopped");
    }
}

#[tokio::test]
async fn rejected_admission_leaves_the_connection_usable() {
    let app = TestApp::spawn_with(tight_settings(0)).await;
    let mut ws = app.connect_ws().await;
    ws.handshake(&app.token("user-1", "free")).await;

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");

    // Still authenticated, still connected.
    ws.send_json(&json!({ "type": "stop_session", "sessionId": "user-1:stt:1" }))
        .await;
    assert_eq!(ws.recv_json().await["error"], "Invalid session");
}
