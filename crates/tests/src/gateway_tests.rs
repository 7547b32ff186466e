use serde_json::json;

use crate::fixtures::test_app::TestApp;

#[tokio::test]
async fn health_reports_connection_and_session_counts() {
    let app = TestApp::spawn().await;

    let health = app.health().await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 0);
    assert_eq!(health["sessions"], 0);

    let mut ws = app.connect_ws().await;
    let connected = ws.recv_json().await;
    assert_eq!(connected["type"], "connected");
    assert!(connected["connectionId"].is_string());

    let health = app.health().await;
    assert_eq!(health["connections"], 1);
}

#[tokio::test]
async fn valid_token_authenticates() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;

    let reply = ws.handshake(&app.token("user-1", "pro")).await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["userId"], "user-1");
    assert_eq!(reply["plan"], "pro");
}

#[tokio::test]
async fn rejected_token_closes_the_connection() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;

    let reply = ws.handshake("not-a-real-token").await;
    assert_eq!(reply["type"], "auth_error");
    ws.expect_closed().await;
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;

    let expired = app.auth.issue("user-1", "free", -60).unwrap();
    let reply = ws.handshake(&expired).await;
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["error"], "Token expired");
}

#[tokio::test]
async fn malformed_frames_are_recovered_in_place() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.recv_json().await; // connected

    ws.send_json(&json!({ "no_type": true })).await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Invalid message format");

    // The connection survived; authentication still works.
    ws.send_json(&json!({ "type": "auth", "token": app.token("user-1", "free") }))
        .await;
    assert_eq!(ws.recv_json().await["type"], "auth_success");
}

#[tokio::test]
async fn unknown_type_is_reported_by_name() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.recv_json().await; // connected

    ws.send_json(&json!({ "type": "subscribe" })).await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Unknown message type: subscribe");
}

#[tokio::test]
async fn reauthentication_is_rejected_and_the_session_survives() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    assert_eq!(ws.handshake(&app.token("user-1", "pro")).await["type"], "auth_success");

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let started = ws.recv_json().await;
    assert_eq!(started["type"], "transcription_started");
    let session_id = started["sessionId"].as_str().unwrap().to_string();

    // A second auth frame, even with a valid token for another user,
    // must not swap the connection's identity.
    ws.send_json(&json!({ "type": "auth", "token": app.token("user-2", "pro") }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Already authenticated");

    // The live session still belongs to user-1 and stops cleanly.
    ws.send_json(&json!({ "type": "stop_session", "sessionId": session_id }))
        .await;
    let stopped = ws.recv_json().await;
    assert_eq!(stopped["type"], "session_stopped");
    assert_eq!(stopped["sessionId"], session_id.as_str());

    let records = app.wait_for_usage(1).await;
    assert_eq!(records[0].metrics.identity, "user-1");
}

#[tokio::test]
async fn streaming_start_requires_authentication() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect_ws().await;
    ws.recv_json().await; // connected

    ws.send_json(&json!({ "type": "start_transcription", "provider": "streaming-x" }))
        .await;
    let err = ws.recv_json().await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "Not authenticated");
}
