//! API integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use runwatch::runner::LineEvent;
use runwatch::telemetry::TelemetrySample;
use runwatch::ws::{BroadcastHub, HubEvent};
use uuid::Uuid;

mod common;
use common::{
    body_json, body_text, connect_ws, next_ws_event, send, spawn_upstream, test_app,
    unused_port, wait_for_finished_run,
};

fn line_event(run_id: Uuid, seq: u64, text: &str) -> HubEvent {
    HubEvent::Line(LineEvent {
        run_id,
        seq,
        text: text.to_string(),
    })
}

async fn wait_for_no_subscribers(hub: &BroadcastHub) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber was never removed");
}

// ============================================================================
// Health and runs
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state, _dir) = test_app();

    let response = send(&app, Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_run_output_lands_in_transcript() {
    let (app, state, _dir) = test_app();

    let response = send(
        &app,
        Method::POST,
        "/api/run",
        Some(json!({ "command": "sh -c 'echo hello; echo world >&2; exit 3'" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["run"]["status"], "running");

    let run = wait_for_finished_run(&state).await;
    assert_eq!(run.state, runwatch::runner::RunState::Failed { code: 3 });

    let response = send(&app, Method::GET, "/api/transcript", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let text = body_text(response).await;
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("==> ["));
    assert!(lines[0].contains("run started: sh -c"));
    assert!(lines.contains(&"hello"));
    assert!(lines.contains(&"world"));
    assert_eq!(lines.last(), Some(&"[run finished] exit code: 3"));

    let response = send(&app, Method::GET, "/api/run", None).await;
    let json = body_json(response).await;
    assert_eq!(json["run"]["status"], "failed");
    assert_eq!(json["run"]["code"], 3);
}

#[tokio::test]
async fn test_second_start_conflicts_then_stop() {
    let (app, state, _dir) = test_app();

    let response = send(
        &app,
        Method::POST,
        "/api/run",
        Some(json!({ "command": "sleep 30" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        Method::POST,
        "/api/run",
        Some(json!({ "command": "echo second" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["code"], "CONFLICT");

    let response = send(&app, Method::POST, "/api/run/stop", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["changed"], true);

    let run = state.runner.current().unwrap();
    assert_eq!(
        run.state,
        runwatch::runner::RunState::Failed { code: -libc::SIGTERM }
    );
    assert!(!state.runner.is_running());

    // Nothing left to stop.
    let response = send(&app, Method::POST, "/api/run/stop", None).await;
    let json = body_json(response).await;
    assert_eq!(json["changed"], false);
}

#[tokio::test]
async fn test_invalid_command_is_bad_request() {
    let (app, _state, _dir) = test_app();

    for command in ["", "   ", "echo 'unterminated"] {
        let response = send(
            &app,
            Method::POST,
            "/api/run",
            Some(json!({ "command": command })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{command:?}");
        let json = body_json(response).await;
        assert_eq!(json["code"], "BAD_REQUEST");
    }
}

#[tokio::test]
async fn test_missing_binary_reports_crashed_run() {
    let (app, state, _dir) = test_app();

    let response = send(
        &app,
        Method::POST,
        "/api/run",
        Some(json!({ "command": "runwatch-no-such-binary --flag" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["run"]["status"], "crashed");
    assert!(!state.runner.is_running());

    let text = body_text(send(&app, Method::GET, "/api/transcript", None).await).await;
    assert!(text.contains("[run error] failed to start"));
}

#[tokio::test]
async fn test_clear_transcript() {
    let (app, state, _dir) = test_app();

    send(
        &app,
        Method::POST,
        "/api/run",
        Some(json!({ "command": "echo something" })),
    )
    .await;
    wait_for_finished_run(&state).await;

    let mut subscription = state.hub.subscribe();
    assert!(!subscription.replay.transcript.is_empty());

    let response = send(&app, Method::POST, "/api/transcript/clear", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        subscription.receiver.recv().await,
        Some(HubEvent::TranscriptCleared)
    );

    let text = body_text(send(&app, Method::GET, "/api/transcript", None).await).await;
    assert_eq!(text, "");
}

// ============================================================================
// Live channel
// ============================================================================

#[tokio::test]
async fn test_ws_replays_history_then_streams_live_events() {
    let (app, state, _dir) = test_app();
    let run_id = Uuid::new_v4();
    state.hub.publish(line_event(run_id, 0, "earlier line"));
    state.hub.publish(HubEvent::Telemetry(TelemetrySample {
        cpu: 5.0,
        ..Default::default()
    }));

    let addr = spawn_upstream(app).await;
    let mut ws = connect_ws(addr).await;

    let history = next_ws_event(&mut ws).await.unwrap();
    assert_eq!(history["event"], "history");
    assert_eq!(history["data"]["history"], "earlier line\n");
    assert_eq!(history["data"]["telemetry"].as_array().unwrap().len(), 1);
    assert_eq!(state.hub.subscriber_count(), 1);

    state.hub.publish(line_event(run_id, 1, "live line"));
    let line = next_ws_event(&mut ws).await.unwrap();
    assert_eq!(line["event"], "line");
    assert_eq!(line["data"]["text"], "live line");
    assert_eq!(line["data"]["seq"], 1);

    // The line arrives once; the next frame is the following event.
    state.hub.publish(HubEvent::Telemetry(TelemetrySample {
        cpu: 7.0,
        ..Default::default()
    }));
    let telemetry = next_ws_event(&mut ws).await.unwrap();
    assert_eq!(telemetry["event"], "telemetry");
    assert_eq!(telemetry["data"]["cpu"], 7.0);

    ws.close(None).await.unwrap();
    wait_for_no_subscribers(&state.hub).await;
}

#[tokio::test]
async fn test_ws_receives_transcript_cleared() {
    let (app, state, _dir) = test_app();
    state.hub.publish(line_event(Uuid::new_v4(), 0, "old"));

    let addr = spawn_upstream(app.clone()).await;
    let mut ws = connect_ws(addr).await;
    assert_eq!(next_ws_event(&mut ws).await.unwrap()["event"], "history");

    let response = send(&app, Method::POST, "/api/transcript/clear", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cleared = next_ws_event(&mut ws).await.unwrap();
    assert_eq!(cleared["event"], "transcript_cleared");

    // A new connection starts from the empty transcript.
    let mut fresh = connect_ws(addr).await;
    let history = next_ws_event(&mut fresh).await.unwrap();
    assert_eq!(history["data"]["history"], "");
}

#[tokio::test]
async fn test_ws_closes_subscriber_that_falls_behind() {
    let (_, mut state, _dir) = test_app();
    state.hub = Arc::new(BroadcastHub::with_buffer_size(
        state.hub.transcript().clone(),
        state.hub.telemetry().clone(),
        1,
    ));
    let app = runwatch::api::create_router(state.clone());

    let addr = spawn_upstream(app).await;
    let mut ws = connect_ws(addr).await;
    assert_eq!(next_ws_event(&mut ws).await.unwrap()["event"], "history");

    // No await in between: the connection task cannot drain its buffer.
    let run_id = Uuid::new_v4();
    for seq in 0..5 {
        state.hub.publish(line_event(run_id, seq, &format!("line {seq}")));
    }
    assert_eq!(state.hub.subscriber_count(), 0);

    let mut delivered = 0;
    while let Some(event) = next_ws_event(&mut ws).await {
        assert_eq!(event["event"], "line");
        delivered += 1;
    }
    assert_eq!(delivered, 1);

    // Reconnecting replays everything that was recorded.
    let mut ws = connect_ws(addr).await;
    let history = next_ws_event(&mut ws).await.unwrap();
    assert_eq!(
        history["data"]["history"],
        "line 0\nline 1\nline 2\nline 3\nline 4\n"
    );
}

// ============================================================================
// Telemetry
// ============================================================================

#[tokio::test]
async fn test_telemetry_history_endpoint() {
    let (app, state, _dir) = test_app();

    let response = send(&app, Method::GET, "/api/telemetry", None).await;
    assert_eq!(body_json(response).await, json!([]));

    for i in 0..3 {
        state.hub.publish(HubEvent::Telemetry(TelemetrySample {
            cpu: i as f32,
            time: format!("12:00:0{i}"),
            ..Default::default()
        }));
    }

    let json = body_json(send(&app, Method::GET, "/api/telemetry", None).await).await;
    let samples = json.as_array().unwrap();
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0]["time"], "12:00:00");
    assert_eq!(samples[2]["cpu"], 2.0);
}

#[tokio::test]
async fn test_config_endpoint() {
    let (app, _state, _dir) = test_app();

    let response = send(&app, Method::GET, "/api/config", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["max_memory"].as_u64().unwrap() > 0);
    assert_eq!(json["max_gpu_memory"], 0.0);
    assert_eq!(json["visualizer_running"], false);
}

// ============================================================================
// Visualizer
// ============================================================================

#[tokio::test]
async fn test_visualizer_lifecycle() {
    let (app, state, dir) = test_app();

    let json = body_json(send(&app, Method::GET, "/api/visualizer", None).await).await;
    assert_eq!(json["running"], false);
    assert_eq!(json["state"], "stopped");

    let port = unused_port();
    let log_dir = dir.path().join("runs").to_string_lossy().into_owned();
    let response = send(
        &app,
        Method::POST,
        "/api/visualizer",
        Some(json!({ "enable": true, "logDir": log_dir, "port": port.to_string() })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["changed"], true);
    assert_eq!(json["status"]["running"], true);
    assert_eq!(json["status"]["port"], port);
    assert_eq!(json["status"]["url"], format!("http://127.0.0.1:{port}"));
    assert!(dir.path().join("runs").is_dir());

    // Enabling again changes nothing.
    let json = body_json(
        send(
            &app,
            Method::POST,
            "/api/visualizer",
            Some(json!({ "enable": true })),
        )
        .await,
    )
    .await;
    assert_eq!(json["changed"], false);

    // Restart keeps the log dir and takes the new port.
    let new_port = unused_port();
    let json = body_json(
        send(
            &app,
            Method::POST,
            "/api/visualizer/restart",
            Some(json!({ "port": new_port })),
        )
        .await,
    )
    .await;
    assert_eq!(json["status"]["running"], true);
    assert_eq!(json["status"]["port"], new_port);
    assert_eq!(json["status"]["log_dir"], log_dir);

    let json = body_json(send(&app, Method::GET, "/api/config", None).await).await;
    assert_eq!(json["visualizer_running"], true);

    let json = body_json(
        send(
            &app,
            Method::POST,
            "/api/visualizer",
            Some(json!({ "enable": false })),
        )
        .await,
    )
    .await;
    assert_eq!(json["changed"], true);
    assert_eq!(json["status"]["running"], false);
    assert!(!state.visualizer.is_running());
}

#[tokio::test]
async fn test_start_training_launches_both() {
    let (app, state, dir) = test_app();

    let response = send(
        &app,
        Method::POST,
        "/api/start-training",
        Some(json!({
            "command": "echo training",
            "enablePanel": true,
            "panelPath": dir.path().join("tb").to_string_lossy(),
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert!(json["run"]["id"].is_string());
    assert!(state.visualizer.is_running());

    wait_for_finished_run(&state).await;

    // A visualizer that is already up is fine.
    let response = send(
        &app,
        Method::POST,
        "/api/start-training",
        Some(json!({ "command": "echo again", "enablePanel": true })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(state.visualizer.is_running());

    wait_for_finished_run(&state).await;
    state.shutdown().await;
    assert!(!state.visualizer.is_running());
}

// ============================================================================
// Proxy
// ============================================================================

#[tokio::test]
async fn test_proxy_without_visualizer_is_not_found() {
    let (app, _state, _dir) = test_app();

    for uri in ["/proxy", "/proxy/", "/proxy/data/runs"] {
        let response = send(&app, Method::GET, uri, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_proxy_unreachable_upstream_is_bad_gateway() {
    let (app, state, _dir) = test_app();

    let port = unused_port();
    send(
        &app,
        Method::POST,
        "/api/visualizer",
        Some(json!({ "enable": true, "port": port })),
    )
    .await;
    assert!(state.visualizer.is_running());

    let response = send(&app, Method::GET, "/proxy/", None).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_GATEWAY");

    state.visualizer.stop().await.unwrap();
}

fn upstream_router() -> Router {
    Router::new()
        .route("/", get(|| async { "index" }))
        .route(
            "/echo/{*rest}",
            get(|uri: Uri| async move { uri.to_string() }),
        )
        .route(
            "/redirect",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")]) }),
        )
        .route(
            "/cookies",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.append(header::SET_COOKIE, "a=1; Path=/".parse().unwrap());
                headers.append(header::SET_COOKIE, "b=2; Path=/".parse().unwrap());
                (headers, "cookies").into_response()
            }),
        )
        .route(
            "/upload",
            post(|headers: HeaderMap, body: Bytes| async move {
                let cookie = headers
                    .get(header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (StatusCode::CREATED, format!("{cookie}|{}", body.len()))
            }),
        )
}

#[tokio::test]
async fn test_proxy_relays_upstream_faithfully() {
    let (app, state, _dir) = test_app();
    let upstream = spawn_upstream(upstream_router()).await;

    send(
        &app,
        Method::POST,
        "/api/visualizer",
        Some(json!({ "enable": true, "port": upstream.port() })),
    )
    .await;
    assert!(state.visualizer.is_running());

    let response = send(&app, Method::GET, "/proxy", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "index");

    // Path encoding and query string arrive untouched.
    let response = send(
        &app,
        Method::GET,
        "/proxy/echo/a%2Fb%20c?tag=loss&run=x%26y",
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "/echo/a%2Fb%20c?tag=loss&run=x%26y"
    );

    // Redirects are handed to the client, not followed.
    let response = send(&app, Method::GET, "/proxy/redirect", None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/elsewhere");

    let response = send(&app, Method::GET, "/proxy/cookies", None).await;
    let cookies: Vec<&str> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(cookies, vec!["a=1; Path=/", "b=2; Path=/"]);

    let request = axum::http::Request::builder()
        .uri("/proxy/upload")
        .method(Method::POST)
        .header(header::COOKIE, "session=abc")
        .body(axum::body::Body::from(vec![7u8; 4096]))
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_text(response).await, "session=abc|4096");

    // Unknown upstream paths keep their status.
    let response = send(&app, Method::GET, "/proxy/missing", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    state.visualizer.stop().await.unwrap();
    let response = send(&app, Method::GET, "/proxy", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _state, _dir) = test_app();
    let response = send(&app, Method::GET, "/api/nope", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
