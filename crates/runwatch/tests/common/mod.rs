//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, header};
use axum::response::Response;
use runwatch::api::{self, AppState};
use runwatch::config::AppConfig;
use runwatch::runner::Run;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Config pointing every file under `dir` with no host tools required.
pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.runner.transcript_path = Some(
        dir.path()
            .join("command_history.log")
            .to_string_lossy()
            .into_owned(),
    );
    config.runner.kill_grace_secs = 2;
    config.runner.stop_timeout_secs = 10;
    config.telemetry.cpu_settle_ms = 0;
    config.telemetry.gpu_query_binary = String::new();
    // A long sleep stands in for the metrics UI.
    config.visualizer.binary = "sleep".to_string();
    config.visualizer.args = vec!["30".to_string()];
    config.visualizer.default_log_dir = dir.path().join("logs").to_string_lossy().into_owned();
    config.visualizer.kill_grace_secs = 1;
    config.proxy.timeout_secs = 5;
    config
}

/// Router plus the state behind it. Keep the `TempDir` alive for the test.
pub fn test_app() -> (Router, AppState, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let state = AppState::from_config(&test_config(&dir)).expect("build app state");
    (api::create_router(state.clone()), state, dir)
}

pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().uri(uri).method(method);
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn body_text(response: Response) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

/// Wait until the current run reaches a terminal state.
pub async fn wait_for_finished_run(state: &AppState) -> Run {
    for _ in 0..200 {
        if let Some(run) = state.runner.current().filter(|run| !run.is_running()) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run did not finish in time");
}

/// A port nothing is listening on right now.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve `router` on an ephemeral loopback port.
pub async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Open a WebSocket to the live channel of a served router.
pub async fn connect_ws(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
        .await
        .expect("connect websocket");
    ws
}

/// Next JSON text frame, or `None` once the server closed the socket.
pub async fn next_ws_event(ws: &mut WsClient) -> Option<Value> {
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no websocket frame within 5s");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("websocket error: {e}"),
        }
    }
}
