//! API request handlers.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, Uri, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::runner::Run;
use crate::telemetry::{HostCapacity, TelemetrySample};
use crate::visualizer::{LaunchOverrides, LaunchParams, VisualizerStatus, deserialize_port};

use super::error::{ApiError, ApiResult};
use super::proxy::ProxyRequest;
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<Run>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    /// Whether the call changed anything.
    pub changed: bool,
}

/// Start the supervised command.
#[instrument(skip(state))]
pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<Json<RunResponse>> {
    let run = state.runner.start(&request.command).await?;
    Ok(Json(RunResponse {
        success: true,
        run: Some(run),
    }))
}

/// Stop the active run, if any.
pub async fn stop_run(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    let changed = state.runner.stop().await?;
    Ok(Json(ActionResponse {
        success: true,
        changed,
    }))
}

/// The active run or the most recent one.
pub async fn get_run(State(state): State<AppState>) -> Json<RunResponse> {
    Json(RunResponse {
        success: true,
        run: state.runner.current(),
    })
}

// ============================================================================
// Transcript and telemetry
// ============================================================================

/// Full transcript as plain text.
pub async fn get_transcript(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.hub.transcript().text(),
    )
}

pub async fn clear_transcript(State(state): State<AppState>) -> ApiResult<Json<ActionResponse>> {
    state.hub.clear_transcript()?;
    Ok(Json(ActionResponse {
        success: true,
        changed: true,
    }))
}

/// Buffered telemetry, oldest first.
pub async fn get_telemetry(State(state): State<AppState>) -> Json<Vec<TelemetrySample>> {
    Json(state.sampler.history())
}

/// Host sizes for chart scaling plus the visualizer flag.
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    #[serde(flatten)]
    pub capacity: HostCapacity,
    pub visualizer_running: bool,
}

pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        capacity: state.sampler.host_capacity().await,
        visualizer_running: state.visualizer.is_running(),
    })
}

// ============================================================================
// Visualizer
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizerRequest {
    pub enable: bool,
    #[serde(default, alias = "log_dir")]
    pub log_dir: Option<String>,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VisualizerResponse {
    pub success: bool,
    pub changed: bool,
    pub status: VisualizerStatus,
}

pub async fn get_visualizer(State(state): State<AppState>) -> Json<VisualizerStatus> {
    Json(state.visualizer.status())
}

/// Start or stop the visualizer.
#[instrument(skip(state))]
pub async fn set_visualizer(
    State(state): State<AppState>,
    Json(request): Json<VisualizerRequest>,
) -> ApiResult<Json<VisualizerResponse>> {
    let changed = if request.enable {
        let params = state.visualizer.default_params().merged(LaunchOverrides {
            log_dir: request.log_dir,
            port: request.port,
            host: request.host,
        });
        state.visualizer.start(params).await?
    } else {
        state.visualizer.stop().await?
    };

    Ok(Json(VisualizerResponse {
        success: true,
        changed,
        status: state.visualizer.status(),
    }))
}

/// Restart with optional overrides; an empty body keeps the last parameters.
pub async fn restart_visualizer(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<VisualizerResponse>> {
    let overrides = if body.iter().all(u8::is_ascii_whitespace) {
        LaunchOverrides::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid restart parameters: {e}")))?
    };

    let changed = state.visualizer.restart(overrides).await?;
    Ok(Json(VisualizerResponse {
        success: true,
        changed,
        status: state.visualizer.status(),
    }))
}

// ============================================================================
// Combined launch
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrainingRequest {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub enable_panel: bool,
    #[serde(default)]
    pub panel_path: Option<String>,
}

/// Configure the visualizer and start the command in one call.
///
/// An already running visualizer is left as is.
#[instrument(skip(state))]
pub async fn start_training(
    State(state): State<AppState>,
    Json(request): Json<StartTrainingRequest>,
) -> ApiResult<Json<RunResponse>> {
    if request.enable_panel {
        let defaults = state.visualizer.default_params();
        let params = LaunchParams {
            log_dir: request
                .panel_path
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.log_dir),
            ..defaults
        };
        if !state.visualizer.start(params).await? {
            info!("Visualizer already running, keeping it");
        }
    } else {
        state.visualizer.stop().await?;
    }

    let run = if request.command.trim().is_empty() {
        None
    } else {
        Some(state.runner.start(&request.command).await?)
    };

    Ok(Json(RunResponse { success: true, run }))
}

// ============================================================================
// Proxy
// ============================================================================

/// Mount point of the proxy routes.
pub const PROXY_PREFIX: &str = "/proxy";

/// Relay any request below `/proxy` to the visualizer.
///
/// The upstream path is cut from the raw request URI so percent-encoding is
/// preserved.
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let path = upstream_path(uri.path()).to_string();
    let upstream = state
        .proxy
        .forward(ProxyRequest {
            method,
            path,
            query: uri.query().map(str::to_string),
            headers,
            body,
        })
        .await?;

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    Ok(response)
}

fn upstream_path(request_path: &str) -> &str {
    request_path
        .strip_prefix(PROXY_PREFIX)
        .unwrap_or(request_path)
        .trim_start_matches('/')
}
