//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::{
    Router,
    routing::{any, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::ws;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        // Live stream
        .route("/ws", get(ws::ws_handler))
        // Runs
        .route("/run", get(handlers::get_run).post(handlers::start_run))
        .route("/run/stop", post(handlers::stop_run))
        .route("/start-training", post(handlers::start_training))
        // Transcript
        .route("/transcript", get(handlers::get_transcript))
        .route("/transcript/clear", post(handlers::clear_transcript))
        // Telemetry
        .route("/telemetry", get(handlers::get_telemetry))
        .route("/config", get(handlers::get_config))
        // Visualizer
        .route(
            "/visualizer",
            get(handlers::get_visualizer).post(handlers::set_visualizer),
        )
        .route("/visualizer/restart", post(handlers::restart_visualizer));

    let proxy_routes = Router::new()
        .route(handlers::PROXY_PREFIX, any(handlers::proxy))
        .route("/proxy/", any(handlers::proxy))
        .route("/proxy/{*path}", any(handlers::proxy))
        .layer(DefaultBodyLimit::max(state.max_body_bytes));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .merge(proxy_routes)
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer() -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
        Method::OPTIONS,
    ];

    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
    ];

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(methods)
        .allow_headers(headers)
}
