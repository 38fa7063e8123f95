//! HTTP API module.
//!
//! REST endpoints for runs, transcript, telemetry and the visualizer, plus
//! the visualizer reverse proxy.

mod error;
mod handlers;
pub mod proxy;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use proxy::{ProxyError, ProxyForwarder, ProxyRequest, ProxyResponse};
pub use routes::create_router;
pub use state::{AppState, DEFAULT_MAX_BODY_BYTES};
