//! HTTP proxy for the visualizer UI.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use bytes::Bytes;
use log::{debug, error, warn};
use thiserror::Error;

use crate::visualizer::VisualizerManager;

/// Request headers never copied upstream. The body is re-framed and the
/// client negotiates its own encodings.
static STRIPPED_REQUEST_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    header::ACCEPT_ENCODING,
];

/// Response headers never relayed back. Bodies arrive decoded.
static STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] = [
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("visualizer is not running")]
    NotRunning,

    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// An incoming request to relay.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path below the proxy prefix, without leading slash.
    pub path: String,
    /// Raw query string, passed through verbatim.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The upstream answer, ready to relay.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forwards requests to the running visualizer.
pub struct ProxyForwarder {
    client: reqwest::Client,
    visualizer: Arc<VisualizerManager>,
}

impl ProxyForwarder {
    pub fn new(visualizer: Arc<VisualizerManager>, timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(Self { client, visualizer })
    }

    pub async fn forward(&self, req: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let base = self.visualizer.url().ok_or(ProxyError::NotRunning)?;
        let target = target_url(&base, &req.path, req.query.as_deref());
        debug!("Proxying {} {}", req.method, target);

        let response = self
            .client
            .request(req.method, &target)
            .headers(request_headers(&req.headers))
            .body(req.body)
            .send()
            .await
            .map_err(|e| upstream_error(&target, e))?;

        let status = response.status();
        let headers = response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| upstream_error(&target, e))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

fn upstream_error(target: &str, err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        warn!("Proxy request to {} timed out", target);
        ProxyError::Timeout(err.to_string())
    } else {
        error!("Proxy request to {} failed: {:?}", target, err);
        ProxyError::Upstream(err.to_string())
    }
}

/// `base/path?query`, with the path and query kept verbatim.
pub fn target_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Headers to send upstream. Cookies travel unchanged in `Cookie`.
pub fn request_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, &STRIPPED_REQUEST_HEADERS)
}

/// Headers to relay to the client, multi-valued ones included.
pub fn response_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, &STRIPPED_RESPONSE_HEADERS)
}

fn filter_headers(headers: &HeaderMap, stripped: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !stripped.contains(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
