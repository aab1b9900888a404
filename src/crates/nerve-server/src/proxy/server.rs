//! The proxy side-server.
//!
//! A small axum server with a `/health` endpoint (the manager's startup
//! gate) and a catch-all passthrough that forwards requests to the upstream
//! provider with credentials injected and the model optionally overridden.
//! Protocol transforms between wire formats are deliberately out of scope;
//! the core only needs a URL a node can point at.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ApiFormat;
use crate::error::{Result, ServerError};

/// Configuration for one proxy server.
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub host: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub upstream_api_key: String,
    pub upstream_model: Option<String>,
    pub api_format: ApiFormat,
}

struct ProxyState {
    config: ProxyServerConfig,
    client: reqwest::Client,
}

/// A proxy server ready to be spawned.
pub struct ProxyServer {
    config: ProxyServerConfig,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self { config }
    }

    /// Bind and serve in a background task until `shutdown` fires.
    ///
    /// Binding happens here so that an address-in-use race surfaces to the
    /// manager's retry loop rather than dying inside the task.
    pub async fn spawn(self, shutdown: oneshot::Receiver<()>) -> Result<tokio::task::JoinHandle<()>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::ProxyStart(format!("bind {addr} failed: {e}")))?;

        let state = Arc::new(ProxyState {
            client: reqwest::Client::new(),
            config: self.config,
        });

        let app = Router::new()
            .route("/health", get(health))
            .fallback(forward)
            .with_state(state);

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "proxy server exited with error");
            }
        });
        Ok(handle)
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Forward any other request to the upstream provider.
async fn forward(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}{}",
        state.config.upstream_base_url.trim_end_matches('/'),
        path
    );
    debug!(%method, %url, "proxying request");

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    // Override the requested model when the provider pins one.
    let body = match (&state.config.upstream_model, serde_json::from_slice::<Value>(&body)) {
        (Some(model), Ok(mut json_body)) if json_body.get("model").is_some() => {
            json_body["model"] = json!(model);
            serde_json::to_vec(&json_body).map(Bytes::from).unwrap_or(body)
        }
        _ => body,
    };

    let mut request = state
        .client
        .request(reqwest_method, &url)
        .body(body.to_vec());

    if let Some(content_type) = headers.get("content-type").and_then(|v| v.to_str().ok()) {
        request = request.header("content-type", content_type);
    }
    request = match state.config.api_format {
        ApiFormat::Anthropic => {
            let request = request.header("x-api-key", &state.config.upstream_api_key);
            match headers.get("anthropic-version").and_then(|v| v.to_str().ok()) {
                Some(version) => request.header("anthropic-version", version),
                None => request,
            }
        }
        ApiFormat::Openai => request.bearer_auth(&state.config.upstream_api_key),
    };

    match request.send().await {
        Ok(upstream) => {
            let status =
                StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = upstream
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = upstream.bytes().await.unwrap_or_default();

            let mut response = Response::builder().status(status);
            if let Some(content_type) = content_type {
                response = response.header("content-type", content_type);
            }
            response
                .body(axum::body::Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => {
            warn!(error = %e, %url, "upstream request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("upstream request failed: {e}")})),
            )
                .into_response()
        }
    }
}
