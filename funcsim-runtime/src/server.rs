//! Watch mode: the HTTP invocation front end
//!
//! One listener per [`watch`] call. Every request, regardless of method
//! and path, becomes one invocation: the JSON body's `event` field is
//! the payload, and the response is `200 {"data": ...}` or
//! `500 {"error": ...}`. A bad request never takes the listener down.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::Response,
    routing::any,
    Router,
};
use bytes::Bytes;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::invoker::{self, EventSource, InvokeOptions};
use funcsim_core::InvokeError;

/// Options for the watch-mode server
#[derive(Clone)]
pub struct WatchOptions {
    pub host: String,
    pub port: u16,
    /// Baseline invocation options; each request contributes its event
    pub invoke: InvokeOptions,
}

impl WatchOptions {
    pub fn new(port: u16, invoke: InvokeOptions) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            invoke,
        }
    }
}

struct WatchState {
    baseline: InvokeOptions,
}

/// Build the watch-mode router. Exposed separately so tests can serve it
/// on an ephemeral listener.
pub fn router(baseline: InvokeOptions) -> Router {
    Router::new()
        .fallback(any(handle_invoke))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(WatchState { baseline }))
}

/// Start the HTTP front end and serve until the process exits.
pub async fn watch(options: WatchOptions) -> std::io::Result<()> {
    let app = router(options.invoke);
    let addr = format!("{}:{}", options.host, options.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await
}

async fn handle_invoke(
    State(state): State<Arc<WatchState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info!(method = %method, host = %host, path = %uri.path(), "Invocation request");

    match process(&state, &headers, &body).await {
        Ok(data) => {
            let payload = serde_json::json!({ "data": data });
            let body = serde_json::to_string(&payload).unwrap();
            info!(bytes = body.len(), "Invocation succeeded");

            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind().as_str(), "Invocation failed");

            Response::builder()
                .status(
                    StatusCode::from_u16(e.kind().http_status())
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(e.to_json()))
                .unwrap()
        }
    }
}

async fn process(
    state: &WatchState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Value, InvokeError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(InvokeError::Transport(
            "Invalid header Content-Type, must be application/json".to_string(),
        ));
    }

    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| InvokeError::Parse(format!("Invalid body: {}", e)))?;
    let event = parsed
        .get("event")
        .cloned()
        .ok_or_else(|| InvokeError::Transport("Invalid body".to_string()))?;

    // Fresh options per request: each invocation gets its own context
    // and handler-registry lookup.
    let mut options = state.baseline.clone();
    options.event = EventSource::Value(event);

    invoker::execute(options).await
}
