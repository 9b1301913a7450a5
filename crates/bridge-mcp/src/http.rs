//! Streamable-HTTP MCP transport: a single `POST /mcp` endpoint accepting one
//! request object or a JSON-RPC batch array, plus `GET /health` for process
//! supervisors. Optional bearer-token auth gates every route but `/health`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use bridge_core::time::now_ms;

use crate::rpc::{invalid_request_response, parse_error_response, Dispatcher, RpcRequest, RpcResponse};

#[derive(Clone)]
struct HttpState {
    dispatcher: Arc<Dispatcher>,
    bearer_token: Option<Arc<str>>,
    endpoint: Arc<str>,
}

pub struct HttpConfig {
    pub bind_addr: SocketAddr,
    pub bearer_token: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".parse().unwrap(),
            bearer_token: None,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

pub async fn run(dispatcher: Arc<Dispatcher>, config: HttpConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let local_addr = listener.local_addr().unwrap_or(config.bind_addr);
    let endpoint: Arc<str> = Arc::from(format!("http://{local_addr}/mcp"));

    let state = HttpState {
        dispatcher,
        bearer_token: config.bearer_token.map(Arc::from),
        endpoint,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/mcp", post(handle_mcp))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %local_addr, "mcp http transport listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let sessions_active = state.dispatcher.tool_surface().list_sessions().await.len();
    Json(json!({
        "ok": true,
        "ts": now_ms(),
        "mode": "http",
        "endpoint": state.endpoint,
        "sessions_active": sessions_active,
    }))
}

fn authorized(state: &HttpState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.bearer_token else {
        return true;
    };
    let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    header.strip_prefix("Bearer ").map(|tok| tok == expected.as_ref()).unwrap_or(false)
}

async fn handle_mcp(State(state): State<HttpState>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        warn!("mcp http: rejected request with missing/invalid bearer token");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::OK, Json(parse_error_response(e.to_string()).to_value())).into_response(),
    };

    match value {
        Value::Array(batch) => {
            let mut responses = Vec::with_capacity(batch.len());
            for item in batch {
                responses.push(dispatch_one(&state.dispatcher, item).await);
            }
            let responses: Vec<Value> = responses.into_iter().flatten().map(|r| r.to_value()).collect();
            if responses.is_empty() {
                StatusCode::ACCEPTED.into_response()
            } else {
                (StatusCode::OK, Json(responses)).into_response()
            }
        }
        single => match dispatch_one(&state.dispatcher, single).await {
            Some(resp) => (StatusCode::OK, Json(resp.to_value())).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
    }
}

async fn dispatch_one(dispatcher: &Dispatcher, value: Value) -> Option<RpcResponse> {
    match serde_json::from_value::<RpcRequest>(value) {
        Ok(req) => dispatcher.dispatch(req).await,
        Err(e) => Some(invalid_request_response(e.to_string())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down mcp http transport"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down mcp http transport"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C, shutting down mcp http transport");
    }
}
