//! Streamable-HTTP transport surface (axum binding for C8).
//!
//! Grounded in the teacher's `gateway/router.rs` + `gateway/server.rs` pair:
//! a `Router` built once over shared `AppState`, `tower-http` middleware
//! layered the same way (`CatchPanicLayer`, `TraceLayer`, CORS), and a
//! `run` entry point that binds, logs its listen address, and drains
//! in-flight requests on shutdown via a broadcast channel.
//!
//! Concrete SSE/event-stream codecs are out of scope; this binds the single
//! request/response `POST /mcp` cycle plus a health check.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcResponse, RequestId};
use crate::runtime::Runtime;
use crate::session::ClientInfo;
use crate::transport::{SESSION_HEADER, SessionTransport, TransportOptions};
use crate::{Error, Result};

/// Shared application state for the HTTP transport surface.
pub struct AppState {
    runtime: Arc<Runtime>,
    transports: DashMap<String, Arc<SessionTransport>>,
}

/// Build the axum router over `runtime`.
#[must_use]
pub fn create_router(runtime: Arc<Runtime>) -> Router {
    let state = Arc::new(AppState {
        runtime,
        transports: DashMap::new(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn request_id(body: &Value) -> Option<RequestId> {
    match body.get("id") {
        Some(Value::String(s)) => Some(RequestId::String(s.clone())),
        Some(Value::Number(n)) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn json_error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Response {
    (StatusCode::OK, Json(JsonRpcResponse::error(id, code, message))).into_response()
}

async fn mcp_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let id = request_id(&body);
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();

    if method == "initialize" {
        return handle_initialize(&state, &headers, &body, id).await;
    }

    let Some(session_id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string) else {
        return json_error(id, rpc_codes::INVALID_PARAMS, "missing Mcp-Session-Id header");
    };

    if let Some(transport) = state.transports.get(&session_id) {
        if let Err(e) = transport.handle_request(&headers, body.clone()) {
            return json_error(id, e.to_rpc_code(), e.to_string());
        }
    }

    match state.runtime.dispatch(body, &session_id, None).await {
        Ok(result) => {
            let response_id = id.unwrap_or(RequestId::Number(0));
            (StatusCode::OK, [(SESSION_HEADER, session_id)], Json(JsonRpcResponse::success(response_id, result)))
                .into_response()
        }
        Err(e) => json_error(id, e.to_rpc_code(), e.to_string()),
    }
}

async fn handle_initialize(state: &AppState, headers: &HeaderMap, body: &Value, id: Option<RequestId>) -> Response {
    let client_info = body
        .get("params")
        .and_then(|p| p.get("clientInfo"))
        .and_then(|ci| serde_json::from_value::<ClientInfo>(ci.clone()).ok())
        .unwrap_or(ClientInfo {
            name: "unknown".to_string(),
            version: "0".to_string(),
        });
    let capabilities = body.get("params").and_then(|p| p.get("capabilities")).cloned().unwrap_or(Value::Null);
    let token = bearer_token(headers);

    match state.runtime.create_session(client_info, capabilities, token).await {
        Ok((record, _authorization)) => {
            let transport = Arc::new(SessionTransport::new(TransportOptions::default()));
            if transport.set_initialization_state(&record.id).is_ok() {
                state.transports.insert(record.id.clone(), transport);
            }

            let result = json!({
                "protocolVersion": crate::MCP_PROTOCOL_VERSION,
                "serverInfo": { "name": "mcp-session-runtime", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {},
            });
            let response_id = id.unwrap_or(RequestId::Number(0));
            (StatusCode::OK, [(SESSION_HEADER, record.id)], Json(JsonRpcResponse::success(response_id, result)))
                .into_response()
        }
        Err(e) => json_error(id, e.to_rpc_code(), e.to_string()),
    }
}

/// Bind and serve `runtime` per `config.server`, draining in-flight
/// requests for up to `shutdown_timeout` on SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if the host/port cannot be parsed or bound.
pub async fn run(config: &Config, runtime: Arc<Runtime>) -> Result<()> {
    let addr = SocketAddr::new(
        config.server.host.parse().map_err(|e| Error::Config(format!("invalid host: {e}")))?,
        config.server.port,
    );

    let app = create_router(runtime);
    let listener = TcpListener::bind(addr).await?;

    info!(host = %config.server.host, port = config.server.port, "mcp-session-runtime listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{PromptCatalog, ResourceCatalog, ToolCatalog};
    use crate::protocol::{Prompt, Resource, Tool};
    use crate::runtime::Catalogs;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct EmptyTools;
    #[async_trait]
    impl ToolCatalog for EmptyTools {
        fn list_tools(&self) -> Vec<Tool> {
            vec![]
        }
        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value> {
            Err(Error::FlowNotFound)
        }
    }
    struct EmptyResources;
    #[async_trait]
    impl ResourceCatalog for EmptyResources {
        fn list_resources(&self) -> Vec<Resource> {
            vec![]
        }
        async fn read_resource(&self, _uri: &str) -> Result<Value> {
            Err(Error::FlowNotFound)
        }
    }
    struct EmptyPrompts;
    #[async_trait]
    impl PromptCatalog for EmptyPrompts {
        fn list_prompts(&self) -> Vec<Prompt> {
            vec![]
        }
        async fn get_prompt(&self, _name: &str, _arguments: Value) -> Result<Value> {
            Err(Error::FlowNotFound)
        }
    }

    fn test_runtime() -> Arc<Runtime> {
        let config = Config::default();
        let catalogs = Catalogs {
            tools: Arc::new(EmptyTools),
            resources: Arc::new(EmptyResources),
            prompts: Arc::new(EmptyPrompts),
        };
        Arc::new(Runtime::new(config, None, catalogs).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = create_router(test_runtime());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn initialize_then_list_tools_round_trip() {
        let app = create_router(test_runtime());

        let init_body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "clientInfo": { "name": "test", "version": "1.0" }, "capabilities": {} }
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(init_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(!session_id.is_empty());

        let list_body = json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .header(SESSION_HEADER, session_id)
                    .body(Body::from(list_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_session_header_is_rejected() {
        let app = create_router(test_runtime());
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.get("error").is_some());
    }
}
