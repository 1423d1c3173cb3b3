//! REST API Server for the query router
//!
//! Exposes the orchestrator via HTTP endpoints. `stream: true` requests get
//! their chunks as Server-Sent Events, one JSON chunk per event.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::audit::AuditLog;
use crate::error::{ErrorKind, ErrorReport};
use crate::models::Query;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub chat_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// User-safe failure carrying the error kind.
    pub fn failure(report: &ErrorReport) -> Self {
        Self {
            data: Some(json!({ "kind": report.kind })),
            ..Self::error(report.message.clone())
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NoHandlerSucceeded => StatusCode::BAD_GATEWAY,
        ErrorKind::QueryTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NoHandlersRegistered
        | ErrorKind::NoDefaultConfigured
        | ErrorKind::DuplicateHandler
        | ErrorKind::UnknownHandler => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub audit: Arc<AuditLog>,
}

/// =============================
/// Health + Discovery
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_handlers(State(state): State<ApiState>) -> Json<ApiResponse> {
    let handlers: Vec<Value> = state
        .orchestrator
        .registry()
        .all()
        .iter()
        .map(|h| h.describe())
        .collect();

    Json(ApiResponse::success(handlers))
}

/// =============================
/// Ask Endpoint
/// =============================

async fn ask(State(state): State<ApiState>, Json(req): Json<AskRequest>) -> Response {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty".into())),
        )
            .into_response();
    }

    let mut query = Query::new(req.query);
    if let Some(context) = req.context {
        query = query.with_context(context);
    }

    info!(query_id = %query.query_id, stream = req.stream, "Received ask request");

    if req.stream {
        let chunks = state
            .orchestrator
            .ask(query)
            .map(|chunk| Event::default().json_data(&chunk));

        return Sse::new(chunks)
            .keep_alive(KeepAlive::default())
            .into_response();
    }

    match state.orchestrator.ask_answer(&query).await {
        Ok(answer) => (
            StatusCode::OK,
            Json(ApiResponse::success(json!({
                "query_id": answer.query_id,
                "handler": answer.handler,
                "answer": answer.text,
                "partial": answer.is_partial(),
                "tool_calls": answer.tool_calls,
                "failed_calls": answer.failed_calls,
                "attempts": answer.attempts,
                "delegation_path": answer.delegation_path,
            }))),
        )
            .into_response(),
        Err(e) => {
            let report = ErrorReport::from(&e);
            (status_for(report.kind), Json(ApiResponse::failure(&report))).into_response()
        }
    }
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> Response {
    let Some(user_msg) = req.messages.iter().rev().find(|m| m.role == "user") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("No user message found".into())),
        )
            .into_response();
    };

    // Only the current user turn is routed; the transcript length rides along as context.
    let ask_req = AskRequest {
        query: user_msg.content.clone(),
        context: Some(json!({
            "chat_id": req.chat_id,
            "turns": req.messages.len(),
        })),
        stream: req.stream,
    };

    ask(State(state), Json(ask_req)).await
}

/// =============================
/// Audit Endpoint
/// =============================

async fn get_audit(
    State(state): State<ApiState>,
    Path(query_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.audit.get(query_id).await {
        Some(record) => {
            let verified = state.audit.verify_integrity(query_id).await;
            (
                StatusCode::OK,
                Json(ApiResponse::success(json!({
                    "record": record,
                    "integrity_verified": verified,
                }))),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No audit record for {}", query_id))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>, audit: Arc<AuditLog>) -> Router {
    let state = ApiState { orchestrator, audit };

    Router::new()
        .route("/health", get(health))
        .route("/api/handlers", get(list_handlers))
        .route("/api/ask", post(ask))
        .route("/api/chat", post(chat_handler))
        .route("/api/audit/:query_id", get(get_audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    audit: Arc<AuditLog>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, audit);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::handlers::testing::EchoLogic;
    use crate::registry::{Handler, HandlerRegistry};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_with(registry: HandlerRegistry) -> (Router, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let orchestrator = Orchestrator::new(registry.seal().unwrap(), OrchestratorConfig::default())
            .unwrap()
            .with_observer(audit.clone());
        (create_router(Arc::new(orchestrator), audit.clone()), audit)
    }

    fn app() -> (Router, Arc<AuditLog>) {
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                Handler::leaf("analyst", "Financial Analyst", Arc::new(EchoLogic))
                    .with_capabilities(["price"])
                    .as_default(),
            )
            .unwrap();
        registry
            .register(
                Handler::leaf("researcher", "Researcher", Arc::new(EchoLogic))
                    .with_capabilities(["news"]),
            )
            .unwrap();
        app_with(registry)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_list_handlers() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/api/handlers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"][0]["name"], "analyst");
        assert_eq!(body["data"][1]["capabilities"], json!(["news"]));
    }

    #[tokio::test]
    async fn test_ask_json() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json("/api/ask", json!({"query": "any news on XYZ?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["handler"], "researcher");
        assert_eq!(body["data"]["answer"], "researcher: any news on XYZ?");
    }

    #[tokio::test]
    async fn test_ask_streams_sse() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json(
                "/api/ask",
                json!({"query": "price of XYZ", "stream": true}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let chunks: Vec<crate::models::ResponseChunk> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();

        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, "analyst: price of XYZ");
        assert!(chunks.last().unwrap().terminal);
    }

    #[tokio::test]
    async fn test_chat_requires_user_message() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({"messages": [{"role": "assistant", "content": "hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_uses_last_user_turn() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json(
                "/api/chat",
                json!({"chat_id": "c1", "messages": [
                    {"role": "user", "content": "latest news"},
                    {"role": "assistant", "content": "..."},
                    {"role": "user", "content": "price of XYZ"}
                ]}),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"]["answer"], "analyst: price of XYZ");
    }

    #[tokio::test]
    async fn test_empty_registry_maps_to_service_unavailable() {
        let (app, _) = app_with(HandlerRegistry::new());
        let response = app
            .oneshot(post_json("/api/ask", json!({"query": "price"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["data"]["kind"], "no_handlers_registered");
    }

    #[tokio::test]
    async fn test_audit_lookup() {
        let (app, audit) = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/ask", json!({"query": "price of XYZ"})))
            .await
            .unwrap();
        let body = json_body(response).await;
        let query_id: Uuid = serde_json::from_value(body["data"]["query_id"].clone()).unwrap();

        for _ in 0..50 {
            if audit.get(query_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/audit/{}", query_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["integrity_verified"], true);

        let missing = app
            .oneshot(
                Request::get(format!("/api/audit/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
