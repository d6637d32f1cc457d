//! REST endpoints for the outer application.
//!
//! `/api/*` requires `Authorization: Bearer <secret>` when the hub has a
//! secret configured. `/health` is always open.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::AgentHub;
use crate::error::HubError;

pub fn api_routes(hub: Arc<AgentHub>) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{name}/tasks", post(dispatch_task))
        .route("/api/agents/{name}/projects", get(list_projects))
        .route("/api/tasks/{id}/kill", post(kill_task))
        .route("/api/orphans", get(list_orphans))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&hub),
            api_auth_middleware,
        ))
        // Unauthenticated routes (added after the layer).
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// Bearer check against the hub secret. Open when no secret is configured.
async fn api_auth_middleware(
    State(hub): State<Arc<AgentHub>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(ref secret) = hub.config().secret else {
        return Ok(next.run(request).await);
    };

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let ok: bool = token
        .as_bytes()
        .ct_eq(secret.expose_secret().as_bytes())
        .into();
    if !ok {
        warn!(path = %request.uri().path(), "API request with invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

fn error_response(err: HubError) -> Response {
    let status = match err {
        HubError::AgentNotFound { .. } | HubError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
        HubError::DispatchTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        HubError::SpawnFailure { .. } | HubError::Transport { .. } => StatusCode::BAD_GATEWAY,
        HubError::AuthRejected { .. } => StatusCode::UNAUTHORIZED,
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-link"
    }))
}

// ── Agents ──────────────────────────────────────────────────────────────

async fn list_agents(State(hub): State<Arc<AgentHub>>) -> impl IntoResponse {
    Json(hub.list_connections().await)
}

#[derive(Deserialize)]
struct DispatchRequest {
    prompt: String,
    #[serde(default)]
    dir: String,
}

async fn dispatch_task(
    State(hub): State<Arc<AgentHub>>,
    Path(name): Path<String>,
    Json(body): Json<DispatchRequest>,
) -> Response {
    if body.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "prompt is empty"})),
        )
            .into_response();
    }

    match hub.dispatch(&name, &body.prompt, &body.dir).await {
        Ok(task_id) => {
            info!(agent = %name, task_id = %task_id, "Task dispatched via API");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"task_id": task_id})),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn list_projects(
    State(hub): State<Arc<AgentHub>>,
    Path(name): Path<String>,
) -> Response {
    match hub.coordinator().list_projects(&name).await {
        Ok(projects) => Json(serde_json::json!({"projects": projects})).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn kill_task(State(hub): State<Arc<AgentHub>>, Path(id): Path<String>) -> Response {
    let task_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid task ID"})),
            )
                .into_response();
        }
    };

    match hub.kill(task_id).await {
        Ok(()) => Json(serde_json::json!({"status": "killing"})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_orphans(State(hub): State<Arc<AgentHub>>) -> impl IntoResponse {
    Json(hub.registry().orphans().await)
}
