//! REST API Router
//!
//! Debug and administrative HTTP surface of the controller: in-flight
//! rollbacks, lock status, on-demand reconciliation, rollback requests and
//! the satellite result callback.

use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::coordinator::ApiCallStream;
use crate::domain::{NodeName, ResourceName, SnapshotName};
use crate::error::{Error, ErrorCategory};
use crate::security::AccessContext;

/// Header naming the calling identity; absent means the system identity
pub const IDENTITY_HEADER: &str = "x-access-identity";
/// Header naming the role of the calling identity
pub const ROLE_HEADER: &str = "x-access-role";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Result reported by a satellite for one rollback
#[derive(Debug, Clone, Deserialize)]
pub struct RollbackResultRequest {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResultResponse {
    /// Whether this report completed the rollback
    pub finished: bool,
}

/// Error response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn from_error(e: &Error) -> (StatusCode, Self) {
        let (status, error) = match e.category() {
            ErrorCategory::AccessDenied => (StatusCode::FORBIDDEN, "access_denied"),
            ErrorCategory::Conflict => (StatusCode::CONFLICT, "conflict"),
            ErrorCategory::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorCategory::Invalid => (StatusCode::BAD_REQUEST, "invalid_request"),
            ErrorCategory::Transient => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ErrorCategory::Database => (StatusCode::INTERNAL_SERVER_ERROR, "database"),
            ErrorCategory::Implementation => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let details = e.is_retryable().then(|| "retry later".to_string());
        (
            status,
            Self {
                error: error.into(),
                message: e.to_string(),
                details,
            },
        )
    }
}

fn error_response(e: Error) -> Response {
    let (status, body) = ApiErrorResponse::from_error(&e);
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    } else {
        debug!(error = %e, "Request rejected");
    }
    (status, Json(body)).into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    controller: Arc<Controller>,
}

impl RestRouter {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Build the axum router
    pub fn build(self) -> Router {
        let state = AppState {
            controller: self.controller,
        };

        Router::new()
            // Debug endpoints
            .route("/v1/debug/inflight", get(list_inflight))
            .route("/v1/debug/locks", get(lock_status))
            .route("/v1/debug/reconcile", post(reconcile))
            // Rollback endpoints
            .route("/v1/resources/:rsc/rollback/:snapshot", post(rollback_snapshot))
            .route("/v1/resources/:rsc/connected", post(resource_connected))
            .route("/v1/internal/rollback/:rsc/:node", post(rollback_result))
            // Health and metrics
            .route("/healthz", get(health_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    controller: Arc<Controller>,
}

/// Access context of the caller, from the identity headers
fn access_context(headers: &HeaderMap) -> AccessContext {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    match header(IDENTITY_HEADER) {
        Some(identity) => AccessContext::new(identity, header(ROLE_HEADER).unwrap_or("public")),
        None => AccessContext::system(),
    }
}

/// Forward the remaining results of a rollback to the log
fn drain_in_background(rsc: ResourceName, mut stream: ApiCallStream) {
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(rc) => {
                    for entry in &rc.entries {
                        info!(rsc = %rsc, kind = ?entry.kind, "{}", entry.message);
                    }
                }
                Err(e) => warn!(rsc = %rsc, error = %e, "Rollback stream failed"),
            }
        }
    });
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_inflight(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.controller.list_inflight()))
}

async fn lock_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.controller.lock_status()))
}

async fn reconcile(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = access_context(&headers);
    let controller = state.controller.clone();
    let joined = tokio::task::spawn_blocking(move || controller.reconcile_now(&ctx)).await;

    match joined {
        Ok(Ok(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(Error::Internal(format!("Reconciliation task failed: {}", e))),
    }
}

/// Start a rollback; answers with the first result, the rest goes to the log
async fn rollback_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((rsc, snapshot)): Path<(String, String)>,
) -> Response {
    let ctx = access_context(&headers);
    let (rsc, snapshot) = match (ResourceName::new(&rsc), SnapshotName::new(&snapshot)) {
        (Ok(rsc), Ok(snapshot)) => (rsc, snapshot),
        (Err(e), _) | (_, Err(e)) => return error_response(e),
    };

    let mut stream = match state.controller.rollback_snapshot(&ctx, &rsc, &snapshot).await {
        Ok(stream) => stream,
        Err(e) => return error_response(e),
    };
    match stream.next().await {
        Some(Ok(first)) => {
            drain_in_background(rsc, stream);
            (StatusCode::ACCEPTED, Json(first)).into_response()
        }
        Some(Err(e)) => error_response(e),
        None => error_response(Error::Implementation(format!(
            "Rollback of '{}' produced no result",
            rsc
        ))),
    }
}

/// Satellites of a resource reconnected; resume a marked rollback
async fn resource_connected(State(state): State<AppState>, Path(rsc): Path<String>) -> Response {
    let rsc = match ResourceName::new(&rsc) {
        Ok(rsc) => rsc,
        Err(e) => return error_response(e),
    };

    match state.controller.resource_definition_connected(&rsc).await {
        Ok(Some(mut stream)) => match stream.next().await {
            Some(Ok(first)) => {
                drain_in_background(rsc, stream);
                (StatusCode::ACCEPTED, Json(first)).into_response()
            }
            Some(Err(e)) => error_response(e),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn rollback_result(
    State(state): State<AppState>,
    Path((rsc, node)): Path<(String, String)>,
    Json(request): Json<RollbackResultRequest>,
) -> Response {
    let (rsc, node) = match (ResourceName::new(&rsc), NodeName::new(&node)) {
        (Ok(rsc), Ok(node)) => (rsc, node),
        (Err(e), _) | (_, Err(e)) => return error_response(e),
    };

    match state
        .controller
        .handle_rollback_result(&rsc, &node, request.success)
        .await
    {
        Ok(finished) => (StatusCode::OK, Json(RollbackResultResponse { finished })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.controller.metrics().encode() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(text))
            .unwrap_or_else(|e| error_response(Error::Internal(e.to_string()))),
        Err(e) => error_response(e),
    }
}
