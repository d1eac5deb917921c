//! HTTP surface of the command server.
//!
//! One write endpoint accepts wire envelopes; read endpoints expose entities
//! and audit trails. Error kinds map onto status codes and stable `code`
//! strings that `HttpTransport` parses back into the error taxonomy, so
//! classification survives the network boundary in both directions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::audit::AuditRecord;
use crate::core::{CommandRequest, EntityKey, EntityRecord, SyncError};
use crate::dispatch::CommandDispatcher;
use crate::executor::ledger::StateLedger;
use crate::sync::transport::{DispatchResponse, ErrorBody};

#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub ledger: Arc<StateLedger>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody {
                error: message.into(),
                code: "not_found".to_string(),
            },
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            SyncError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            SyncError::Authorization(_) => (StatusCode::FORBIDDEN, "authorization"),
            SyncError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            SyncError::UnroutableCommand { .. } => (StatusCode::NOT_FOUND, "unroutable"),
            SyncError::DuplicateCommand(_) => (StatusCode::CONFLICT, "duplicate_command"),
            SyncError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
            SyncError::Io(_) | SyncError::Serde(_) | SyncError::Execution(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        Self {
            status,
            body: ErrorBody {
                error: err.to_string(),
                code: code.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Builds the server router. Permissive CORS because the natural clients
/// are browser-based field applications.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/commands", post(submit_command))
        .route("/api/entities/:collection", get(list_entities))
        .route("/api/entities/:collection/:entity_id", get(get_entity))
        .route("/api/audit/:entity_id", get(audit_trail))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn submit_command(
    State(state): State<ServerState>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let outcome = state.dispatcher.dispatch(request).await?;
    Ok(Json(DispatchResponse::from(outcome)))
}

async fn list_entities(
    State(state): State<ServerState>,
    Path(collection): Path<String>,
) -> Json<Vec<EntityRecord>> {
    Json(state.ledger.list_entities(&collection).await)
}

async fn get_entity(
    State(state): State<ServerState>,
    Path((collection, entity_id)): Path<(String, String)>,
) -> Result<Json<EntityRecord>, ApiError> {
    state
        .ledger
        .get_entity(&EntityKey::new(collection.clone(), entity_id.clone()))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("entity '{}/{}'", collection, entity_id)))
}

async fn audit_trail(
    State(state): State<ServerState>,
    Path(entity_id): Path<String>,
) -> Json<Vec<AuditRecord>> {
    Json(state.ledger.audit_by_entity(&entity_id).await)
}
