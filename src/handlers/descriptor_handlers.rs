//! HTTP handlers for network-function descriptors.
//!
//! Request bodies are raw JSON documents; the engine validates them.

use crate::{
    errors::AppError,
    handlers::{AppState, caller_token},
    models::Descriptor,
    services::notifier::OrchestratorOperation,
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::info;

/// POST `/vnfds`
pub async fn create_descriptor(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    let created = state.engine.create_descriptor(&body).await?;
    info!(
        "created descriptor {} referencing {:?}",
        created.id, created.referenced_file_names
    );

    let token = caller_token(&headers);
    state
        .notifier
        .notify(OrchestratorOperation::Create, &created, token.as_deref())
        .await;
    // Pick up the orchestrator id, if the create went out.
    let created = state.engine.get_descriptor(created.id).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET `/vnfds`
pub async fn list_descriptors(
    State(state): State<AppState>,
) -> Result<Json<Vec<Descriptor>>, AppError> {
    Ok(Json(state.engine.list_descriptors().await?))
}

/// GET `/vnfds/{id}`
pub async fn get_descriptor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Descriptor>, AppError> {
    Ok(Json(state.engine.get_descriptor(id).await?))
}

/// PUT `/vnfds/{id}`
pub async fn modify_descriptor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Descriptor>, AppError> {
    let modified = state.engine.modify_descriptor(id, &body).await?;
    info!("modified descriptor {}", id);

    let token = caller_token(&headers);
    state
        .notifier
        .notify(OrchestratorOperation::Update, &modified, token.as_deref())
        .await;
    Ok(Json(modified))
}

/// DELETE `/vnfds/{id}`
pub async fn delete_descriptor(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<Descriptor>>, AppError> {
    let removed = state.engine.delete_descriptor(Some(id)).await?;
    info!("deleted descriptor {}", id);
    notify_removed(&state, &removed, &headers).await;
    Ok(Json(removed))
}

/// DELETE `/vnfds`
pub async fn delete_all_descriptors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Descriptor>>, AppError> {
    let removed = state.engine.delete_descriptor(None).await?;
    info!("deleted {} descriptors", removed.len());
    notify_removed(&state, &removed, &headers).await;
    Ok(Json(removed))
}

async fn notify_removed(state: &AppState, removed: &[Descriptor], headers: &HeaderMap) {
    let token = caller_token(headers);
    for descriptor in removed {
        state
            .notifier
            .notify(OrchestratorOperation::Delete, descriptor, token.as_deref())
            .await;
    }
}
