pub mod descriptor_handlers;
pub mod file_handlers;
pub mod health_handlers;

use crate::services::{engine::ConsistencyEngine, notifier::OrchestratorNotifier};
use axum::http::{HeaderMap, header};

/// Caller token from the `Authorization` header, without a `Bearer ` prefix.
pub(crate) fn caller_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConsistencyEngine,
    pub notifier: OrchestratorNotifier,
}
