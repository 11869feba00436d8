//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the catalog and the store directory

use crate::handlers::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 1. Runs `SELECT 1` against the catalog.
/// 2. Writes, reads back and removes a dot-file in the store directory.
///
/// HTTP 200 when both pass, 503 otherwise. Whether an orchestrator is
/// configured is reported but never fails readiness.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let catalog = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.engine.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    // Dot-files are never listed as artifacts, so the probe is invisible.
    let probe = state
        .engine
        .files
        .root
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let store = match fs::write(&probe, b"readyz").await {
        Ok(_) => {
            let check = match fs::read(&probe).await {
                Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
                Ok(_) => CheckStatus::failed("file content mismatch".to_string()),
                Err(e) => CheckStatus::failed(format!("could not read probe file: {}", e)),
            };
            let _ = fs::remove_file(&probe).await;
            check
        }
        Err(e) => CheckStatus::failed(format!("could not write probe file: {}", e)),
    };

    let overall_ok = catalog.ok && store.ok;
    let mut checks = BTreeMap::new();
    checks.insert("catalog", catalog);
    checks.insert("store", store);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        orchestrator: state.notifier.is_enabled(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    orchestrator: bool,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
