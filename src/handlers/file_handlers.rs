//! HTTP handlers for artifact files.
//! Bodies are streamed in both directions; catalog and disk consistency is
//! left to `ConsistencyEngine`, orchestrator traffic to `OrchestratorNotifier`.

use crate::{
    errors::AppError,
    handlers::{AppState, caller_token},
    models::{Artifact, ArtifactRequest, descriptor::locator_url},
    services::{engine::ConsistencyEngine, error::StoreError, notifier::OrchestratorOperation},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, future, stream};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

pub const CHECKSUM_HEADER: &str = "x-checksum";
pub const PROVIDER_ID_HEADER: &str = "x-provider-id";
pub const IMAGE_TYPE_HEADER: &str = "x-image-type";

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub provider_id: Option<i64>,
}

/// Catalog record plus the URL the file is served on.
#[derive(Debug, Serialize)]
pub struct FileView {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub url: String,
}

fn view(engine: &ConsistencyEngine, artifact: Artifact) -> Result<FileView, AppError> {
    let url = locator_url(engine.locator_base(), &artifact.name).map_err(StoreError::from)?;
    Ok(FileView {
        artifact,
        url: url.to_string(),
    })
}

fn views(engine: &ConsistencyEngine, artifacts: Vec<Artifact>) -> Result<Vec<FileView>, AppError> {
    artifacts.into_iter().map(|a| view(engine, a)).collect()
}

/// Build the request from the path name and the metadata headers.
fn artifact_request(name: String, headers: &HeaderMap) -> Result<ArtifactRequest, AppError> {
    let text = |key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };
    let provider_id = match text(PROVIDER_ID_HEADER) {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
            AppError::bad_request(format!("provider_id: `{}` is not a number", raw))
        })?),
        None => None,
    };
    Ok(ArtifactRequest {
        name,
        checksum: text(CHECKSUM_HEADER).map(|c| c.to_ascii_lowercase()),
        provider_id,
        image_type: text(IMAGE_TYPE_HEADER),
    })
}

fn body_stream(body: Body) -> impl Stream<Item = io::Result<Bytes>> + Send {
    body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other))
}

/// Write the payload for `artifact`, keeping the computed MD5 when the
/// caller did not announce one.
async fn receive(
    engine: &ConsistencyEngine,
    artifact: &Artifact,
    body: Body,
) -> Result<Artifact, StoreError> {
    let stored = engine
        .files
        .write_stream(&artifact.name, artifact.checksum.as_deref(), body_stream(body))
        .await?;
    let mut received = artifact.clone();
    if received.checksum.is_none() {
        received.checksum = Some(stored.checksum);
    }
    Ok(received)
}

async fn abort(engine: &ConsistencyEngine, name: &str, remove_entity: bool, remove_file: bool) {
    if let Err(err) = engine.end_on_error(name, remove_entity, remove_file).await {
        error!("cleanup after failed transfer of {} failed: {}", name, err);
    }
}

/// POST `/files/{name}`: upload a new file.
pub async fn upload_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let request = artifact_request(name, &headers)?;
    let token = caller_token(&headers);
    let started = state.engine.begin_upload(&request).await?;

    let finished = match receive(&state.engine, &started, body).await {
        Ok(received) => state.engine.end_upload(&received).await,
        Err(err) => Err(err),
    };
    let done = match finished {
        Ok(done) => done,
        Err(err) => {
            warn!("upload of {} failed: {}", started.name, err);
            abort(&state.engine, &started.name, true, true).await;
            return Err(err.into());
        }
    };
    info!("uploaded file {}", done.name);

    state
        .notifier
        .announce_artifact(&done, token.as_deref())
        .await;
    Ok((StatusCode::CREATED, Json(view(&state.engine, done)?)))
}

/// PUT `/files/{name}`: replace the content of an available file.
pub async fn update_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<FileView>, AppError> {
    let request = artifact_request(name, &headers)?;
    let token = caller_token(&headers);
    let working_copy = state.engine.begin_update(&request).await?;

    let finished = match receive(&state.engine, &working_copy, body).await {
        Ok(received) => state.engine.end_update(&received).await,
        Err(err) => Err(err),
    };
    let done = match finished {
        Ok(done) => done,
        Err(err) => {
            warn!("update of {} failed: {}", working_copy.name, err);
            abort(&state.engine, &working_copy.name, false, false).await;
            return Err(err.into());
        }
    };
    info!("updated file {}", done.name);

    state
        .notifier
        .announce_artifact(&done, token.as_deref())
        .await;
    Ok(Json(view(&state.engine, done)?))
}

/// GET `/files/{name}`: stream a file out.
///
/// The record is forced back to `AVAILABLE` once the last byte was sent.
pub async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let artifact = state.engine.begin_download(&name).await?;
    let file = state.engine.files.open(&name).await?;
    let size = file.metadata().await.ok().map(|m| m.len());

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(size) = size {
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(value) = artifact
        .checksum
        .as_deref()
        .and_then(|c| HeaderValue::from_str(c).ok())
    {
        response_headers.insert(HeaderName::from_static(CHECKSUM_HEADER), value);
    }

    let engine = state.engine.clone();
    let finish = stream::once(async move {
        if let Err(err) = engine.end_download(&artifact).await {
            warn!("could not finish download of {}: {}", artifact.name, err);
        }
        None::<io::Result<Bytes>>
    });
    let body = Body::from_stream(
        ReaderStream::new(file)
            .map(Some)
            .chain(finish)
            .filter_map(future::ready),
    );

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// DELETE `/files/{name}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<FileView>>, AppError> {
    let deleted = state.engine.delete_artifact(Some(&name)).await?;
    info!("deleted file {}", name);
    notify_deleted(&state, &deleted, &headers).await;
    Ok(Json(views(&state.engine, deleted)?))
}

/// DELETE `/files`: every catalogued file and anything else on disk.
pub async fn delete_all_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<FileView>>, AppError> {
    let deleted = state.engine.delete_artifact(None).await?;
    info!("deleted {} catalogued files", deleted.len());
    notify_deleted(&state, &deleted, &headers).await;
    Ok(Json(views(&state.engine, deleted)?))
}

async fn notify_deleted(state: &AppState, deleted: &[Artifact], headers: &HeaderMap) {
    let token = caller_token(headers);
    state
        .notifier
        .notify_artifacts(OrchestratorOperation::Delete, deleted, token.as_deref())
        .await;
}

/// GET `/files?provider_id=`
pub async fn list_files(
    State(state): State<AppState>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Json<Vec<FileView>>, AppError> {
    let artifacts = state.engine.list_artifacts(q.provider_id).await?;
    Ok(Json(views(&state.engine, artifacts)?))
}
