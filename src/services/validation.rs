//! Input and state validation for file and descriptor requests.
//!
//! Each `validate_*` function either returns the record the operation should
//! act on or fails with a typed error. Field violations are collected so the
//! caller sees all of them at once.

use crate::{
    catalog::{artifacts, descriptors},
    models::{
        Artifact, ArtifactRequest, ArtifactStatus, Descriptor,
        descriptor::{DESCRIPTOR_ID, VDU, VM_IMAGE},
    },
    services::{
        error::{StoreError, StoreResult},
        file_store::FileStore,
    },
};
use serde_json::Value;
use sqlx::SqliteConnection;

const MAX_FILE_NAME_LEN: usize = 255;
const CHECKSUM_LEN: usize = 32;

/// Check a file name for the flat store.
///
/// Allows ASCII letters, digits, `.`, `_`, `-` and `+`; the name may not start
/// with a dot (reserved for temporaries) or contain `..`.
pub fn check_file_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".into());
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(format!("must be at most {} characters", MAX_FILE_NAME_LEN));
    }
    if name.starts_with('.') || name.contains("..") {
        return Err("must not start with a dot or contain `..`".into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
    {
        return Err("allowed characters are letters, digits, `.`, `_`, `-` and `+`".into());
    }
    Ok(())
}

fn check_checksum(checksum: &str) -> Result<(), String> {
    if checksum.len() != CHECKSUM_LEN || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("must be {} hexadecimal characters", CHECKSUM_LEN));
    }
    Ok(())
}

fn check_request(request: &ArtifactRequest) -> StoreResult<()> {
    let mut violations = Vec::new();
    if let Err(reason) = check_file_name(&request.name) {
        violations.push(format!("name: {}", reason));
    }
    if let Some(checksum) = &request.checksum {
        if let Err(reason) = check_checksum(checksum) {
            violations.push(format!("checksum: {}", reason));
        }
    }
    if let Some(provider_id) = request.provider_id {
        if provider_id < 0 {
            violations.push("provider_id: must not be negative".to_string());
        }
    }
    if let Some(image_type) = &request.image_type {
        if image_type.trim().is_empty() {
            violations.push("image_type: must not be blank".to_string());
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Validation(violations))
    }
}

async fn require_artifact(conn: &mut SqliteConnection, name: &str) -> StoreResult<Artifact> {
    if let Err(reason) = check_file_name(name) {
        return Err(StoreError::invalid("name", reason));
    }
    artifacts::find(conn, name)
        .await?
        .ok_or_else(|| StoreError::ArtifactNotFound(name.to_string()))
}

fn invalid_state(artifact: &Artifact, operation: &'static str) -> StoreError {
    StoreError::InvalidState {
        name: artifact.name.clone(),
        status: artifact.status.to_string(),
        operation,
    }
}

/// Record to upload into: the existing placeholder/unavailable record, or a
/// fresh one. The request metadata is applied; status is left to the caller.
pub async fn validate_upload(
    conn: &mut SqliteConnection,
    request: &ArtifactRequest,
) -> StoreResult<Artifact> {
    check_request(request)?;
    let mut artifact = match artifacts::find(conn, &request.name).await? {
        Some(existing) if existing.status == ArtifactStatus::Available => {
            return Err(StoreError::invalid("name", "file already exists"));
        }
        Some(existing) if !existing.status.accepts_upload() => {
            return Err(invalid_state(&existing, "upload"));
        }
        Some(existing) => existing,
        None => Artifact::new(&request.name, ArtifactStatus::Upload),
    };
    artifact.apply(request);
    Ok(artifact)
}

/// Stored record an update may start from.
pub async fn validate_update(
    conn: &mut SqliteConnection,
    request: &ArtifactRequest,
) -> StoreResult<Artifact> {
    check_request(request)?;
    let artifact = require_artifact(conn, &request.name).await?;
    if !artifact.status.accepts_update() {
        return Err(invalid_state(&artifact, "update"));
    }
    Ok(artifact)
}

/// Catalogued record whose file is present and accessible.
pub async fn validate_download(
    conn: &mut SqliteConnection,
    files: &FileStore,
    name: &str,
) -> StoreResult<Artifact> {
    let artifact = require_artifact(conn, name).await?;
    files.get(name).await?;
    Ok(artifact)
}

pub async fn validate_delete(conn: &mut SqliteConnection, name: &str) -> StoreResult<Artifact> {
    require_artifact(conn, name).await
}

/// Parse and structurally check a descriptor document.
pub fn validate_document(raw: &str) -> StoreResult<Value> {
    let document: Value = serde_json::from_str(raw)
        .map_err(|err| StoreError::invalid("document", format!("malformed JSON: {}", err)))?;

    let Some(fields) = document.as_object() else {
        return Err(StoreError::invalid("document", "must be a JSON object"));
    };

    let mut violations = Vec::new();
    match fields.get(VDU) {
        None => {}
        Some(Value::Array(vdus)) => {
            for (idx, vdu) in vdus.iter().enumerate() {
                match vdu.get(VM_IMAGE).and_then(Value::as_str).map(str::trim) {
                    Some(image) if !image.is_empty() => {
                        let name = image.rsplit('/').next().unwrap_or(image);
                        if let Err(reason) = check_file_name(name) {
                            violations.push(format!("{}[{}].{}: {}", VDU, idx, VM_IMAGE, reason));
                        }
                    }
                    _ => violations.push(format!(
                        "{}[{}].{}: must be a non-empty string",
                        VDU, idx, VM_IMAGE
                    )),
                }
            }
        }
        Some(_) => violations.push(format!("{}: must be an array", VDU)),
    }

    if violations.is_empty() {
        Ok(document)
    } else {
        Err(StoreError::Validation(violations))
    }
}

/// Existing descriptor plus the replacement document.
pub async fn validate_descriptor_update(
    conn: &mut SqliteConnection,
    id: i64,
    raw: &str,
) -> StoreResult<(Descriptor, Value)> {
    let document = validate_document(raw)?;
    if let Some(doc_id) = document.get(DESCRIPTOR_ID) {
        if doc_id.as_i64() != Some(id) {
            return Err(StoreError::invalid("id", "does not match the descriptor being modified"));
        }
    }
    let descriptor = validate_descriptor_exists(conn, id).await?;
    Ok((descriptor, document))
}

/// Used for get and delete.
pub async fn validate_descriptor_exists(
    conn: &mut SqliteConnection,
    id: i64,
) -> StoreResult<Descriptor> {
    descriptors::find(conn, id)
        .await?
        .ok_or(StoreError::DescriptorNotFound(id))
}
