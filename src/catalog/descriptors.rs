//! Descriptor records keyed by id, and the descriptor -> artifact links.

use crate::{
    models::{Descriptor, descriptor::image_file_names},
    services::error::StoreResult,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Row shape of the `descriptors` table.
#[derive(sqlx::FromRow)]
struct DescriptorRow {
    id: i64,
    document: String,
    referenced_file_names: String,
    external_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DescriptorRow {
    fn into_record(self, files: Vec<String>) -> StoreResult<Descriptor> {
        Ok(Descriptor {
            id: self.id,
            document: serde_json::from_str(&self.document)?,
            referenced_file_names: serde_json::from_str(&self.referenced_file_names)?,
            external_id: self.external_id,
            files,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Persist a new descriptor and return it with its assigned id.
pub async fn insert(conn: &mut SqliteConnection, document: &Value) -> StoreResult<Descriptor> {
    let now = Utc::now();
    let names = image_file_names(document);
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO descriptors (document, referenced_file_names, external_id, created_at, updated_at)
         VALUES (?, ?, NULL, ?, ?)
         RETURNING id",
    )
    .bind(serde_json::to_string(document)?)
    .bind(serde_json::to_string(&names)?)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Descriptor {
        id,
        document: document.clone(),
        referenced_file_names: names,
        external_id: None,
        files: Vec::new(),
        created_at: now,
        updated_at: now,
    })
}

/// Write back document, file names and external id.
pub async fn update(conn: &mut SqliteConnection, descriptor: &Descriptor) -> StoreResult<bool> {
    let result = sqlx::query(
        "UPDATE descriptors
         SET document = ?, referenced_file_names = ?, external_id = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(serde_json::to_string(&descriptor.document)?)
    .bind(serde_json::to_string(&descriptor.referenced_file_names)?)
    .bind(&descriptor.external_id)
    .bind(Utc::now())
    .bind(descriptor.id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_external_id(
    conn: &mut SqliteConnection,
    id: i64,
    external_id: Option<&str>,
) -> StoreResult<bool> {
    let result = sqlx::query("UPDATE descriptors SET external_id = ?, updated_at = ? WHERE id = ?")
        .bind(external_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn find(conn: &mut SqliteConnection, id: i64) -> StoreResult<Option<Descriptor>> {
    let row = sqlx::query_as::<_, DescriptorRow>(
        "SELECT id, document, referenced_file_names, external_id, created_at, updated_at
         FROM descriptors WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let files = files(conn, id).await?;
            Ok(Some(row.into_record(files)?))
        }
        None => Ok(None),
    }
}

pub async fn list_all(conn: &mut SqliteConnection) -> StoreResult<Vec<Descriptor>> {
    let rows = sqlx::query_as::<_, DescriptorRow>(
        "SELECT id, document, referenced_file_names, external_id, created_at, updated_at
         FROM descriptors ORDER BY id ASC",
    )
    .fetch_all(&mut *conn)
    .await?;

    let links = sqlx::query_as::<_, (i64, String)>(
        "SELECT descriptor_id, artifact_name FROM descriptor_artifacts ORDER BY artifact_name",
    )
    .fetch_all(&mut *conn)
    .await?;
    let mut by_id: HashMap<i64, Vec<String>> = HashMap::new();
    for (id, name) in links {
        by_id.entry(id).or_default().push(name);
    }

    rows.into_iter()
        .map(|row| {
            let files = by_id.remove(&row.id).unwrap_or_default();
            row.into_record(files)
        })
        .collect()
}

/// Descriptors linked to the artifact `name`.
pub async fn referencing(conn: &mut SqliteConnection, name: &str) -> StoreResult<Vec<Descriptor>> {
    let rows = sqlx::query_as::<_, DescriptorRow>(
        "SELECT d.id, d.document, d.referenced_file_names, d.external_id, d.created_at, d.updated_at
         FROM descriptors d
         JOIN descriptor_artifacts l ON l.descriptor_id = d.id
         WHERE l.artifact_name = ?
         ORDER BY d.id ASC",
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;

    let mut descriptors = Vec::with_capacity(rows.len());
    for row in rows {
        let files = files(conn, row.id).await?;
        descriptors.push(row.into_record(files)?);
    }
    Ok(descriptors)
}

/// Artifact names linked to descriptor `id`.
pub async fn files(conn: &mut SqliteConnection, id: i64) -> StoreResult<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT artifact_name FROM descriptor_artifacts
         WHERE descriptor_id = ? ORDER BY artifact_name",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

pub async fn link(conn: &mut SqliteConnection, id: i64, name: &str) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO descriptor_artifacts (descriptor_id, artifact_name) VALUES (?, ?)",
    )
    .bind(id)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn unlink(conn: &mut SqliteConnection, id: i64, name: &str) -> StoreResult<bool> {
    let result = sqlx::query(
        "DELETE FROM descriptor_artifacts WHERE descriptor_id = ? AND artifact_name = ?",
    )
    .bind(id)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove the descriptor and its links.
pub async fn remove(conn: &mut SqliteConnection, id: i64) -> StoreResult<bool> {
    sqlx::query("DELETE FROM descriptor_artifacts WHERE descriptor_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM descriptors WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
