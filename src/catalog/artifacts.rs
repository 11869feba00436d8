//! Artifact records keyed by file name.

use crate::{
    models::{Artifact, ArtifactStatus},
    services::error::StoreResult,
};
use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Fetch one artifact with its referencing descriptor ids.
pub async fn find(conn: &mut SqliteConnection, name: &str) -> StoreResult<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "SELECT name, status, checksum, provider_id, image_type, updated_at
         FROM artifacts WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    match artifact {
        Some(mut artifact) => {
            artifact.descriptors = referrers(conn, name).await?;
            Ok(Some(artifact))
        }
        None => Ok(None),
    }
}

/// Ids of the descriptors that reference `name`.
pub async fn referrers(conn: &mut SqliteConnection, name: &str) -> StoreResult<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT descriptor_id FROM descriptor_artifacts
         WHERE artifact_name = ? ORDER BY descriptor_id",
    )
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

pub async fn list_all(conn: &mut SqliteConnection) -> StoreResult<Vec<Artifact>> {
    let rows = sqlx::query_as::<_, Artifact>(
        "SELECT name, status, checksum, provider_id, image_type, updated_at
         FROM artifacts ORDER BY name ASC",
    )
    .fetch_all(&mut *conn)
    .await?;
    attach_referrers(conn, rows).await
}

pub async fn list_by_provider(
    conn: &mut SqliteConnection,
    provider_id: i64,
) -> StoreResult<Vec<Artifact>> {
    let rows = sqlx::query_as::<_, Artifact>(
        "SELECT name, status, checksum, provider_id, image_type, updated_at
         FROM artifacts WHERE provider_id = ? ORDER BY name ASC",
    )
    .bind(provider_id)
    .fetch_all(&mut *conn)
    .await?;
    attach_referrers(conn, rows).await
}

async fn attach_referrers(
    conn: &mut SqliteConnection,
    mut artifacts: Vec<Artifact>,
) -> StoreResult<Vec<Artifact>> {
    let links = sqlx::query_as::<_, (String, i64)>(
        "SELECT artifact_name, descriptor_id FROM descriptor_artifacts ORDER BY descriptor_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut by_name: HashMap<String, Vec<i64>> = HashMap::new();
    for (name, descriptor_id) in links {
        by_name.entry(name).or_default().push(descriptor_id);
    }
    for artifact in &mut artifacts {
        artifact.descriptors = by_name.remove(&artifact.name).unwrap_or_default();
    }
    Ok(artifacts)
}

/// Insert or overwrite the record. Referrers live in the link table and are
/// not touched here.
pub async fn save(conn: &mut SqliteConnection, artifact: &Artifact) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO artifacts (name, status, checksum, provider_id, image_type, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            status = excluded.status,
            checksum = excluded.checksum,
            provider_id = excluded.provider_id,
            image_type = excluded.image_type,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&artifact.name)
    .bind(artifact.status)
    .bind(&artifact.checksum)
    .bind(artifact.provider_id)
    .bind(&artifact.image_type)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    name: &str,
    status: ArtifactStatus,
) -> StoreResult<bool> {
    let result = sqlx::query("UPDATE artifacts SET status = ?, updated_at = ? WHERE name = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove the record and every link pointing at it.
pub async fn remove(conn: &mut SqliteConnection, name: &str) -> StoreResult<bool> {
    sqlx::query("DELETE FROM descriptor_artifacts WHERE artifact_name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM artifacts WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
