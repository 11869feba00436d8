//! Persistent catalog backed by SQLite.
//!
//! Two owned tables (`artifacts`, `descriptors`) plus the `descriptor_artifacts`
//! link table that indexes the artifact/descriptor relation in both directions.
//! Every function takes a `&mut SqliteConnection` so the engine can compose
//! them inside a single transaction.

pub mod artifacts;
pub mod descriptors;

use sqlx::SqlitePool;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<usize, sqlx::Error> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in &statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(statements.len())
}

/// Single-connection in-memory catalog with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> std::sync::Arc<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("schema");
    std::sync::Arc::new(pool)
}
