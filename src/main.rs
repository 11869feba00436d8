use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

mod catalog;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    engine::ConsistencyEngine,
    file_store::FileStore,
    notifier::OrchestratorNotifier,
    orchestrator_client::{HttpOrchestratorClient, OrchestratorClient},
    reconciliation,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting nf-store with config: {:?}", cfg);

    // --- Ensure store directory exists ---
    if !fs::try_exists(&cfg.store_dir).await.unwrap_or(false) {
        fs::create_dir_all(&cfg.store_dir)
            .await
            .with_context(|| format!("creating store directory {}", cfg.store_dir.display()))?;
        tracing::info!("Created store directory at {}", cfg.store_dir.display());
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Handle migration mode ---
    let applied = catalog::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(()); // exit after migration
    }

    // --- Bring catalog and disk in line before serving ---
    let files = FileStore::new(&cfg.store_dir);
    let report = reconciliation::reconcile(&db, &files)
        .await
        .context("startup reconciliation failed")?;
    if !report.is_clean() {
        tracing::warn!("Startup reconciliation changed the catalog: {:?}", report);
    }

    // --- Initialize core services ---
    let client = match &cfg.orchestrator_url {
        Some(url) => {
            let client = HttpOrchestratorClient::new(url.clone(), cfg.orchestrator_timeout)?;
            tracing::info!("Orchestrator notifications go to {}", url);
            Some(Arc::new(client) as Arc<dyn OrchestratorClient>)
        }
        None => {
            tracing::info!("No orchestrator configured; notifications disabled");
            None
        }
    };
    let state = AppState {
        engine: ConsistencyEngine::new(db.clone(), files.clone(), cfg.public_url.clone()),
        notifier: OrchestratorNotifier::new(client, db.clone(), files),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
