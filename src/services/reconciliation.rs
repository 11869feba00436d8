//! Startup pass bringing the catalog and the store directory back in line.
//!
//! Runs once before the server accepts requests.

use crate::{
    catalog::artifacts,
    models::{Artifact, ArtifactStatus},
    services::{error::StoreResult, file_store::FileStore},
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// What a reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records dropped because their file was gone.
    pub removed: Vec<String>,
    /// Records kept for their descriptors but whose file was gone.
    pub marked_unavailable: Vec<String>,
    /// Files found on disk without a record.
    pub adopted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.removed.is_empty() && self.marked_unavailable.is_empty() && self.adopted.is_empty()
    }
}

/// Align the catalog with the files on disk in a single transaction.
///
/// - an `AVAILABLE` record whose file is missing is removed, or marked
///   `NOT_AVAILABLE` when descriptors still reference it;
/// - a file without a record is adopted as a new `AVAILABLE` record.
///
/// Records in any other status are left alone. Running it twice in a row
/// changes nothing the second time.
pub async fn reconcile(db: &SqlitePool, files: &FileStore) -> StoreResult<ReconcileReport> {
    let mut on_disk: BTreeSet<String> = files.list().await?.into_iter().collect();
    let mut report = ReconcileReport::default();

    let mut tx = db.begin().await?;
    for artifact in artifacts::list_all(&mut *tx).await? {
        let present = on_disk.remove(&artifact.name);
        if present || artifact.status != ArtifactStatus::Available {
            continue;
        }
        if artifact.is_referenced() {
            warn!(
                "file {} is missing but referenced by {} descriptor(s); marking it not available",
                artifact.name,
                artifact.descriptors.len()
            );
            artifacts::set_status(&mut *tx, &artifact.name, ArtifactStatus::NotAvailable).await?;
            report.marked_unavailable.push(artifact.name);
        } else {
            warn!("file {} is missing; removing its record", artifact.name);
            artifacts::remove(&mut *tx, &artifact.name).await?;
            report.removed.push(artifact.name);
        }
    }

    for name in on_disk {
        info!("adopting orphan file {}", name);
        artifacts::save(&mut *tx, &Artifact::new(&name, ArtifactStatus::Available)).await?;
        report.adopted.push(name);
    }
    tx.commit().await?;

    info!(
        "reconciliation done: {} removed, {} marked not available, {} adopted",
        report.removed.len(),
        report.marked_unavailable.len(),
        report.adopted.len()
    );
    Ok(report)
}
