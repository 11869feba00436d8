//! Every mutating operation on files and descriptors.
//!
//! Each public operation runs in one SQLite transaction covering all catalog
//! reads and writes. Filesystem effects are not part of that transaction:
//! deletions are collected and applied best-effort after the commit, so a
//! crash leaves at worst an orphan file that reconciliation adopts on the
//! next start.
//!
//! Transfers are split into `begin_*` / `end_*` pairs so the transport can
//! stream bytes in between, with `end_on_error` as the failure path.

use crate::{
    catalog::{artifacts, descriptors},
    models::{Artifact, ArtifactRequest, ArtifactStatus, Descriptor},
    services::{
        error::{StoreError, StoreResult},
        file_store::FileStore,
        validation,
    },
};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
pub struct ConsistencyEngine {
    /// Shared SQLite pool holding the catalog.
    pub db: Arc<SqlitePool>,

    /// Directory holding the artifact payloads.
    pub files: FileStore,

    /// Public base URL used to build file locators inside descriptors.
    locator_base: Url,
}

impl ConsistencyEngine {
    pub fn new(db: Arc<SqlitePool>, files: FileStore, locator_base: Url) -> Self {
        Self {
            db,
            files,
            locator_base,
        }
    }

    pub fn locator_base(&self) -> &Url {
        &self.locator_base
    }

    // --- files ---------------------------------------------------------------

    /// Validate the request and move the record (new or existing) to `UPLOAD`.
    pub async fn begin_upload(&self, request: &ArtifactRequest) -> StoreResult<Artifact> {
        debug!(
            "begin upload {}, checksum={:?}, provider={:?}, image_type={:?}",
            request.name, request.checksum, request.provider_id, request.image_type
        );
        let mut tx = self.db.begin().await?;
        let mut artifact = validation::validate_upload(&mut *tx, request).await?;
        artifact.status = ArtifactStatus::Upload;
        artifacts::save(&mut *tx, &artifact).await?;
        tx.commit().await?;
        Ok(artifact)
    }

    /// `UPLOAD` -> `AVAILABLE`; referencing descriptors receive the new metadata.
    pub async fn end_upload(&self, artifact: &Artifact) -> StoreResult<Artifact> {
        debug!("end upload {}", artifact.name);
        self.complete_transfer(artifact, ArtifactStatus::Upload, "complete upload of")
            .await
    }

    /// Move an `AVAILABLE` record to `UPDATE` and hand back a detached working
    /// copy carrying the proposed metadata. The stored record keeps its current
    /// metadata until `end_update`.
    pub async fn begin_update(&self, request: &ArtifactRequest) -> StoreResult<Artifact> {
        debug!(
            "begin update {}, checksum={:?}, provider={:?}, image_type={:?}",
            request.name, request.checksum, request.provider_id, request.image_type
        );
        let mut tx = self.db.begin().await?;
        let mut stored = validation::validate_update(&mut *tx, request).await?;
        artifacts::set_status(&mut *tx, &stored.name, ArtifactStatus::Update).await?;
        tx.commit().await?;
        stored.status = ArtifactStatus::Update;
        Ok(stored.working_copy(request))
    }

    /// `UPDATE` -> `AVAILABLE`, persisting the working copy's metadata.
    pub async fn end_update(&self, artifact: &Artifact) -> StoreResult<Artifact> {
        debug!("end update {}", artifact.name);
        self.complete_transfer(artifact, ArtifactStatus::Update, "complete update of")
            .await
    }

    async fn complete_transfer(
        &self,
        artifact: &Artifact,
        expected: ArtifactStatus,
        operation: &'static str,
    ) -> StoreResult<Artifact> {
        let mut tx = self.db.begin().await?;
        let current = artifacts::find(&mut *tx, &artifact.name)
            .await?
            .ok_or_else(|| StoreError::ArtifactNotFound(artifact.name.clone()))?;
        // A download finishing mid-transfer forces AVAILABLE; the transfer
        // still owns the file.
        if current.status != expected && current.status != ArtifactStatus::Available {
            return Err(StoreError::InvalidState {
                name: current.name,
                status: current.status.to_string(),
                operation,
            });
        }

        let mut completed = artifact.clone();
        completed.status = ArtifactStatus::Available;
        artifacts::save(&mut *tx, &completed).await?;
        rewrite_image_metadata(
            &mut *tx,
            &completed.name,
            completed.checksum.as_deref(),
            completed.image_type.as_deref(),
        )
        .await?;
        completed.descriptors = artifacts::referrers(&mut *tx, &completed.name).await?;
        tx.commit().await?;
        Ok(completed)
    }

    /// Check the file is catalogued and accessible. No status change.
    pub async fn begin_download(&self, name: &str) -> StoreResult<Artifact> {
        debug!("begin download {}", name);
        let mut conn = self.db.acquire().await?;
        validation::validate_download(&mut *conn, &self.files, name).await
    }

    /// Force the record back to `AVAILABLE` once the transfer is done.
    pub async fn end_download(&self, artifact: &Artifact) -> StoreResult<Artifact> {
        debug!("end download {}", artifact.name);
        let mut conn = self.db.acquire().await?;
        if !artifacts::set_status(&mut *conn, &artifact.name, ArtifactStatus::Available).await? {
            return Err(StoreError::ArtifactNotFound(artifact.name.clone()));
        }
        let mut done = artifact.clone();
        done.status = ArtifactStatus::Available;
        Ok(done)
    }

    /// Delete one file, or with `None` every catalogued file plus every
    /// residual file on disk.
    ///
    /// Referenced files keep their record as `NOT_AVAILABLE`; unreferenced
    /// ones are removed from the catalog. Returns the catalogued records as
    /// they stand after the deletion.
    pub async fn delete_artifact(&self, name: Option<&str>) -> StoreResult<Vec<Artifact>> {
        debug!("delete file {:?}", name);
        let mut tx = self.db.begin().await?;
        let targets = match name {
            Some(name) => vec![validation::validate_delete(&mut *tx, name).await?],
            None => artifacts::list_all(&mut *tx).await?,
        };

        let mut deleted = Vec::with_capacity(targets.len());
        for artifact in targets {
            deleted.push(delete_record(&mut *tx, artifact).await?);
        }
        tx.commit().await?;

        for artifact in &deleted {
            self.delete_file(&artifact.name).await;
        }
        if name.is_none() {
            match self.files.list().await {
                Ok(residual) => {
                    for file in residual {
                        self.delete_file(&file).await;
                    }
                }
                Err(err) => warn!("could not list store directory: {}", err),
            }
            match self.files.sweep_temporaries().await {
                Ok(0) => {}
                Ok(n) => debug!("removed {} leftover temporaries", n),
                Err(err) => warn!("could not sweep store directory: {}", err),
            }
        }
        Ok(deleted)
    }

    /// Cleanup after a failed transfer.
    ///
    /// With `remove_entity` the record is dropped, except when descriptors
    /// still reference it: then it is kept as `NOT_AVAILABLE`. Without it the
    /// record is reset to `AVAILABLE`. A missing record counts as clean.
    pub async fn end_on_error(
        &self,
        name: &str,
        remove_entity: bool,
        remove_file: bool,
    ) -> StoreResult<Option<Artifact>> {
        debug!(
            "end on error {}, remove_entity={}, remove_file={}",
            name, remove_entity, remove_file
        );
        let mut tx = self.db.begin().await?;
        let outcome = match artifacts::find(&mut *tx, name).await? {
            None => {
                debug!("no record for {}; nothing to clean up", name);
                None
            }
            // Removing a referenced record would leave descriptors linked to
            // a name without a record, so it degrades to NOT_AVAILABLE instead.
            Some(artifact) if remove_entity && artifact.is_referenced() => {
                warn!(
                    "file {} is referenced by {} descriptor(s); keeping it as not available",
                    name,
                    artifact.descriptors.len()
                );
                Some(mark_not_available(&mut *tx, artifact).await?)
            }
            Some(_) if remove_entity => {
                artifacts::remove(&mut *tx, name).await?;
                None
            }
            Some(mut artifact) => {
                artifacts::set_status(&mut *tx, name, ArtifactStatus::Available).await?;
                artifact.status = ArtifactStatus::Available;
                Some(artifact)
            }
        };
        tx.commit().await?;

        if remove_file {
            self.delete_file(name).await;
        }
        Ok(outcome)
    }

    pub async fn list_artifacts(&self, provider_id: Option<i64>) -> StoreResult<Vec<Artifact>> {
        let mut conn = self.db.acquire().await?;
        match provider_id {
            Some(provider_id) => artifacts::list_by_provider(&mut *conn, provider_id).await,
            None => artifacts::list_all(&mut *conn).await,
        }
    }

    // --- descriptors ----------------------------------------------------------

    /// Persist a new descriptor, rewrite its images to locator URLs, inject
    /// the assigned id and link the referenced files.
    pub async fn create_descriptor(&self, raw: &str) -> StoreResult<Descriptor> {
        debug!("create descriptor");
        let document = validation::validate_document(raw)?;
        let mut tx = self.db.begin().await?;
        let mut descriptor = descriptors::insert(&mut *tx, &document).await?;
        descriptor.rewrite_images_to_locators(&self.locator_base)?;
        descriptor.inject_id();
        resolve_files(&mut *tx, &mut descriptor).await?;
        descriptors::update(&mut *tx, &descriptor).await?;
        descriptor.files = descriptors::files(&mut *tx, descriptor.id).await?;
        tx.commit().await?;
        Ok(descriptor)
    }

    /// Replace a descriptor's document and link any newly referenced files.
    ///
    /// Links to files the new document no longer names are kept; only
    /// descriptor deletion releases them.
    pub async fn modify_descriptor(&self, id: i64, raw: &str) -> StoreResult<Descriptor> {
        debug!("modify descriptor {}", id);
        let mut tx = self.db.begin().await?;
        let (mut descriptor, document) =
            validation::validate_descriptor_update(&mut *tx, id, raw).await?;
        descriptor.document = document;
        descriptor.rewrite_images_to_locators(&self.locator_base)?;
        descriptor.inject_id();
        resolve_files(&mut *tx, &mut descriptor).await?;
        descriptors::update(&mut *tx, &descriptor).await?;
        descriptor.files = descriptors::files(&mut *tx, descriptor.id).await?;
        tx.commit().await?;
        Ok(descriptor)
    }

    /// Delete one descriptor, or with `None` all of them.
    ///
    /// A file referenced only by the deleted descriptor loses its record and
    /// its payload; shared files just lose the reference.
    pub async fn delete_descriptor(&self, id: Option<i64>) -> StoreResult<Vec<Descriptor>> {
        debug!("delete descriptor {:?}", id);
        let mut tx = self.db.begin().await?;
        let targets = match id {
            Some(id) => vec![validation::validate_descriptor_exists(&mut *tx, id).await?],
            None => descriptors::list_all(&mut *tx).await?,
        };

        let mut purge = Vec::new();
        for descriptor in &targets {
            purge.extend(release_descriptor(&mut *tx, descriptor).await?);
        }
        tx.commit().await?;

        for name in purge {
            self.delete_file(&name).await;
        }
        Ok(targets)
    }

    pub async fn get_descriptor(&self, id: i64) -> StoreResult<Descriptor> {
        debug!("get descriptor {}", id);
        let mut conn = self.db.acquire().await?;
        validation::validate_descriptor_exists(&mut *conn, id).await
    }

    pub async fn list_descriptors(&self) -> StoreResult<Vec<Descriptor>> {
        let mut conn = self.db.acquire().await?;
        descriptors::list_all(&mut *conn).await
    }

    async fn delete_file(&self, name: &str) {
        if !self.files.delete(name).await {
            debug!("no file removed for {}", name);
        }
    }
}

/// Catalog side of deleting one file. The payload is removed by the caller.
async fn delete_record(conn: &mut SqliteConnection, artifact: Artifact) -> StoreResult<Artifact> {
    if artifact.is_referenced() {
        mark_not_available(conn, artifact).await
    } else {
        artifacts::remove(conn, &artifact.name).await?;
        Ok(artifact)
    }
}

/// Keep the record as `NOT_AVAILABLE` and clear its metadata in every
/// referencing descriptor.
async fn mark_not_available(
    conn: &mut SqliteConnection,
    mut artifact: Artifact,
) -> StoreResult<Artifact> {
    artifacts::set_status(conn, &artifact.name, ArtifactStatus::NotAvailable).await?;
    rewrite_image_metadata(conn, &artifact.name, None, None).await?;
    artifact.status = ArtifactStatus::NotAvailable;
    Ok(artifact)
}

async fn rewrite_image_metadata(
    conn: &mut SqliteConnection,
    name: &str,
    checksum: Option<&str>,
    image_type: Option<&str>,
) -> StoreResult<()> {
    for mut descriptor in descriptors::referencing(conn, name).await? {
        descriptor.set_image_metadata(name, checksum, image_type);
        descriptors::update(conn, &descriptor).await?;
    }
    Ok(())
}

/// Link every image the document names, creating placeholders for unknown
/// names and embedding the metadata of known ones.
async fn resolve_files(conn: &mut SqliteConnection, descriptor: &mut Descriptor) -> StoreResult<()> {
    descriptor.refresh_file_names();
    for name in descriptor.referenced_file_names.clone() {
        match artifacts::find(conn, &name).await? {
            None => {
                debug!("descriptor {} references unknown file {}", descriptor.id, name);
                artifacts::save(conn, &Artifact::placeholder(&name)).await?;
            }
            Some(artifact) if artifact.status.is_deployable() => descriptor.set_image_metadata(
                &name,
                artifact.checksum.as_deref(),
                artifact.image_type.as_deref(),
            ),
            Some(_) => descriptor.set_image_metadata(&name, None, None),
        }
        descriptors::link(conn, descriptor.id, &name).await?;
    }
    Ok(())
}

/// Catalog side of deleting one descriptor; returns the files to purge.
async fn release_descriptor(
    conn: &mut SqliteConnection,
    descriptor: &Descriptor,
) -> StoreResult<Vec<String>> {
    let mut purge = Vec::new();
    for name in descriptors::files(conn, descriptor.id).await? {
        let Some(artifact) = artifacts::find(conn, &name).await? else {
            continue;
        };
        if artifact.descriptors == [descriptor.id] {
            if artifact.status != ArtifactStatus::NotAvailable {
                purge.push(name.clone());
            }
            artifacts::remove(conn, &name).await?;
        } else {
            descriptors::unlink(conn, descriptor.id, &name).await?;
        }
    }
    descriptors::remove(conn, descriptor.id).await?;
    Ok(purge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory_pool;
    use serde_json::json;
    use tempfile::TempDir;

    const SUM_A: &str = "0123456789abcdef0123456789abcdef";
    const SUM_B: &str = "fedcba9876543210fedcba9876543210";

    async fn engine() -> (ConsistencyEngine, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let engine = ConsistencyEngine::new(
            memory_pool().await,
            FileStore::new(dir.path()),
            Url::parse("http://nfs.test:8080/").unwrap(),
        );
        (engine, dir)
    }

    fn request(name: &str, checksum: &str) -> ArtifactRequest {
        ArtifactRequest {
            name: name.into(),
            checksum: Some(checksum.into()),
            provider_id: Some(1),
            image_type: Some("qcow2".into()),
        }
    }

    async fn upload(engine: &ConsistencyEngine, dir: &TempDir, name: &str) -> Artifact {
        let started = engine.begin_upload(&request(name, SUM_A)).await.unwrap();
        std::fs::write(dir.path().join(name), b"image").unwrap();
        engine.end_upload(&started).await.unwrap()
    }

    fn doc(images: &[&str]) -> String {
        let vdus: Vec<_> = images.iter().map(|i| json!({"vm_image": i})).collect();
        json!({"name": "vnf", "vdu": vdus}).to_string()
    }

    async fn stored(engine: &ConsistencyEngine, name: &str) -> Option<Artifact> {
        let mut conn = engine.db.acquire().await.unwrap();
        artifacts::find(&mut conn, name).await.unwrap()
    }

    #[tokio::test]
    async fn upload_round_trip_updates_descriptor_metadata() {
        let (engine, dir) = engine().await;
        let d = engine.create_descriptor(&doc(&["x.img"])).await.unwrap();
        assert_eq!(stored(&engine, "x.img").await.unwrap().status, ArtifactStatus::Pending);

        let started = engine.begin_upload(&request("x.img", SUM_A)).await.unwrap();
        assert_eq!(started.status, ArtifactStatus::Upload);
        assert_eq!(started.descriptors, vec![d.id]);

        std::fs::write(dir.path().join("x.img"), b"image").unwrap();
        let done = engine.end_upload(&started).await.unwrap();
        assert_eq!(done.status, ArtifactStatus::Available);

        let d = engine.get_descriptor(d.id).await.unwrap();
        assert_eq!(d.document["vdu"][0]["vm_image_md5"], SUM_A);
        assert_eq!(d.document["vdu"][0]["vm_image_format"], "qcow2");
    }

    #[tokio::test]
    async fn duplicate_upload_is_rejected() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "dup.img").await;

        let err = engine.begin_upload(&request("dup.img", SUM_B)).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn end_upload_rejects_degraded_or_missing_record() {
        let (engine, dir) = engine().await;
        let done = upload(&engine, &dir, "a.img").await;
        engine.create_descriptor(&doc(&["a.img"])).await.unwrap();
        engine.delete_artifact(Some("a.img")).await.unwrap();

        let err = engine.end_upload(&done).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));

        let gone = upload(&engine, &dir, "b.img").await;
        engine.delete_artifact(Some("b.img")).await.unwrap();
        assert!(matches!(
            engine.end_upload(&gone).await,
            Err(StoreError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_survives_a_download_finishing_mid_transfer() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "v.img").await;
        let d = engine.create_descriptor(&doc(&["v.img"])).await.unwrap();

        let copy = engine.begin_update(&request("v.img", SUM_B)).await.unwrap();
        let reading = engine.begin_download("v.img").await.unwrap();
        engine.end_download(&reading).await.unwrap();
        std::fs::write(dir.path().join("v.img"), b"new").unwrap();

        let done = engine.end_update(&copy).await.unwrap();
        assert_eq!(done.status, ArtifactStatus::Available);
        assert_eq!(stored(&engine, "v.img").await.unwrap().checksum.as_deref(), Some(SUM_B));
        let d = engine.get_descriptor(d.id).await.unwrap();
        assert_eq!(d.document["vdu"][0]["vm_image_md5"], SUM_B);
    }

    #[tokio::test]
    async fn upload_survives_a_download_finishing_mid_transfer() {
        let (engine, dir) = engine().await;
        let started = engine.begin_upload(&request("w.img", SUM_A)).await.unwrap();
        std::fs::write(dir.path().join("w.img"), b"image").unwrap();
        let reading = engine.begin_download("w.img").await.unwrap();
        engine.end_download(&reading).await.unwrap();

        let done = engine.end_upload(&started).await.unwrap();
        assert_eq!(done.checksum.as_deref(), Some(SUM_A));
        assert!(dir.path().join("w.img").exists());
    }

    #[tokio::test]
    async fn update_round_trip() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "u.img").await;
        let d = engine.create_descriptor(&doc(&["u.img"])).await.unwrap();

        let mut update = request("u.img", SUM_B);
        update.image_type = Some("raw".into());
        let copy = engine.begin_update(&update).await.unwrap();
        assert_eq!(copy.status, ArtifactStatus::Update);
        assert_eq!(copy.checksum.as_deref(), Some(SUM_B));

        let record = stored(&engine, "u.img").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::Update);
        assert_eq!(record.checksum.as_deref(), Some(SUM_A));

        let err = engine.begin_update(&update).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));

        let done = engine.end_update(&copy).await.unwrap();
        assert_eq!(done.status, ArtifactStatus::Available);
        assert_eq!(stored(&engine, "u.img").await.unwrap().checksum.as_deref(), Some(SUM_B));

        let d = engine.get_descriptor(d.id).await.unwrap();
        assert_eq!(d.document["vdu"][0]["vm_image_md5"], SUM_B);
        assert_eq!(d.document["vdu"][0]["vm_image_format"], "raw");

        assert!(engine.begin_update(&update).await.is_ok());
    }

    #[tokio::test]
    async fn download_checks_disk_and_forces_available() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "d.img").await;

        let got = engine.begin_download("d.img").await.unwrap();
        assert_eq!(got.name, "d.img");
        let finished = engine.end_download(&got).await.unwrap();
        assert_eq!(finished.status, ArtifactStatus::Available);

        std::fs::remove_file(dir.path().join("d.img")).unwrap();
        assert!(matches!(
            engine.begin_download("d.img").await,
            Err(StoreError::ArtifactNotFound(_))
        ));
        assert!(matches!(
            engine.begin_download("nope.img").await,
            Err(StoreError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_unreferenced_file_removes_record_and_payload() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "free.img").await;

        let deleted = engine.delete_artifact(Some("free.img")).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(stored(&engine, "free.img").await.is_none());
        assert!(!dir.path().join("free.img").exists());
    }

    #[tokio::test]
    async fn deleting_referenced_file_degrades_it() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "ref.img").await;
        let d = engine.create_descriptor(&doc(&["ref.img"])).await.unwrap();
        assert_eq!(d.document["vdu"][0]["vm_image_md5"], SUM_A);

        let deleted = engine.delete_artifact(Some("ref.img")).await.unwrap();
        assert_eq!(deleted[0].status, ArtifactStatus::NotAvailable);

        let record = stored(&engine, "ref.img").await.unwrap();
        assert_eq!(record.status, ArtifactStatus::NotAvailable);
        assert_eq!(record.descriptors, vec![d.id]);
        assert!(!dir.path().join("ref.img").exists());

        let d = engine.get_descriptor(d.id).await.unwrap();
        assert!(d.document["vdu"][0].get("vm_image_md5").is_none());
        assert!(d.document["vdu"][0].get("vm_image_format").is_none());
        assert_eq!(d.referenced_file_names, vec!["ref.img"]);
    }

    #[tokio::test]
    async fn delete_all_clears_catalog_and_residual_files() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "a.img").await;
        upload(&engine, &dir, "b.img").await;
        std::fs::write(dir.path().join("stray.img"), b"?").unwrap();
        std::fs::write(dir.path().join(".tmp-crashed"), b"partial").unwrap();

        let deleted = engine.delete_artifact(None).await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(engine.list_artifacts(None).await.unwrap().is_empty());
        assert!(engine.files.list().await.unwrap().is_empty());
        assert!(!dir.path().join(".tmp-crashed").exists());
    }

    #[tokio::test]
    async fn end_on_error_paths() {
        let (engine, dir) = engine().await;

        assert!(engine.end_on_error("ghost.img", true, true).await.unwrap().is_none());

        let started = engine.begin_upload(&request("fail.img", SUM_A)).await.unwrap();
        std::fs::write(dir.path().join("fail.img"), b"partial").unwrap();
        assert!(engine.end_on_error(&started.name, true, true).await.unwrap().is_none());
        assert!(stored(&engine, "fail.img").await.is_none());
        assert!(!dir.path().join("fail.img").exists());

        upload(&engine, &dir, "upd.img").await;
        engine.begin_update(&request("upd.img", SUM_B)).await.unwrap();
        let reset = engine.end_on_error("upd.img", false, false).await.unwrap().unwrap();
        assert_eq!(reset.status, ArtifactStatus::Available);
        assert_eq!(reset.checksum.as_deref(), Some(SUM_A));
        assert!(dir.path().join("upd.img").exists());
    }

    #[tokio::test]
    async fn end_on_error_keeps_referenced_record() {
        let (engine, _dir) = engine().await;
        engine.create_descriptor(&doc(&["wanted.img"])).await.unwrap();
        engine.begin_upload(&request("wanted.img", SUM_A)).await.unwrap();

        let kept = engine.end_on_error("wanted.img", true, true).await.unwrap().unwrap();
        assert_eq!(kept.status, ArtifactStatus::NotAvailable);
        assert_eq!(
            stored(&engine, "wanted.img").await.unwrap().status,
            ArtifactStatus::NotAvailable
        );
    }

    #[tokio::test]
    async fn create_descriptor_links_and_rewrites() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "known.img").await;

        let d = engine
            .create_descriptor(&doc(&["known.img", "http://elsewhere/img/new.img"]))
            .await
            .unwrap();

        assert_eq!(d.document["id"], d.id);
        assert_eq!(d.document["vdu"][0]["vm_image"], "http://nfs.test:8080/files/known.img");
        assert_eq!(d.document["vdu"][1]["vm_image"], "http://nfs.test:8080/files/new.img");
        assert_eq!(d.document["vdu"][0]["vm_image_md5"], SUM_A);
        assert!(d.document["vdu"][1].get("vm_image_md5").is_none());
        assert_eq!(d.referenced_file_names, vec!["known.img", "new.img"]);
        assert_eq!(d.files, vec!["known.img", "new.img"]);

        let placeholder = stored(&engine, "new.img").await.unwrap();
        assert_eq!(placeholder.status, ArtifactStatus::Pending);
        assert_eq!(placeholder.descriptors, vec![d.id]);
    }

    #[tokio::test]
    async fn create_descriptor_rejects_malformed_documents() {
        let (engine, _dir) = engine().await;
        assert!(matches!(
            engine.create_descriptor("{not json").await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            engine.create_descriptor(r#"{"vdu": "x"}"#).await,
            Err(StoreError::Validation(_))
        ));
        assert!(engine.list_descriptors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn modify_descriptor_keeps_stale_links() {
        let (engine, _dir) = engine().await;
        let d = engine.create_descriptor(&doc(&["old.img"])).await.unwrap();

        let modified = engine.modify_descriptor(d.id, &doc(&["new.img"])).await.unwrap();
        assert_eq!(modified.referenced_file_names, vec!["new.img"]);
        assert_eq!(modified.files, vec!["new.img", "old.img"]);
        assert_eq!(modified.document["id"], d.id);

        assert!(matches!(
            engine.modify_descriptor(d.id + 100, &doc(&[])).await,
            Err(StoreError::DescriptorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn shared_file_survives_until_last_descriptor_is_deleted() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "shared.img").await;
        let d1 = engine.create_descriptor(&doc(&["shared.img"])).await.unwrap();
        let d2 = engine.create_descriptor(&doc(&["shared.img"])).await.unwrap();

        engine.delete_descriptor(Some(d1.id)).await.unwrap();
        let record = stored(&engine, "shared.img").await.unwrap();
        assert_eq!(record.descriptors, vec![d2.id]);
        assert!(dir.path().join("shared.img").exists());

        engine.delete_descriptor(Some(d2.id)).await.unwrap();
        assert!(stored(&engine, "shared.img").await.is_none());
        assert!(!dir.path().join("shared.img").exists());
        assert!(matches!(
            engine.get_descriptor(d2.id).await,
            Err(StoreError::DescriptorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_all_descriptors_releases_every_file() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "a.img").await;
        upload(&engine, &dir, "b.img").await;
        engine.create_descriptor(&doc(&["a.img", "b.img"])).await.unwrap();
        engine.create_descriptor(&doc(&["b.img", "p.img"])).await.unwrap();

        let removed = engine.delete_descriptor(None).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(engine.list_descriptors().await.unwrap().is_empty());
        assert!(engine.list_artifacts(None).await.unwrap().is_empty());
        assert!(engine.files.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_artifacts_by_provider() {
        let (engine, dir) = engine().await;
        upload(&engine, &dir, "one.img").await;
        let mut other = request("two.img", SUM_B);
        other.provider_id = Some(9);
        let started = engine.begin_upload(&other).await.unwrap();
        std::fs::write(dir.path().join("two.img"), b"2").unwrap();
        engine.end_upload(&started).await.unwrap();

        let nine = engine.list_artifacts(Some(9)).await.unwrap();
        assert_eq!(nine.len(), 1);
        assert_eq!(nine[0].name, "two.img");
        assert_eq!(engine.list_artifacts(None).await.unwrap().len(), 2);
    }
}
