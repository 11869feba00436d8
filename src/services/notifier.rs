//! Decides when the orchestrator hears about a descriptor change, and
//! records what it answered.
//!
//! Notifications run after the local operation has committed. A failed call
//! is logged and reported as an outcome; it never undoes the local change.

use crate::{
    catalog::{artifacts, descriptors},
    models::{Artifact, Descriptor},
    services::{error::StoreResult, file_store::FileStore, orchestrator_client::OrchestratorClient},
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{fmt, sync::Arc};
use tracing::{debug, error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OrchestratorOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrchestratorOperation::Create => "CREATE",
            OrchestratorOperation::Update => "UPDATE",
            OrchestratorOperation::Delete => "DELETE",
        })
    }
}

/// What happened to one notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Skipped(&'static str),
    Failed(String),
}

#[derive(Clone)]
pub struct OrchestratorNotifier {
    /// `None` when no orchestrator is configured.
    client: Option<Arc<dyn OrchestratorClient>>,
    db: Arc<SqlitePool>,
    files: FileStore,
}

impl OrchestratorNotifier {
    pub fn new(
        client: Option<Arc<dyn OrchestratorClient>>,
        db: Arc<SqlitePool>,
        files: FileStore,
    ) -> Self {
        Self { client, db, files }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Notify the orchestrator about one descriptor.
    ///
    /// CREATE and UPDATE are sent only while every referenced file is
    /// available; DELETE only while at least one is not.
    pub async fn notify(
        &self,
        operation: OrchestratorOperation,
        descriptor: &Descriptor,
        token: Option<&str>,
    ) -> NotifyOutcome {
        let Some(client) = &self.client else {
            debug!("no orchestrator configured; {} of descriptor {} not sent", operation, descriptor.id);
            return NotifyOutcome::Skipped("no orchestrator configured");
        };

        match (operation, descriptor.external_id.as_deref()) {
            (OrchestratorOperation::Create, Some(external_id)) => {
                error!(
                    "found orchestrator id {} already set on descriptor {} for {} operation",
                    external_id, descriptor.id, operation
                );
                return NotifyOutcome::Skipped("already created");
            }
            (OrchestratorOperation::Update, None) => {
                error!(
                    "found no orchestrator id on descriptor {} for {} operation",
                    descriptor.id, operation
                );
                return NotifyOutcome::Skipped("not created");
            }
            (OrchestratorOperation::Delete, None) => {
                debug!("descriptor {} was never created on the orchestrator", descriptor.id);
                return NotifyOutcome::Skipped("not created");
            }
            _ => {}
        }

        let available = match self.all_files_available(descriptor).await {
            Ok(available) => available,
            Err(err) => {
                error!(
                    "problem checking files of descriptor {} before {}: {}",
                    descriptor.id, operation, err
                );
                return NotifyOutcome::Failed(err.to_string());
            }
        };
        let gate_open = match operation {
            OrchestratorOperation::Create | OrchestratorOperation::Update => available,
            OrchestratorOperation::Delete => !available,
        };
        if !gate_open {
            debug!(
                "{} of descriptor {} held back (files available: {})",
                operation, descriptor.id, available
            );
            return NotifyOutcome::Skipped("file availability gate closed");
        }

        let result = match operation {
            OrchestratorOperation::Create => client.create(descriptor, token).await.map(Some),
            OrchestratorOperation::Update => client.update(descriptor, token).await.map(|_| None),
            OrchestratorOperation::Delete => client.delete(descriptor, token).await.map(|_| None),
        };
        match result {
            Ok(external_id) => {
                self.record(operation, descriptor, external_id).await;
                NotifyOutcome::Sent
            }
            Err(err) => {
                error!(
                    "problem notification of descriptor {} {} to orchestrator: {}",
                    descriptor.id, operation, err
                );
                NotifyOutcome::Failed(err.to_string())
            }
        }
    }

    /// Notify every descriptor referencing any of `artifacts`, once each.
    pub async fn notify_artifacts(
        &self,
        operation: OrchestratorOperation,
        artifacts: &[Artifact],
        token: Option<&str>,
    ) -> Vec<(i64, NotifyOutcome)> {
        let mut outcomes = Vec::new();
        for descriptor in self.referencing(artifacts).await {
            let outcome = self.notify(operation, &descriptor, token).await;
            outcomes.push((descriptor.id, outcome));
        }
        outcomes
    }

    /// After an upload or update completed: CREATE descriptors the
    /// orchestrator does not know yet, UPDATE the others.
    pub async fn announce_artifact(
        &self,
        artifact: &Artifact,
        token: Option<&str>,
    ) -> Vec<(i64, NotifyOutcome)> {
        let mut outcomes = Vec::new();
        for descriptor in self.referencing(std::slice::from_ref(artifact)).await {
            let operation = match descriptor.external_id {
                Some(_) => OrchestratorOperation::Update,
                None => OrchestratorOperation::Create,
            };
            let outcome = self.notify(operation, &descriptor, token).await;
            outcomes.push((descriptor.id, outcome));
        }
        outcomes
    }

    /// Every referenced file has a deployable record and exists on disk.
    pub async fn all_files_available(&self, descriptor: &Descriptor) -> StoreResult<bool> {
        let mut conn = self.db.acquire().await?;
        for name in &descriptor.referenced_file_names {
            let Some(artifact) = artifacts::find(&mut *conn, name).await? else {
                return Ok(false);
            };
            if !artifact.status.is_deployable() || !self.files.exists(name).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Current state of the distinct descriptors referencing `artifacts`.
    async fn referencing(&self, artifacts: &[Artifact]) -> Vec<Descriptor> {
        let mut ids: Vec<i64> = artifacts
            .iter()
            .flat_map(|a| a.descriptors.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let loaded: StoreResult<Vec<Descriptor>> = async {
            let mut conn = self.db.acquire().await?;
            let mut found = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(descriptor) = descriptors::find(&mut *conn, id).await? {
                    found.push(descriptor);
                }
            }
            Ok(found)
        }
        .await;

        loaded.unwrap_or_else(|err| {
            error!("could not load descriptors to notify: {}", err);
            Vec::new()
        })
    }

    /// Store the orchestrator id after a successful call. Best-effort.
    async fn record(
        &self,
        operation: OrchestratorOperation,
        descriptor: &Descriptor,
        external_id: Option<String>,
    ) {
        let external_id = match operation {
            OrchestratorOperation::Create => external_id,
            OrchestratorOperation::Update => return,
            OrchestratorOperation::Delete => None,
        };
        let result: StoreResult<bool> = async {
            let mut conn = self.db.acquire().await?;
            descriptors::set_external_id(&mut *conn, descriptor.id, external_id.as_deref()).await
        }
        .await;
        match result {
            Ok(true) => {}
            Ok(false) => debug!("descriptor {} gone before {} result was recorded", descriptor.id, operation),
            Err(err) => warn!(
                "could not record {} result for descriptor {}: {}",
                operation, descriptor.id, err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::memory_pool,
        models::ArtifactRequest,
        services::{engine::ConsistencyEngine, orchestrator_client::OrchestratorError},
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use url::Url;

    /// Records calls; fails every call when `fail` is set.
    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<(OrchestratorOperation, i64)>>,
        fail: bool,
    }

    impl RecordingClient {
        fn calls(&self) -> Vec<(OrchestratorOperation, i64)> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(&self, op: OrchestratorOperation, id: i64) -> Result<(), OrchestratorError> {
            self.calls.lock().unwrap().push((op, id));
            if self.fail {
                return Err(OrchestratorError::Status {
                    endpoint: op.to_string(),
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OrchestratorClient for RecordingClient {
        async fn create(&self, d: &Descriptor, _: Option<&str>) -> Result<String, OrchestratorError> {
            self.answer(OrchestratorOperation::Create, d.id)?;
            Ok(format!("vnf-{}", d.id))
        }

        async fn update(&self, d: &Descriptor, _: Option<&str>) -> Result<(), OrchestratorError> {
            self.answer(OrchestratorOperation::Update, d.id)
        }

        async fn delete(&self, d: &Descriptor, _: Option<&str>) -> Result<(), OrchestratorError> {
            self.answer(OrchestratorOperation::Delete, d.id)
        }
    }

    struct Fixture {
        engine: ConsistencyEngine,
        notifier: OrchestratorNotifier,
        client: Arc<RecordingClient>,
        dir: TempDir,
    }

    async fn fixture(fail: bool) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let db = memory_pool().await;
        let files = FileStore::new(dir.path());
        let client = Arc::new(RecordingClient {
            fail,
            ..Default::default()
        });
        let engine = ConsistencyEngine::new(
            db.clone(),
            files.clone(),
            Url::parse("http://nfs.test/").unwrap(),
        );
        let notifier = OrchestratorNotifier::new(Some(client.clone()), db, files);
        Fixture {
            engine,
            notifier,
            client,
            dir,
        }
    }

    impl Fixture {
        async fn upload(&self, name: &str) -> Artifact {
            let started = self
                .engine
                .begin_upload(&ArtifactRequest::named(name))
                .await
                .unwrap();
            std::fs::write(self.dir.path().join(name), b"img").unwrap();
            self.engine.end_upload(&started).await.unwrap()
        }

        async fn descriptor(&self, images: &[&str]) -> Descriptor {
            let vdus: Vec<_> = images.iter().map(|i| json!({"vm_image": i})).collect();
            self.engine
                .create_descriptor(&json!({"vdu": vdus}).to_string())
                .await
                .unwrap()
        }

        async fn reload(&self, id: i64) -> Descriptor {
            self.engine.get_descriptor(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn create_waits_for_uploads() {
        let f = fixture(false).await;
        let d = f.descriptor(&["a.img"]).await;
        assert_eq!(
            f.notifier.notify(OrchestratorOperation::Create, &d, None).await,
            NotifyOutcome::Skipped("file availability gate closed")
        );

        f.engine.begin_upload(&ArtifactRequest::named("a.img")).await.unwrap();
        std::fs::write(f.dir.path().join("a.img"), b"partial").unwrap();
        assert!(matches!(
            f.notifier.notify(OrchestratorOperation::Create, &d, None).await,
            NotifyOutcome::Skipped(_)
        ));
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn create_skipped_when_file_missing_on_disk() {
        let f = fixture(false).await;
        f.upload("a.img").await;
        let d = f.descriptor(&["a.img"]).await;
        std::fs::remove_file(f.dir.path().join("a.img")).unwrap();

        assert!(matches!(
            f.notifier.notify(OrchestratorOperation::Create, &d, None).await,
            NotifyOutcome::Skipped(_)
        ));
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn create_sent_once_files_are_available_and_id_recorded() {
        let f = fixture(false).await;
        let d = f.descriptor(&["a.img", "b.img"]).await;
        f.upload("a.img").await;
        let b = f.upload("b.img").await;

        let outcomes = f.notifier.announce_artifact(&b, Some("token")).await;
        assert_eq!(outcomes, vec![(d.id, NotifyOutcome::Sent)]);
        assert_eq!(f.client.calls(), vec![(OrchestratorOperation::Create, d.id)]);

        let d = f.reload(d.id).await;
        assert_eq!(d.external_id, Some(format!("vnf-{}", d.id)));

        assert_eq!(
            f.notifier.notify(OrchestratorOperation::Create, &d, None).await,
            NotifyOutcome::Skipped("already created")
        );
        let outcomes = f.notifier.announce_artifact(&b, None).await;
        assert_eq!(outcomes, vec![(d.id, NotifyOutcome::Sent)]);
        assert_eq!(f.client.calls().last(), Some(&(OrchestratorOperation::Update, d.id)));
    }

    #[tokio::test]
    async fn update_and_delete_need_an_orchestrator_id() {
        let f = fixture(false).await;
        f.upload("a.img").await;
        let d = f.descriptor(&["a.img"]).await;

        assert_eq!(
            f.notifier.notify(OrchestratorOperation::Update, &d, None).await,
            NotifyOutcome::Skipped("not created")
        );
        assert_eq!(
            f.notifier.notify(OrchestratorOperation::Delete, &d, None).await,
            NotifyOutcome::Skipped("not created")
        );
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_goes_out_only_once_files_are_unavailable() {
        let f = fixture(false).await;
        f.upload("a.img").await;
        let d = f.descriptor(&["a.img"]).await;
        f.notifier.notify(OrchestratorOperation::Create, &d, None).await;
        let d = f.reload(d.id).await;

        assert_eq!(
            f.notifier.notify(OrchestratorOperation::Delete, &d, None).await,
            NotifyOutcome::Skipped("file availability gate closed")
        );

        let deleted = f.engine.delete_artifact(Some("a.img")).await.unwrap();
        let outcomes = f
            .notifier
            .notify_artifacts(OrchestratorOperation::Delete, &deleted, None)
            .await;
        assert_eq!(outcomes, vec![(d.id, NotifyOutcome::Sent)]);
        assert!(f.reload(d.id).await.external_id.is_none());
    }

    #[tokio::test]
    async fn client_failures_are_swallowed() {
        let f = fixture(true).await;
        f.upload("a.img").await;
        let d = f.descriptor(&["a.img"]).await;

        let outcome = f.notifier.notify(OrchestratorOperation::Create, &d, None).await;
        assert!(matches!(outcome, NotifyOutcome::Failed(_)));
        assert!(f.reload(d.id).await.external_id.is_none());
        assert_eq!(f.client.calls().len(), 1);
    }

    #[tokio::test]
    async fn fan_out_notifies_each_descriptor_once() {
        let f = fixture(false).await;
        f.upload("a.img").await;
        f.upload("b.img").await;
        let d = f.descriptor(&["a.img", "b.img"]).await;

        let all = f.engine.list_artifacts(None).await.unwrap();
        let outcomes = f
            .notifier
            .notify_artifacts(OrchestratorOperation::Create, &all, None)
            .await;
        assert_eq!(outcomes, vec![(d.id, NotifyOutcome::Sent)]);
    }

    #[tokio::test]
    async fn disabled_notifier_skips() {
        let f = fixture(false).await;
        let notifier = OrchestratorNotifier::new(None, f.engine.db.clone(), f.engine.files.clone());
        let d = f.descriptor(&[]).await;
        assert_eq!(
            notifier.notify(OrchestratorOperation::Create, &d, None).await,
            NotifyOutcome::Skipped("no orchestrator configured")
        );
    }
}
