//! Represents a stored image file (artifact) and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle status of an artifact.
///
/// `Pending` marks a placeholder created because a descriptor names a file
/// that has never been uploaded.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Pending,
    Upload,
    Update,
    Available,
    NotAvailable,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "PENDING",
            ArtifactStatus::Upload => "UPLOAD",
            ArtifactStatus::Update => "UPDATE",
            ArtifactStatus::Available => "AVAILABLE",
            ArtifactStatus::NotAvailable => "NOT_AVAILABLE",
        }
    }

    /// An upload may start only when no usable content is stored yet.
    pub fn accepts_upload(self) -> bool {
        matches!(self, ArtifactStatus::Pending | ArtifactStatus::NotAvailable)
    }

    /// An update replaces the content of an available file.
    pub fn accepts_update(self) -> bool {
        self == ArtifactStatus::Available
    }

    /// Whether the catalog considers the content usable by the orchestrator.
    ///
    /// A file being updated still has its previous content on disk.
    pub fn is_deployable(self) -> bool {
        matches!(self, ArtifactStatus::Available | ArtifactStatus::Update)
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog record for one file in the store directory.
///
/// The record holds metadata only; `name` is also the entry name on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Artifact {
    /// Unique file name, flat within the store directory.
    pub name: String,

    pub status: ArtifactStatus,

    /// MD5 of the content, once an upload or update completed.
    pub checksum: Option<String>,

    /// Identifier of the uploading provider.
    pub provider_id: Option<i64>,

    /// Image classification tag (e.g. `qcow2`).
    pub image_type: Option<String>,

    pub updated_at: DateTime<Utc>,

    /// Ids of the descriptors referencing this file, loaded from the link table.
    #[sqlx(skip)]
    #[serde(default)]
    pub descriptors: Vec<i64>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, status: ArtifactStatus) -> Self {
        Self {
            name: name.into(),
            status,
            checksum: None,
            provider_id: None,
            image_type: None,
            updated_at: Utc::now(),
            descriptors: Vec::new(),
        }
    }

    /// Placeholder for a file a descriptor references before it is uploaded.
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::new(name, ArtifactStatus::Pending)
    }

    pub fn is_referenced(&self) -> bool {
        !self.descriptors.is_empty()
    }

    /// Copy the request's metadata onto this record.
    pub fn apply(&mut self, request: &ArtifactRequest) {
        self.checksum = request.checksum.clone();
        self.provider_id = request.provider_id;
        self.image_type = request.image_type.clone();
    }

    /// Detached copy carrying the proposed metadata of an update.
    ///
    /// The stored record keeps its current values until the update completes.
    pub fn working_copy(&self, request: &ArtifactRequest) -> Artifact {
        let mut copy = self.clone();
        copy.apply(request);
        copy.name = request.name.clone();
        copy
    }
}

/// Metadata supplied with an upload or update.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ArtifactRequest {
    pub name: String,
    pub checksum: Option<String>,
    pub provider_id: Option<i64>,
    pub image_type: Option<String>,
}

#[cfg(test)]
impl ArtifactRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
