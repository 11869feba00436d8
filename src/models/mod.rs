//! Core data models for the network-function store.
//!
//! Artifacts map to the `artifacts` table via `sqlx::FromRow`; descriptors are
//! assembled from the `descriptors` table and the `descriptor_artifacts` link
//! table. Both serialize as JSON via `serde`.

pub mod artifact;
pub mod descriptor;

pub use artifact::{Artifact, ArtifactRequest, ArtifactStatus};
pub use descriptor::Descriptor;
