//! Error taxonomy shared by the catalog, the file store and the engine.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// One or more input violations, reported together.
    #[error("{}", .0.join("\n"))]
    Validation(Vec<String>),
    #[error("file `{0}` not found")]
    ArtifactNotFound(String),
    #[error("descriptor `{0}` not found")]
    DescriptorNotFound(i64),
    #[error("`{0}` is not a file")]
    NotAFile(String),
    #[error("file `{0}` not readable/writable")]
    NoPermission(String),
    #[error("cannot {operation} file `{name}` while it is {status}")]
    InvalidState {
        name: String,
        status: String,
        operation: &'static str,
    },
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Single-field validation failure, formatted as `field: reason`.
    pub fn invalid(field: &str, reason: impl AsRef<str>) -> Self {
        StoreError::Validation(vec![format!("{}: {}", field, reason.as_ref())])
    }
}

impl From<crate::models::descriptor::LocatorError> for StoreError {
    fn from(err: crate::models::descriptor::LocatorError) -> Self {
        StoreError::Internal(format!("Error generating file URL: {}", err))
    }
}
