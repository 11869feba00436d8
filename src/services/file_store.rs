//! Flat directory holding one entry per artifact.
//!
//! No catalog knowledge lives here: callers decide what a missing or
//! undeletable file means. Deletion is best-effort and reports a bool.

use crate::services::error::{StoreError, StoreResult};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of streaming a payload into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub size_bytes: u64,
    /// Lowercase hex MD5 of the bytes written.
    pub checksum: String,
}

#[derive(Clone, Debug)]
pub struct FileStore {
    /// Directory containing the artifact files.
    pub root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Names of the regular files in the store directory.
    ///
    /// Dot-files are skipped: they are in-flight temporaries, never artifacts.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                warn!("skipping non UTF-8 entry {:?}", entry.path());
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Remove leftover dot-file temporaries; returns how many went away.
    pub async fn sweep_temporaries(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_temporary = entry.file_name().to_string_lossy().starts_with('.');
            if !is_temporary || !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(_) => removed += 1,
                Err(err) => warn!("could not remove {}: {}", entry.path().display(), err),
            }
        }
        Ok(removed)
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::try_exists(self.path(name)).await.unwrap_or(false)
    }

    pub async fn is_readable_writable(&self, name: &str) -> bool {
        let path = self.path(name);
        let writable = match fs::metadata(&path).await {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => return false,
        };
        writable && File::open(&path).await.is_ok()
    }

    /// Resolve `name` to an accessible regular file.
    pub async fn get(&self, name: &str) -> StoreResult<PathBuf> {
        let path = self.path(name);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("file {} not found", name);
                return Err(StoreError::ArtifactNotFound(name.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        };
        if !meta.is_file() {
            warn!("{} is not a file", name);
            return Err(StoreError::NotAFile(name.to_string()));
        }
        if !self.is_readable_writable(name).await {
            warn!("file {} not readable/writable", name);
            return Err(StoreError::NoPermission(name.to_string()));
        }
        Ok(path)
    }

    /// Open an accessible file for streaming out.
    pub async fn open(&self, name: &str) -> StoreResult<File> {
        let path = self.get(name).await?;
        Ok(File::open(&path).await?)
    }

    /// Remove `name`; false on any failure, including absence.
    pub async fn delete(&self, name: &str) -> bool {
        let path = self.path(name);
        match fs::remove_file(&path).await {
            Ok(_) => {
                debug!("removed file {}", path.display());
                true
            }
            Err(err) => {
                debug!("could not remove file {}: {}", path.display(), err);
                false
            }
        }
    }

    /// Stream a payload into `name`.
    ///
    /// Bytes go to a temporary dot-file first and are renamed over `name` only
    /// once fully written, synced and matching `expected_md5` (when given), so
    /// a failed transfer never replaces the previous content.
    pub async fn write_stream<S>(
        &self,
        name: &str,
        expected_md5: Option<&str>,
        stream: S,
    ) -> StoreResult<StoredFile>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        fs::create_dir_all(&self.root).await?;
        let file_path = self.path(name);
        let tmp_path = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        let checksum = format!("{:x}", digest.compute());
        if let Some(expected) = expected_md5 {
            if !expected.eq_ignore_ascii_case(&checksum) {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::invalid(
                    "checksum",
                    format!("expected {}, received content hashes to {}", expected, checksum),
                ));
            }
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        debug!("stored {} ({} bytes)", file_path.display(), size_bytes);
        Ok(StoredFile {
            size_bytes,
            checksum,
        })
    }
}
