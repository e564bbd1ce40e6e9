//! Artifact storage collaborator.
//!
//! Keys are forward-slash paths relative to a root; the task layout is
//! `{client_id}/{task_id}/{filename}` for the uploaded flow file and
//! `{client_id}/{task_id}/results.tar` for the packaged artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::errors::RunnerError;

pub fn task_folder(client_id: &str, task_id: &str) -> String {
    format!("{}/{}", client_id, task_id)
}

pub fn task_file_path(client_id: &str, task_id: &str, filename: &str) -> String {
    format!("{}/{}/{}", client_id, task_id, filename)
}

pub fn task_archive_path(client_id: &str, task_id: &str) -> String {
    format!("{}/{}/results.tar", client_id, task_id)
}

/// Content fingerprint identifying a flow: hash of the bytes plus a short
/// filename hash, so the same file under a different name is a different
/// flow.
pub fn flow_fingerprint(content: &[u8], filename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let content_hash = format!("{:x}", hasher.finalize());
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    let name_hash = format!("{:x}", hasher.finalize());
    format!("{}-{}", &content_hash[..32], &name_hash[..8])
}

#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), RunnerError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, RunnerError>;
    async fn exists(&self, path: &str) -> Result<bool, RunnerError>;
    async fn delete(&self, path: &str) -> Result<(), RunnerError>;
    async fn delete_folder(&self, path: &str) -> Result<(), RunnerError>;
    /// Materialize a stored file at an absolute local destination.
    async fn copy_to(&self, path: &str, dest: &Path) -> Result<(), RunnerError>;
    /// Package a local directory into a tar archive stored at `dest`.
    /// Returns the archive size in bytes.
    async fn archive_dir(&self, dir: &Path, dest: &str) -> Result<u64, RunnerError>;
}

/// Filesystem-backed storage rooted at a single directory.
pub struct LocalStorage {
    root: PathBuf,
}

fn storage_err(e: std::io::Error) -> RunnerError {
    RunnerError::StorageUnavailable(e.to_string())
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(storage_err)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RunnerError> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
            return Err(RunnerError::ValidationFailed(format!(
                "Invalid storage path: {}",
                path
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ArtifactStorage for LocalStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), RunnerError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }
        tokio::fs::write(&full, bytes).await.map_err(storage_err)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, RunnerError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RunnerError::not_found("Stored file"))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, RunnerError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await.unwrap_or(false))
    }

    async fn delete(&self, path: &str) -> Result<(), RunnerError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn delete_folder(&self, path: &str) -> Result<(), RunnerError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_dir_all(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn copy_to(&self, path: &str, dest: &Path) -> Result<(), RunnerError> {
        let full = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }
        match tokio::fs::copy(&full, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RunnerError::not_found("Stored file"))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn archive_dir(&self, dir: &Path, dest: &str) -> Result<u64, RunnerError> {
        let full = self.resolve(dest)?;
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<u64, RunnerError> {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(storage_err)?;
            }
            let file = std::fs::File::create(&full).map_err(storage_err)?;
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(".", &dir).map_err(storage_err)?;
            builder.finish().map_err(storage_err)?;
            let meta = std::fs::metadata(&full).map_err(storage_err)?;
            Ok(meta.len())
        })
        .await
        .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Archive task panicked: {}", e)))?
    }
}
