//! File artifacts (import uploads, result reports, job records) addressed by name.

use crate::error::AppError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

/// Stable reference to a stored file (its relative name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(pub String);

impl FileRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<FileRef, AppError>;

    async fn get(&self, file: &FileRef) -> Result<Vec<u8>, AppError>;
}

/// Files under a media root directory.
#[derive(Clone, Debug)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFileStore { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, AppError> {
        let rel = Path::new(name);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(AppError::BadRequest(format!("invalid file name: {}", name)));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<FileRef, AppError> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::Storage(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(file = %name, "file stored");
        Ok(FileRef(name.to_string()))
    }

    async fn get(&self, file: &FileRef) -> Result<Vec<u8>, AppError> {
        let path = self.path_for(file.as_str())?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound(file.0.clone())),
            Err(e) => Err(AppError::Storage(format!("{}: {}", path.display(), e))),
        }
    }
}

/// In-process file store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<FileRef, AppError> {
        self.files
            .write()
            .map_err(|_| AppError::Internal("file store lock poisoned".into()))?
            .insert(name.to_string(), bytes);
        Ok(FileRef(name.to_string()))
    }

    async fn get(&self, file: &FileRef) -> Result<Vec<u8>, AppError> {
        self.files
            .read()
            .map_err(|_| AppError::Internal("file store lock poisoned".into()))?
            .get(file.as_str())
            .cloned()
            .ok_or_else(|| AppError::NotFound(file.0.clone()))
    }
}
