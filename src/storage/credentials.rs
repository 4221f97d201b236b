//! Credential persistence
//!
//! Two backends: an in-memory store for tests and short-lived clients, and a
//! JSON file store for clients that should survive a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::CredentialStore;
use crate::error::{Result, SyncError};

/// Access and refresh tokens issued by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// When these credentials were stored
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            issued_at: Utc::now(),
        }
    }

    /// Merge a renewal result; a missing refresh token keeps the old one
    pub fn renewed(&self, access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token: refresh_token.or_else(|| self.refresh_token.clone()),
            issued_at: Utc::now(),
        }
    }
}

/// In-memory credential storage
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: RwLock::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.credentials.read().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        *self.credentials.write().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.credentials.write().await = None;
        Ok(())
    }
}

/// Credentials persisted as a JSON document on disk
pub struct FileCredentialStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        let _guard = self.lock.read().await;

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::StorageError(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let credentials = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::StorageError(format!("Corrupt credential file {}: {}", self.path.display(), e))
        })?;
        Ok(Some(credentials))
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        let _guard = self.lock.write().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::StorageError(e.to_string()))?;
            }
        }

        let json = serde_json::to_vec_pretty(credentials)?;
        // Replace atomically through a sibling temp file, unique per writer
        let tmp = self.path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| SyncError::StorageError(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::StorageError(e.to_string()))?;

        debug!("Credentials saved to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.write().await;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Credentials removed from {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::StorageError(e.to_string())),
        }
    }
}
