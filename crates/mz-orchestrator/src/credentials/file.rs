//! File-backed credential store
//!
//! Each tenant's state lives in `<dir>/<tenant>.json`. Writes go through a
//! temporary file and a rename so that a crash never leaves a truncated
//! state behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use mz_core::error::CredentialError;
use mz_core::traits::CredentialStore;
use mz_core::types::{CredentialState, TenantId};

/// Credential store keeping one JSON file per tenant
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Create a store rooted at `dir`. The directory is created on first
    /// save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory of the store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a tenant's state file
    pub fn path_for(&self, tenant_id: &TenantId) -> Result<PathBuf, CredentialError> {
        let id = tenant_id.as_str();
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(CredentialError::InvalidTenantId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, tenant_id: &TenantId) -> Result<CredentialState, CredentialError> {
        let path = self.path_for(tenant_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialState::empty()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        state: &CredentialState,
    ) -> Result<(), CredentialError> {
        let path = self.path_for(tenant_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let content = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Saved credentials for tenant {} to {:?}", tenant_id, path);
        Ok(())
    }

    async fn purge(&self, tenant_id: &TenantId) -> Result<(), CredentialError> {
        let path = self.path_for(tenant_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Purged credentials for tenant {}", tenant_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
