//! In-memory credential store

use async_trait::async_trait;
use dashmap::DashMap;

use mz_core::error::CredentialError;
use mz_core::traits::CredentialStore;
use mz_core::types::{CredentialState, TenantId};

/// Credential store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    states: DashMap<TenantId, CredentialState>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any state is stored for the tenant
    pub fn contains(&self, tenant_id: &TenantId) -> bool {
        self.states.contains_key(tenant_id)
    }

    /// Number of tenants with stored state
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, tenant_id: &TenantId) -> Result<CredentialState, CredentialError> {
        Ok(self
            .states
            .get(tenant_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        state: &CredentialState,
    ) -> Result<(), CredentialError> {
        self.states.insert(tenant_id.clone(), state.clone());
        Ok(())
    }

    async fn purge(&self, tenant_id: &TenantId) -> Result<(), CredentialError> {
        self.states.remove(tenant_id);
        Ok(())
    }
}
