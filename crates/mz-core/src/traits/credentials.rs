//! Credential store trait

use async_trait::async_trait;

use crate::error::CredentialError;
use crate::types::{CredentialState, TenantId};

/// Durable per-tenant key material.
///
/// Writes are keyed by tenant, so concurrent writes for different tenants
/// never conflict.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the tenant's state, or an empty state if none was saved
    async fn load(&self, tenant_id: &TenantId) -> Result<CredentialState, CredentialError>;

    /// Overwrite the tenant's state
    async fn save(
        &self,
        tenant_id: &TenantId,
        state: &CredentialState,
    ) -> Result<(), CredentialError>;

    /// Delete everything stored for the tenant. Succeeds if nothing is stored.
    async fn purge(&self, tenant_id: &TenantId) -> Result<(), CredentialError>;
}
