//! Session registry
//!
//! Holds the coordinator's sessions and the set of tenants whose creation is
//! queued. A coordination lock makes "check then insert" in the creation
//! worker atomic with respect to removals, mirroring how a single writer
//! guards operations that span both collections.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

use mz_core::types::TenantId;

use super::handle::TenantSession;

/// Sessions indexed by tenant, plus queued creations
pub struct SessionRegistry {
    /// Coordination lock; the unit type protects no data of its own
    lock: RwLock<()>,
    sessions: DashMap<TenantId, Arc<TenantSession>>,
    pending: DashSet<TenantId>,
    /// Tenants whose credentials are awaiting a delayed purge, with the
    /// number of removals in flight
    purging: DashMap<TenantId, usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            sessions: DashMap::new(),
            pending: DashSet::new(),
            purging: DashMap::new(),
        }
    }

    /// Acquire the coordination lock for a mutation of the session map
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }

    /// Get a session by tenant
    pub fn get(&self, tenant_id: &TenantId) -> Option<Arc<TenantSession>> {
        self.sessions.get(tenant_id).map(|r| Arc::clone(&r))
    }

    /// List all sessions
    pub fn list(&self) -> Vec<Arc<TenantSession>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    pub fn insert(&self, session: Arc<TenantSession>) -> Option<Arc<TenantSession>> {
        self.sessions.insert(session.tenant_id().clone(), session)
    }

    pub fn remove(&self, tenant_id: &TenantId) -> Option<Arc<TenantSession>> {
        self.sessions.remove(tenant_id).map(|(_, session)| session)
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Mark a creation as queued. Returns false if it already was.
    pub fn mark_pending(&self, tenant_id: &TenantId) -> bool {
        self.pending.insert(tenant_id.clone())
    }

    pub fn clear_pending(&self, tenant_id: &TenantId) {
        self.pending.remove(tenant_id);
    }

    /// Block creations for the tenant until the returned guard is dropped
    pub fn begin_purge(&self, tenant_id: &TenantId) -> PurgeGuard<'_> {
        *self.purging.entry(tenant_id.clone()).or_insert(0) += 1;
        PurgeGuard {
            registry: self,
            tenant_id: tenant_id.clone(),
        }
    }

    /// Whether a removal for the tenant has not yet purged its credentials
    pub fn is_purging(&self, tenant_id: &TenantId) -> bool {
        self.purging.contains_key(tenant_id)
    }

    /// Remove every session, for shutdown
    pub fn drain(&self) -> Vec<Arc<TenantSession>> {
        let ids: Vec<TenantId> = self.sessions.iter().map(|r| r.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// Pending credential purge for one tenant
pub struct PurgeGuard<'a> {
    registry: &'a SessionRegistry,
    tenant_id: TenantId,
}

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .purging
            .remove_if_mut(&self.tenant_id, |_, count| {
                *count -= 1;
                *count == 0
            });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
