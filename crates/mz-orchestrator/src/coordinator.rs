//! Tenant coordinator
//!
//! The `TenantCoordinator` is the single process-scoped entry point for
//! managing tenant sessions. It owns the session map, the serial creation
//! queue, the lifecycle event relay and the idle reaper.
//!
//! # Lifecycle
//!
//! `start()` spawns the background tasks. Creation requests submitted before
//! that are queued and processed once the worker runs. `stop()` cancels the
//! tasks and closes every session without purging credentials, so that a
//! restarted process can resume them.
//!
//! # Atomicity Model
//!
//! Mutations of the session map happen under the registry's coordination
//! lock: the creation worker's "validate then insert" and every removal are
//! exclusive with each other, while status reads go straight to the
//! published session snapshots.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mz_core::config::ManagerConfig;
use mz_core::error::{ConfigError, CoordinatorError, SessionError};
use mz_core::traits::{CredentialStore, DataUrlEncoder, PairingCodeEncoder, SessionTransport};
use mz_core::types::{MediaMessage, MessageId, SessionStatus, TenantId};

use crate::events::SessionEvent;
use crate::queue::{self, CreateOutcome, CreationRequest};
use crate::session::{reaper, PairingCodeView, SessionSnapshot, TenantSession};
use crate::state::CoordinatorState;

/// Aggregate session counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub total: usize,
    pub connected: usize,
    /// Every session that is not connected
    pub disconnected: usize,
    pub with_pairing_code: usize,
}

/// Process-wide manager of tenant sessions
#[derive(Clone)]
pub struct TenantCoordinator {
    state: Arc<CoordinatorState>,
}

impl TenantCoordinator {
    /// Create a coordinator presenting pairing codes as `data:` URLs
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn SessionTransport>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ConfigError> {
        Self::with_encoder(config, transport, credentials, Arc::new(DataUrlEncoder))
    }

    /// Create a coordinator with a custom pairing code encoder
    pub fn with_encoder(
        config: ManagerConfig,
        transport: Arc<dyn SessionTransport>,
        credentials: Arc<dyn CredentialStore>,
        encoder: Arc<dyn PairingCodeEncoder>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(CoordinatorState::new(
                config,
                transport,
                credentials,
                encoder,
            )),
        })
    }

    /// Shared state
    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Spawn the creation worker, the event relay and the idle reaper.
    ///
    /// Calling `start()` more than once has no effect.
    pub fn start(&self) {
        let inputs = self
            .state
            .inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(inputs) = inputs else {
            tracing::debug!("Tenant coordinator already started");
            return;
        };

        let cancel = self.state.cancel.clone();
        let handles = vec![
            tokio::spawn(queue::run_creation_worker(
                self.clone(),
                inputs.creations,
                cancel.clone(),
            )),
            tokio::spawn(run_event_relay(self.clone(), inputs.events, cancel.clone())),
            tokio::spawn(reaper::run_idle_reaper(self.clone(), cancel)),
        ];
        self.state
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        tracing::info!(
            "Tenant coordinator started (max {} sessions, {} establishing at once)",
            self.state.config.max_sessions_total,
            self.state.config.max_concurrent_sessions
        );
    }

    /// Stop background tasks and close every session.
    ///
    /// Credentials are kept. Idempotent.
    pub async fn stop(&self) {
        let sessions = {
            let _lock = self.state.sessions.write().await;
            if !self.state.mark_stopped() {
                return;
            }
            self.state.sessions.drain()
        };

        self.state.cancel.cancel();
        self.state.context.gate.close();

        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }

        let tasks: Vec<_> = self
            .state
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.state.config.shutdown_timeout, task)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        tracing::info!("Tenant coordinator stopped ({} sessions closed)", count);
    }

    /// Create a session for `tenant_id`, or report that one already exists.
    ///
    /// Resolves once the creation worker has processed the request, i.e.
    /// after the new session's transport is open.
    pub async fn create_session(
        &self,
        tenant_id: impl Into<TenantId>,
    ) -> Result<CreateOutcome, CoordinatorError> {
        let tenant_id = tenant_id.into();
        if self.state.is_stopped() {
            return Err(CoordinatorError::Stopped);
        }

        if self.state.sessions.is_purging(&tenant_id) {
            return Err(CoordinatorError::AlreadyInProgress(tenant_id));
        }

        // An existing session is replaced, so only new tenants count against
        // capacity here.
        match self.state.sessions.get(&tenant_id) {
            Some(existing) => match existing.status() {
                SessionStatus::Connected => return Ok(CreateOutcome::AlreadyConnected),
                status if status.is_establishing() => {
                    return Err(CoordinatorError::AlreadyInProgress(tenant_id));
                }
                _ => {}
            },
            None => {
                let max = self.state.config.max_sessions_total;
                if self.state.sessions.len() >= max {
                    return Err(CoordinatorError::CapacityExceeded { max });
                }
            }
        }

        if !self.state.sessions.mark_pending(&tenant_id) {
            return Err(CoordinatorError::AlreadyInProgress(tenant_id));
        }

        let (reply, rx) = oneshot::channel();
        let request = CreationRequest {
            tenant_id: tenant_id.clone(),
            reply,
        };
        if self.state.creations.send(request).is_err() {
            self.state.sessions.clear_pending(&tenant_id);
            return Err(CoordinatorError::Stopped);
        }

        tracing::debug!("Queued session creation for tenant {}", tenant_id);
        rx.await.unwrap_or(Err(CoordinatorError::Stopped))
    }

    /// Validate and perform one creation. Called by the creation worker only.
    pub(crate) async fn process_creation(
        &self,
        tenant_id: &TenantId,
    ) -> Result<CreateOutcome, CoordinatorError> {
        let (session, replaced) = {
            let _lock = self.state.sessions.write().await;
            if self.state.is_stopped() {
                return Err(CoordinatorError::Stopped);
            }
            if self.state.sessions.is_purging(tenant_id) {
                return Err(CoordinatorError::AlreadyInProgress(tenant_id.clone()));
            }

            let mut replaced = None;
            if let Some(existing) = self.state.sessions.get(tenant_id) {
                match existing.status() {
                    SessionStatus::Connected => return Ok(CreateOutcome::AlreadyConnected),
                    status if status.is_establishing() => {
                        return Err(CoordinatorError::AlreadyInProgress(tenant_id.clone()));
                    }
                    status => {
                        tracing::info!(
                            "Replacing {} session for tenant {} with a fresh one",
                            status,
                            tenant_id
                        );
                        replaced = self.state.sessions.remove(tenant_id);
                    }
                }
            }

            let max = self.state.config.max_sessions_total;
            if self.state.sessions.len() >= max {
                if let Some(previous) = replaced {
                    self.state.sessions.insert(previous);
                }
                return Err(CoordinatorError::CapacityExceeded { max });
            }

            let session = Arc::new(TenantSession::spawn(
                tenant_id.clone(),
                self.state.context.clone(),
            ));
            self.state.sessions.insert(Arc::clone(&session));
            (session, replaced)
        };

        // The discarded session must be gone before the new one opens a
        // transport for the same tenant.
        if let Some(previous) = replaced {
            previous.close().await;
        }

        match session.connect().await {
            Ok(()) => {
                tracing::info!("Created session for tenant {}", tenant_id);
                Ok(CreateOutcome::Created)
            }
            Err(e) => {
                self.discard(&session).await;
                Err(e.into())
            }
        }
    }

    /// Remove a session and purge its credentials. Idempotent.
    pub async fn remove_session(&self, tenant_id: &TenantId) -> Result<(), CoordinatorError> {
        self.remove_where(tenant_id, |_| true).await.map(|_| ())
    }

    /// Remove the tenant's session if `predicate` accepts it. Returns false
    /// when a session exists but was kept.
    ///
    /// Creations for the tenant are refused with `AlreadyInProgress` from
    /// the moment the session leaves the map until its credentials are
    /// purged.
    async fn remove_where(
        &self,
        tenant_id: &TenantId,
        predicate: impl FnOnce(&TenantSession) -> bool,
    ) -> Result<bool, CoordinatorError> {
        let (session, _purge) = {
            let _lock = self.state.sessions.write().await;
            let session = match self.state.sessions.get(tenant_id) {
                Some(current) => {
                    if !predicate(current.as_ref()) {
                        return Ok(false);
                    }
                    self.state.sessions.remove(tenant_id)
                }
                None => None,
            };
            (session, self.state.sessions.begin_purge(tenant_id))
        };

        let existed = session.is_some();
        if let Some(session) = session {
            session.shutdown().await;
            tracing::info!("Removed session for tenant {}", tenant_id);
        }

        tokio::time::sleep(self.state.config.purge_delay).await;
        self.state
            .context
            .credentials
            .purge(tenant_id)
            .await
            .map_err(SessionError::from)?;

        if existed {
            self.publish(SessionEvent::Removed {
                tenant_id: tenant_id.clone(),
            });
        }
        Ok(true)
    }

    /// Drop a session that failed its initial connect, keeping credentials
    async fn discard(&self, session: &Arc<TenantSession>) {
        {
            let _lock = self.state.sessions.write().await;
            if let Some(current) = self.state.sessions.get(session.tenant_id()) {
                if Arc::ptr_eq(&current, session) {
                    self.state.sessions.remove(session.tenant_id());
                }
            }
        }
        session.close().await;
    }

    /// Remove every session idle for longer than the idle threshold
    pub async fn reap_idle_sessions(&self) -> Vec<TenantId> {
        let threshold = self.state.config.idle_threshold;
        let idle: Vec<TenantId> = self
            .state
            .sessions
            .list()
            .into_iter()
            .filter(|s| s.snapshot().idle_for() > threshold)
            .map(|s| s.tenant_id().clone())
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for tenant_id in idle {
            tracing::info!(
                "Reaping idle session for tenant {} (idle longer than {:?})",
                tenant_id,
                threshold
            );
            // Activity may have resumed since the scan.
            let still_idle = |s: &TenantSession| s.snapshot().idle_for() > threshold;
            match self.remove_where(&tenant_id, still_idle).await {
                Ok(true) => reaped.push(tenant_id),
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to reap tenant {}: {}", tenant_id, e),
            }
        }
        reaped
    }

    /// Snapshot of one session
    pub fn get_status(&self, tenant_id: &TenantId) -> Result<SessionSnapshot, CoordinatorError> {
        Ok(self.session(tenant_id)?.snapshot())
    }

    /// Snapshots of every session, ordered by tenant id
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .state
            .sessions
            .list()
            .iter()
            .map(|s| s.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        snapshots
    }

    /// Current pairing code of a session
    pub fn pairing_code(&self, tenant_id: &TenantId) -> Result<PairingCodeView, CoordinatorError> {
        Ok(self.session(tenant_id)?.pairing_code())
    }

    /// Send a text message through a tenant's session
    pub async fn send_message(
        &self,
        tenant_id: &TenantId,
        to: &str,
        text: &str,
    ) -> Result<MessageId, CoordinatorError> {
        let session = self.session(tenant_id)?;
        Ok(session.send_message(to, text).await?)
    }

    /// Send a media message through a tenant's session
    pub async fn send_media_message(
        &self,
        tenant_id: &TenantId,
        to: &str,
        media: MediaMessage,
        caption: Option<String>,
    ) -> Result<MessageId, CoordinatorError> {
        let session = self.session(tenant_id)?;
        Ok(session.send_media_message(to, media, caption).await?)
    }

    /// Gracefully disconnect a tenant's session without removing it
    pub async fn disconnect_session(&self, tenant_id: &TenantId) -> Result<(), CoordinatorError> {
        let session = self.session(tenant_id)?;
        Ok(session.disconnect().await?)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.broadcast.subscribe()
    }

    /// Aggregate session counts
    pub fn stats(&self) -> CoordinatorStats {
        let snapshots = self.list_sessions();
        let connected = snapshots
            .iter()
            .filter(|s| s.status == SessionStatus::Connected)
            .count();
        CoordinatorStats {
            total: snapshots.len(),
            connected,
            disconnected: snapshots.len() - connected,
            with_pairing_code: snapshots.iter().filter(|s| s.has_pairing_code).count(),
        }
    }

    /// Handle of a tenant's session
    pub fn session(&self, tenant_id: &TenantId) -> Result<Arc<TenantSession>, CoordinatorError> {
        self.state
            .sessions
            .get(tenant_id)
            .ok_or_else(|| CoordinatorError::NotFound(tenant_id.clone()))
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.state.broadcast.send(event);
    }

    fn relay(&self, event: SessionEvent) {
        if let SessionEvent::CriticalError { tenant_id, .. } = &event {
            let coordinator = self.clone();
            let tenant_id = tenant_id.clone();
            tokio::spawn(async move {
                let terminated = |s: &TenantSession| s.status() == SessionStatus::Terminated;
                if let Err(e) = coordinator.remove_where(&tenant_id, terminated).await {
                    tracing::warn!(
                        "Failed to remove terminated session for tenant {}: {}",
                        tenant_id,
                        e
                    );
                }
            });
        }
        self.publish(event);
    }
}

/// Forward session events to subscribers, acting on critical errors.
async fn run_event_relay(
    coordinator: TenantCoordinator,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => coordinator.relay(event),
                None => break,
            },
        }
    }
    tracing::debug!("Session event relay stopped");
}
