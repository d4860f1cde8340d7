//! Handle to a running tenant session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mz_core::error::SessionError;
use mz_core::time::current_time_millis;
use mz_core::types::{MediaMessage, MessageId, OutboundPayload, SessionStatus, TenantId};

use super::machine::{Command, SessionActor, SessionContext};
use super::snapshot::{PairingCodeView, SessionSnapshot};

/// Capacity of the command queue of one session
const COMMAND_CAPACITY: usize = 32;

/// Cloneable-by-`Arc` handle to one tenant's session actor.
///
/// Status reads go through the published snapshot and never wait on the
/// actor. Everything else is a request answered by the actor.
pub struct TenantSession {
    tenant_id: TenantId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    logout_on_exit: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    pairing_code_ttl: Duration,
}

impl TenantSession {
    /// Spawn the actor for `tenant_id` in the `idle` state
    pub fn spawn(tenant_id: TenantId, ctx: SessionContext) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(
            tenant_id.clone(),
            current_time_millis(),
        ));
        let cancel = CancellationToken::new();
        let logout_on_exit = Arc::new(AtomicBool::new(false));
        let shutdown_timeout = ctx.settings.shutdown_timeout;
        let pairing_code_ttl = ctx.settings.pairing_code_ttl;

        let actor = SessionActor::new(
            tenant_id.clone(),
            ctx,
            commands_rx,
            snapshot_tx,
            cancel.clone(),
            Arc::clone(&logout_on_exit),
        );
        let task = tokio::spawn(actor.run());

        Self {
            tenant_id,
            commands: commands_tx,
            snapshot: snapshot_rx,
            cancel,
            logout_on_exit,
            task: Mutex::new(Some(task)),
            shutdown_timeout,
            pairing_code_ttl,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    /// Receiver notified on every published snapshot
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Pairing code as presented to a caller
    pub fn pairing_code(&self) -> PairingCodeView {
        self.snapshot.borrow().pairing_view(self.pairing_code_ttl)
    }

    /// Open the transport.
    ///
    /// Resolves once the transport is open; pairing completes later and is
    /// observed through the snapshot and lifecycle events.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.status() == SessionStatus::Connecting {
            return Err(SessionError::AlreadyConnecting(self.tenant_id.clone()));
        }
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Send a text message
    pub async fn send_message(&self, to: &str, text: &str) -> Result<MessageId, SessionError> {
        self.send(to, OutboundPayload::text(text)).await
    }

    /// Send a media message. The media type is validated before the
    /// transport is involved.
    pub async fn send_media_message(
        &self,
        to: &str,
        media: MediaMessage,
        caption: Option<String>,
    ) -> Result<MessageId, SessionError> {
        let kind = media.kind().map_err(SessionError::UnsupportedMediaType)?;
        self.send(to, OutboundPayload::media(kind, media, caption))
            .await
    }

    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<MessageId, SessionError> {
        if self.status() != SessionStatus::Connected {
            return Err(SessionError::NotConnected(self.tenant_id.clone()));
        }
        let to = to.to_string();
        self.request(|reply| Command::Send { to, payload, reply })
            .await?
    }

    /// Log out and release the transport handle
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Stop the actor after a graceful logout and wait for it to exit
    pub async fn shutdown(&self) {
        self.logout_on_exit.store(true, Ordering::SeqCst);
        self.stop().await;
    }

    /// Stop the actor without logging out, keeping the remote session valid
    pub async fn close(&self) {
        self.stop().await;
    }

    /// Whether the actor has been asked to stop
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn stop(&self) {
        self.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(task) = task else {
            return;
        };

        let abort = task.abort_handle();
        match tokio::time::timeout(self.shutdown_timeout, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Session task for tenant {} failed: {}", self.tenant_id, e);
            }
            Err(_) => {
                tracing::warn!(
                    "Session task for tenant {} did not exit within {:?}, aborting",
                    self.tenant_id,
                    self.shutdown_timeout
                );
                abort.abort();
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SessionError::Terminated(self.tenant_id.clone()))?;
        rx.await
            .map_err(|_| SessionError::Terminated(self.tenant_id.clone()))
    }
}

impl Drop for TenantSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
