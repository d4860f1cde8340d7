//! Per-tenant session actor
//!
//! One task owns all mutable state of a tenant session: the transport
//! handle, the pairing code, the counters and both timers. It multiplexes
//! commands from its [`TenantSession`](super::TenantSession) handle,
//! epoch-tagged transport events, the reconnection timer and the pairing
//! code expiry timer. After every change it publishes a fresh
//! [`SessionSnapshot`] on a watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mz_core::config::ManagerConfig;
use mz_core::error::SessionError;
use mz_core::time::current_time_millis;
use mz_core::traits::{
    CredentialStore, PairingCodeEncoder, SessionTransport, TaggedEvent, TransportEvent,
    TransportEvents, TransportHandle,
};
use mz_core::types::{MessageId, OutboundPayload, SessionStatus, TenantId};

use super::backoff::{ReconnectBackoff, ReconnectPolicy, RetryDecision};
use super::gate::OpenGate;
use super::snapshot::{PairingCode, SessionSnapshot};
use crate::events::SessionEvent;

/// Capacity of the per-session transport event queue
const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Session tunables taken from the manager configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_connection_attempts: u32,
    pub startup_jitter: (Duration, Duration),
    pub pairing_code_ttl: Duration,
    pub shutdown_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            max_connection_attempts: config.max_connection_attempts,
            startup_jitter: config.startup_jitter(),
            pairing_code_ttl: config.pairing_code_ttl,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Collaborators shared by every session of a coordinator
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn SessionTransport>,
    pub credentials: Arc<dyn CredentialStore>,
    pub encoder: Arc<dyn PairingCodeEncoder>,
    pub gate: Arc<OpenGate>,
    pub policy: Arc<ReconnectPolicy>,
    pub settings: SessionSettings,
    /// Lifecycle events towards the coordinator relay
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Requests sent from a handle to its actor
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Send {
        to: String,
        payload: OutboundPayload,
        reply: oneshot::Sender<Result<MessageId, SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct SessionActor {
    tenant_id: TenantId,
    ctx: SessionContext,
    backoff: ReconnectBackoff,

    status: SessionStatus,
    handle: Option<Box<dyn TransportHandle>>,
    /// Epoch of the most recent transport open
    epoch: u64,
    pairing: Option<PairingCode>,
    connection_attempts: u32,
    created_at_ms: u64,
    last_activity: Instant,
    last_activity_ms: u64,

    reconnect_at: Option<Instant>,
    pairing_expires_at: Option<Instant>,
    /// Held exactly while connecting or waiting for a pairing scan
    permit: Option<OwnedSemaphorePermit>,

    commands: mpsc::Receiver<Command>,
    transport_tx: mpsc::Sender<TaggedEvent>,
    transport_rx: mpsc::Receiver<TaggedEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    logout_on_exit: Arc<AtomicBool>,
}

impl SessionActor {
    pub(crate) fn new(
        tenant_id: TenantId,
        ctx: SessionContext,
        commands: mpsc::Receiver<Command>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
        cancel: CancellationToken,
        logout_on_exit: Arc<AtomicBool>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let created_at_ms = snapshot_tx.borrow().created_at_ms;
        Self {
            backoff: ReconnectBackoff::new(Arc::clone(&ctx.policy)),
            tenant_id,
            ctx,
            status: SessionStatus::Idle,
            handle: None,
            epoch: 0,
            pairing: None,
            connection_attempts: 0,
            created_at_ms,
            last_activity: Instant::now(),
            last_activity_ms: created_at_ms,
            reconnect_at: None,
            pairing_expires_at: None,
            permit: None,
            commands,
            transport_tx,
            transport_rx,
            snapshot_tx,
            cancel,
            logout_on_exit,
        }
    }

    /// Run until cancelled, until every handle is gone, or until terminated
    pub(crate) async fn run(mut self) {
        tracing::debug!("Session actor started for tenant {}", self.tenant_id);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.teardown().await;
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                Some(tagged) = self.transport_rx.recv() => {
                    self.handle_transport_event(tagged).await;
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.on_reconnect_timer().await;
                }
                _ = sleep_until_opt(self.pairing_expires_at) => {
                    self.pairing_expires_at = None;
                    self.on_pairing_expired();
                }
            }

            if self.status == SessionStatus::Terminated {
                break;
            }
        }

        tracing::debug!("Session actor for tenant {} exited", self.tenant_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Send { to, payload, reply } => {
                let result = self.send(&to, payload).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Connecting => {
                return Err(SessionError::AlreadyConnecting(self.tenant_id.clone()));
            }
            SessionStatus::Terminated => {
                return Err(SessionError::Terminated(self.tenant_id.clone()));
            }
            _ => {}
        }
        if self.handle.as_ref().is_some_and(|h| h.is_open()) {
            tracing::debug!(
                "Connect for tenant {} ignored, transport already open",
                self.tenant_id
            );
            return Ok(());
        }

        let max = self.ctx.settings.max_connection_attempts;
        if self.connection_attempts >= max {
            return Err(SessionError::AttemptsExhausted {
                attempts: self.connection_attempts,
                max,
            });
        }

        let cancel = self.cancel.clone();
        let gate = Arc::clone(&self.ctx.gate);

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(self.terminated()),
            permit = gate.acquire_establishing() => permit.map_err(|_| self.terminated())?,
        };
        self.permit = Some(permit);
        self.connection_attempts += 1;
        self.reconnect_at = None;
        self.set_status(SessionStatus::Connecting);

        tracing::info!(
            "Connecting tenant {} (attempt {}/{})",
            self.tenant_id,
            self.connection_attempts,
            max
        );

        let jitter = self.startup_jitter();
        tokio::select! {
            _ = cancel.cancelled() => return Err(self.terminated()),
            _ = async {
                tokio::time::sleep(jitter).await;
                gate.wait_turn().await;
            } => {}
        }

        let credentials = match self.ctx.credentials.load(&self.tenant_id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::warn!(
                    "Failed to load credentials for tenant {}: {}",
                    self.tenant_id,
                    e
                );
                self.set_status(SessionStatus::Disconnected);
                return Err(e.into());
            }
        };

        self.epoch += 1;
        let events = TransportEvents::new(self.epoch, self.transport_tx.clone());
        let transport = Arc::clone(&self.ctx.transport);

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(self.terminated()),
            result = transport.open(&self.tenant_id, credentials, events) => result,
        };

        match opened {
            Ok(handle) => {
                self.handle = Some(handle);
                self.publish();
                tracing::info!(
                    "Transport opened for tenant {} (epoch {})",
                    self.tenant_id,
                    self.epoch
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Transport open failed for tenant {}: {}", self.tenant_id, e);
                self.set_status(SessionStatus::Disconnected);
                Err(SessionError::TransportOpen(e))
            }
        }
    }

    async fn send(&mut self, to: &str, payload: OutboundPayload) -> Result<MessageId, SessionError> {
        let handle = match (&self.handle, self.status) {
            (Some(handle), SessionStatus::Connected) => handle,
            _ => return Err(SessionError::NotConnected(self.tenant_id.clone())),
        };

        let id = handle
            .send(to, payload)
            .await
            .map_err(SessionError::SendFailed)?;

        self.touch();
        self.publish();
        Ok(id)
    }

    /// Idempotent graceful disconnect
    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        if let Some(handle) = self.handle.take() {
            if handle.is_open() {
                if let Err(e) = handle.logout().await {
                    tracing::warn!("Logout failed for tenant {}: {}", self.tenant_id, e);
                }
            }
        }
        self.clear_pairing();
        if self.status != SessionStatus::Terminated {
            self.set_status(SessionStatus::Disconnected);
        }
    }

    async fn teardown(&mut self) {
        if self.logout_on_exit.load(Ordering::SeqCst) {
            self.disconnect().await;
        } else {
            self.reconnect_at = None;
            self.handle = None;
            self.clear_pairing();
        }
        if self.status != SessionStatus::Terminated {
            self.set_status(SessionStatus::Terminated);
        }
    }

    async fn handle_transport_event(&mut self, tagged: TaggedEvent) {
        if tagged.epoch != self.epoch {
            tracing::debug!(
                "Dropping stale transport event for tenant {} (epoch {} != {})",
                self.tenant_id,
                tagged.epoch,
                self.epoch
            );
            return;
        }

        // Credential updates are persisted even after the handle is released.
        let is_credentials = matches!(tagged.event, TransportEvent::CredentialsChanged { .. });
        if self.handle.is_none() && !is_credentials {
            tracing::debug!(
                "Dropping transport event for tenant {} without an open handle",
                self.tenant_id
            );
            return;
        }

        match tagged.event {
            TransportEvent::CredentialsChanged { state } => {
                if let Err(e) = self.ctx.credentials.save(&self.tenant_id, &state).await {
                    tracing::warn!(
                        "Failed to persist credentials for tenant {}: {}",
                        self.tenant_id,
                        e
                    );
                }
            }
            TransportEvent::PairingCodeIssued { code } => self.on_pairing_code(code),
            TransportEvent::ConnectionOpened => self.on_connection_opened(),
            TransportEvent::ConnectionClosed {
                reason_code,
                message,
            } => self.on_connection_closed(reason_code, message),
            TransportEvent::MessageReceived { raw } => {
                self.touch();
                self.publish();
                self.emit(SessionEvent::MessageReceived {
                    tenant_id: self.tenant_id.clone(),
                    raw,
                });
            }
        }
    }

    fn on_pairing_code(&mut self, code: String) {
        if self.status == SessionStatus::Connected {
            tracing::debug!(
                "Ignoring pairing code for already connected tenant {}",
                self.tenant_id
            );
            return;
        }

        let image = match self.ctx.encoder.encode(&code) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Dropping pairing code for tenant {}: {}", self.tenant_id, e);
                return;
            }
        };

        let issued_at = Instant::now();
        let issued_at_ms = current_time_millis();
        self.pairing = Some(PairingCode {
            raw: code,
            image: image.clone(),
            issued_at_ms,
            issued_at,
        });
        self.pairing_expires_at = Some(issued_at + self.ctx.settings.pairing_code_ttl);

        tracing::info!("Pairing code issued for tenant {}", self.tenant_id);
        self.set_status(SessionStatus::QrPending);
        self.emit(SessionEvent::QrGenerated {
            tenant_id: self.tenant_id.clone(),
            image,
            issued_at_ms,
        });
    }

    fn on_connection_opened(&mut self) {
        self.backoff.reset();
        self.connection_attempts = 0;
        self.reconnect_at = None;
        self.clear_pairing();

        tracing::info!("Tenant {} connected", self.tenant_id);
        self.set_status(SessionStatus::Connected);
        self.emit(SessionEvent::Connected {
            tenant_id: self.tenant_id.clone(),
        });
    }

    fn on_connection_closed(&mut self, reason_code: Option<u16>, message: String) {
        self.handle = None;
        self.clear_pairing();

        tracing::info!(
            "Tenant {} disconnected (reason {:?}): {}",
            self.tenant_id,
            reason_code,
            message
        );
        self.set_status(SessionStatus::Disconnected);
        self.emit(SessionEvent::Disconnected {
            tenant_id: self.tenant_id.clone(),
            reason_code,
            message: message.clone(),
        });

        match self.backoff.next_decision(reason_code) {
            RetryDecision::Retry { delay, attempt } => {
                self.reconnect_at = Some(Instant::now() + delay);
                tracing::info!(
                    "Reconnecting tenant {} in {:?} (retry {})",
                    self.tenant_id,
                    delay,
                    attempt
                );
                self.set_status(SessionStatus::ReconnectScheduled);
                self.emit(SessionEvent::ReconnectScheduled {
                    tenant_id: self.tenant_id.clone(),
                    delay_ms: delay.as_millis() as u64,
                    attempt,
                });
            }
            RetryDecision::Terminal => {
                tracing::error!(
                    "Tenant {} closed with terminal reason {:?}: {}",
                    self.tenant_id,
                    reason_code,
                    message
                );
                self.terminate(reason_code, format!("terminal disconnect: {}", message));
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::error!(
                    "Tenant {} exhausted its reconnection budget after {} retries",
                    self.tenant_id,
                    attempts
                );
                self.terminate(reason_code, "reconnection attempts exhausted".to_string());
            }
        }
    }

    async fn on_reconnect_timer(&mut self) {
        if matches!(
            self.status,
            SessionStatus::Connected | SessionStatus::Connecting
        ) {
            tracing::debug!(
                "Reconnect timer for tenant {} fired while {}, skipping",
                self.tenant_id,
                self.status
            );
            return;
        }

        match self.connect().await {
            Ok(()) => {}
            Err(SessionError::AttemptsExhausted { attempts, max }) => {
                tracing::error!(
                    "Tenant {} used all {} of {} connection attempts",
                    self.tenant_id,
                    attempts,
                    max
                );
                self.terminate(None, "connection attempts exhausted".to_string());
            }
            Err(SessionError::Terminated(_)) => {}
            Err(e) => self.on_connection_closed(None, e.to_string()),
        }
    }

    fn on_pairing_expired(&mut self) {
        if self.pairing.take().is_some() {
            tracing::info!("Pairing code for tenant {} expired", self.tenant_id);
            self.publish();
        }
    }

    fn terminate(&mut self, reason_code: Option<u16>, message: String) {
        self.reconnect_at = None;
        self.handle = None;
        self.clear_pairing();
        self.set_status(SessionStatus::Terminated);
        self.emit(SessionEvent::CriticalError {
            tenant_id: self.tenant_id.clone(),
            reason_code,
            message,
        });
    }

    fn set_status(&mut self, status: SessionStatus) {
        let from = self.status;
        self.status = status;

        if !status.is_establishing() && self.permit.take().is_some() {
            tracing::debug!("Tenant {} released its establishing permit", self.tenant_id);
        }

        self.touch();
        self.publish();

        if from != status {
            tracing::debug!("Tenant {} status {} -> {}", self.tenant_id, from, status);
            self.emit(SessionEvent::StatusChanged {
                tenant_id: self.tenant_id.clone(),
                from,
                to: status,
            });
        }
    }

    fn clear_pairing(&mut self) {
        self.pairing = None;
        self.pairing_expires_at = None;
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_ms = current_time_millis();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            tenant_id: self.tenant_id.clone(),
            status: self.status,
            has_pairing_code: self.pairing.is_some(),
            pairing_code_issued_at_ms: self.pairing.as_ref().map(|p| p.issued_at_ms),
            retry_count: self.backoff.retries(),
            connection_attempts: self.connection_attempts,
            has_transport: self.handle.is_some(),
            created_at_ms: self.created_at_ms,
            last_activity_ms: self.last_activity_ms,
            last_activity: self.last_activity,
            pairing_code: self.pairing.clone(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // The relay is gone once the coordinator stopped.
        let _ = self.ctx.events.send(event);
    }

    fn startup_jitter(&self) -> Duration {
        let (min, max) = self.ctx.settings.startup_jitter;
        if max <= min {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    fn terminated(&self) -> SessionError {
        SessionError::Terminated(self.tenant_id.clone())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
