//! Shared test fixtures: a scripted in-memory transport and helpers

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use mz_core::config::ManagerConfig;
use mz_core::error::TransportError;
use mz_core::traits::{CredentialStore, SessionTransport, TransportEvent, TransportEvents, TransportHandle};
use mz_core::types::{CredentialState, MessageId, OutboundPayload, SessionStatus, TenantId};
use mz_orchestrator::credentials::MemoryCredentialStore;
use mz_orchestrator::{SessionEvent, SessionSnapshot, TenantCoordinator, TenantSession};

/// Upper bound for waiting on an observable change. Generous because the
/// paused clock skips straight to the next timer.
pub const WAIT: Duration = Duration::from_secs(600);

/// What the transport does right after a successful open
#[derive(Debug, Clone)]
pub enum OnOpen {
    /// Stay silent; the test drives events by hand
    Nothing,
    /// Issue a pairing code
    IssueCode(String),
    /// Report the connection open
    Connect,
    /// Close immediately with the given reason code
    Close(Option<u16>),
    /// Fail the open itself
    Fail,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HandleCounters {
    /// Handles currently alive
    pub live: usize,
    /// Highest number of handles alive at the same time
    pub max_live: usize,
    /// Successful and failed opens
    pub opens: usize,
}

#[derive(Default)]
struct MockState {
    counters: HashMap<TenantId, HandleCounters>,
    sinks: HashMap<TenantId, TransportEvents>,
    behaviors: HashMap<TenantId, OnOpen>,
    sent: Vec<(TenantId, String, OutboundPayload)>,
    logouts: usize,
    fail_sends: bool,
    next_message: u64,
}

/// Transport whose behavior is scripted per tenant and which counts open
/// handles per tenant
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    open_delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a handshake taking `delay`
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn set_behavior(&self, tenant_id: &TenantId, behavior: OnOpen) {
        self.lock().behaviors.insert(tenant_id.clone(), behavior);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn counters(&self, tenant_id: &TenantId) -> HandleCounters {
        self.lock()
            .counters
            .get(tenant_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn opens(&self, tenant_id: &TenantId) -> usize {
        self.counters(tenant_id).opens
    }

    pub fn logouts(&self) -> usize {
        self.lock().logouts
    }

    pub fn sent(&self) -> Vec<(TenantId, String, OutboundPayload)> {
        self.lock().sent.clone()
    }

    /// Event sink of the most recent open for a tenant
    pub fn sink(&self, tenant_id: &TenantId) -> TransportEvents {
        self.lock()
            .sinks
            .get(tenant_id)
            .cloned()
            .expect("tenant was never opened")
    }

    /// Emit an event through the most recent open's sink
    pub async fn emit(&self, tenant_id: &TenantId, event: TransportEvent) {
        self.sink(tenant_id)
            .emit(event)
            .await
            .expect("session event queue closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn open(
        &self,
        tenant_id: &TenantId,
        _credentials: CredentialState,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let behavior = {
            let mut state = self.lock();
            let behavior = state
                .behaviors
                .get(tenant_id)
                .cloned()
                .unwrap_or(OnOpen::Nothing);
            let counters = state.counters.entry(tenant_id.clone()).or_default();
            counters.opens += 1;
            if matches!(behavior, OnOpen::Fail) {
                return Err(TransportError::Open("scripted failure".to_string()));
            }
            counters.live += 1;
            counters.max_live = counters.max_live.max(counters.live);
            state.sinks.insert(tenant_id.clone(), events.clone());
            behavior
        };

        match behavior {
            OnOpen::IssueCode(code) => events.try_emit(TransportEvent::PairingCodeIssued { code })?,
            OnOpen::Connect => events.try_emit(TransportEvent::ConnectionOpened)?,
            OnOpen::Close(reason_code) => events.try_emit(TransportEvent::ConnectionClosed {
                reason_code,
                message: "scripted close".to_string(),
            })?,
            OnOpen::Nothing | OnOpen::Fail => {}
        }

        Ok(Box::new(MockHandle {
            tenant_id: tenant_id.clone(),
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
        }))
    }
}

struct MockHandle {
    tenant_id: TenantId,
    state: Arc<Mutex<MockState>>,
    open: AtomicBool,
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<MessageId, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(TransportError::Send("scripted send failure".to_string()));
        }
        state.next_message += 1;
        let id = MessageId::new(format!("msg-{}", state.next_message));
        state
            .sent
            .push((self.tenant_id.clone(), to.to_string(), payload));
        Ok(id)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().logouts += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(counters) = state.counters.get_mut(&self.tenant_id) {
            counters.live = counters.live.saturating_sub(1);
        }
    }
}

/// Defaults with every wait shortened so tests only spend time on the
/// behavior under test
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        max_concurrent_sessions: 4,
        startup_jitter_min_ms: 0,
        startup_jitter_max_ms: 0,
        creation_spacing: Duration::ZERO,
        purge_delay: Duration::ZERO,
        reap_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(1),
        ..ManagerConfig::default()
    }
}

pub struct Harness {
    pub coordinator: TenantCoordinator,
    pub transport: MockTransport,
    pub credentials: Arc<MemoryCredentialStore>,
    pub events: broadcast::Receiver<SessionEvent>,
}

/// Start a coordinator over a fresh mock transport and memory store
pub fn harness(config: ManagerConfig) -> Harness {
    harness_with(config, MockTransport::new())
}

pub fn harness_with(config: ManagerConfig, transport: MockTransport) -> Harness {
    let credentials = Arc::new(MemoryCredentialStore::new());
    let store: Arc<dyn CredentialStore> = credentials.clone();
    let coordinator = TenantCoordinator::new(config, Arc::new(transport.clone()), store)
    .expect("valid test config");
    let events = coordinator.subscribe();
    coordinator.start();
    Harness {
        coordinator,
        transport,
        credentials,
        events,
    }
}

/// Wait until the session publishes `status`
pub async fn wait_for_status(session: &TenantSession, status: SessionStatus) -> SessionSnapshot {
    let mut rx = session.watch();
    tokio::time::timeout(WAIT, async move {
        rx.wait_for(|s| s.status == status)
            .await
            .map(|s| s.clone())
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", status))
    .unwrap_or_else(|_| panic!("session exited before reaching {}", status))
}

/// Receive events until one matches `predicate`
pub async fn next_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Status change to `to` for `tenant_id`
pub fn status_change(tenant_id: &TenantId, to: SessionStatus) -> impl Fn(&SessionEvent) -> bool {
    let tenant_id = tenant_id.clone();
    move |event: &SessionEvent| {
        matches!(event, SessionEvent::StatusChanged { tenant_id: t, to: s, .. } if *t == tenant_id && *s == to)
    }
}
