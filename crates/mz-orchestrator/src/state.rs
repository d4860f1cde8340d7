//! Process-scoped coordinator state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mz_core::config::ManagerConfig;
use mz_core::traits::{CredentialStore, PairingCodeEncoder, SessionTransport};

use crate::events::SessionEvent;
use crate::queue::CreationRequest;
use crate::session::{OpenGate, ReconnectPolicy, SessionContext, SessionRegistry, SessionSettings};

/// Channels consumed by the background tasks once the coordinator starts
pub(crate) struct TaskInputs {
    pub creations: mpsc::UnboundedReceiver<CreationRequest>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// State shared by the coordinator and its background tasks
pub struct CoordinatorState {
    /// Configuration
    pub config: ManagerConfig,
    /// Sessions and queued creations
    pub sessions: SessionRegistry,
    /// Collaborators handed to every new session
    pub context: SessionContext,
    /// Lifecycle events for subscribers
    pub broadcast: broadcast::Sender<SessionEvent>,
    pub(crate) creations: mpsc::UnboundedSender<CreationRequest>,
    pub(crate) inputs: Mutex<Option<TaskInputs>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) cancel: CancellationToken,
    stopped: AtomicBool,
}

impl CoordinatorState {
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn SessionTransport>,
        credentials: Arc<dyn CredentialStore>,
        encoder: Arc<dyn PairingCodeEncoder>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (creations_tx, creations_rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(config.event_capacity);

        let context = SessionContext {
            transport,
            credentials,
            encoder,
            gate: Arc::new(OpenGate::new(
                config.max_concurrent_sessions,
                config.creation_spacing,
            )),
            policy: Arc::new(ReconnectPolicy::from_config(&config.backoff)),
            settings: SessionSettings::from_config(&config),
            events: events_tx,
        };

        Self {
            config,
            sessions: SessionRegistry::new(),
            context,
            broadcast,
            creations: creations_tx,
            inputs: Mutex::new(Some(TaskInputs {
                creations: creations_rx,
                events: events_rx,
            })),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether `stop()` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Mark stopped; returns true for the first caller only
    pub(crate) fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }
}
