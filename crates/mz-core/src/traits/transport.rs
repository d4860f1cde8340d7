//! Session transport traits
//!
//! The transport implements pairing, encryption and wire framing. The
//! session manager only opens it, listens to its events and calls its send
//! and logout primitives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::{CredentialState, MessageId, OutboundPayload, TenantId};

/// Events emitted by an open transport session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A pairing code must be presented to the user's device
    PairingCodeIssued { code: String },
    /// The session is authenticated and usable
    ConnectionOpened,
    /// The session closed, with the transport's opaque reason code
    ConnectionClosed {
        reason_code: Option<u16>,
        message: String,
    },
    /// Credential material changed and must be persisted
    CredentialsChanged { state: CredentialState },
    /// An inbound message in transport-native form
    MessageReceived { raw: serde_json::Value },
}

/// A transport event tagged with the epoch of the handle that produced it
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Sink through which a transport delivers events for one open handle.
///
/// Each open gets a fresh epoch so that late events from a replaced handle
/// can be told apart from events of the current one.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    epoch: u64,
    tx: mpsc::Sender<TaggedEvent>,
}

impl TransportEvents {
    /// Create a sink for the given epoch
    pub fn new(epoch: u64, tx: mpsc::Sender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    /// Epoch of the handle this sink belongs to
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event, waiting for queue capacity.
    ///
    /// Fails with `TransportError::Closed` once the session is gone.
    pub async fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver an event without waiting
    pub fn try_emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.tx
            .try_send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the receiving session has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open transport session, exclusively owned by one tenant session
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a payload and return the transport-assigned message id
    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<MessageId, TransportError>;

    /// Gracefully log out, invalidating the session on the remote side
    async fn logout(&self) -> Result<(), TransportError>;

    /// Whether the underlying connection is still usable
    fn is_open(&self) -> bool;
}

/// Capability that opens transport sessions
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Open a session from persisted credential state.
    ///
    /// Events for the returned handle must be delivered through `events`, in
    /// the order they occur.
    async fn open(
        &self,
        tenant_id: &TenantId,
        credentials: CredentialState,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}
