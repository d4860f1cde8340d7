//! Lifecycle events relayed from sessions to subscribers

use serde::{Deserialize, Serialize};

use mz_core::types::{SessionStatus, TenantId};

/// Event emitted by a tenant session or by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session moved between two states
    StatusChanged {
        tenant_id: TenantId,
        from: SessionStatus,
        to: SessionStatus,
    },

    /// A pairing code is ready for presentation
    QrGenerated {
        tenant_id: TenantId,
        image: String,
        issued_at_ms: u64,
    },

    /// The transport reported the session open
    Connected { tenant_id: TenantId },

    /// The transport closed the session
    Disconnected {
        tenant_id: TenantId,
        reason_code: Option<u16>,
        message: String,
    },

    /// A reconnection timer was armed
    ReconnectScheduled {
        tenant_id: TenantId,
        delay_ms: u64,
        attempt: u32,
    },

    /// The session was terminated by a terminal classification or an
    /// exhausted retry budget
    CriticalError {
        tenant_id: TenantId,
        reason_code: Option<u16>,
        message: String,
    },

    /// Inbound message for downstream processing
    MessageReceived {
        tenant_id: TenantId,
        raw: serde_json::Value,
    },

    /// The coordinator dropped the session and its credentials
    Removed { tenant_id: TenantId },
}

impl SessionEvent {
    /// Tenant this event belongs to
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            SessionEvent::StatusChanged { tenant_id, .. }
            | SessionEvent::QrGenerated { tenant_id, .. }
            | SessionEvent::Connected { tenant_id }
            | SessionEvent::Disconnected { tenant_id, .. }
            | SessionEvent::ReconnectScheduled { tenant_id, .. }
            | SessionEvent::CriticalError { tenant_id, .. }
            | SessionEvent::MessageReceived { tenant_id, .. }
            | SessionEvent::Removed { tenant_id } => tenant_id,
        }
    }
}
