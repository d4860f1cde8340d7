//! Read-only views of a session's state

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use mz_core::types::{SessionStatus, TenantId};

/// Last pairing code issued by the transport
#[derive(Debug, Clone)]
pub struct PairingCode {
    /// Raw payload as issued by the transport
    pub raw: String,
    /// Presentable form produced by the pairing code encoder
    pub image: String,
    /// Wall-clock issuance time
    pub issued_at_ms: u64,
    /// Monotonic issuance time, used for expiry
    pub issued_at: Instant,
}

impl PairingCode {
    /// Whether the code is older than `ttl`
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() > ttl
    }
}

/// Point-in-time copy of a session's state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub tenant_id: TenantId,
    pub status: SessionStatus,
    pub has_pairing_code: bool,
    pub pairing_code_issued_at_ms: Option<u64>,
    pub retry_count: u32,
    pub connection_attempts: u32,
    pub has_transport: bool,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    #[serde(skip)]
    pub last_activity: Instant,
    #[serde(skip)]
    pub pairing_code: Option<PairingCode>,
}

impl SessionSnapshot {
    /// Snapshot of a session that was just created
    pub fn new(tenant_id: TenantId, now_ms: u64) -> Self {
        Self {
            tenant_id,
            status: SessionStatus::Idle,
            has_pairing_code: false,
            pairing_code_issued_at_ms: None,
            retry_count: 0,
            connection_attempts: 0,
            has_transport: false,
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
            last_activity: Instant::now(),
            pairing_code: None,
        }
    }

    /// Time since the last message or state transition
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Pairing code as presented to a caller, applying the expiry policy
    pub fn pairing_view(&self, ttl: Duration) -> PairingCodeView {
        if self.status == SessionStatus::Connected {
            return PairingCodeView::AlreadyConnected;
        }
        match &self.pairing_code {
            Some(code) if !code.is_expired(ttl) => PairingCodeView::Available {
                image: code.image.clone(),
                issued_at_ms: code.issued_at_ms,
            },
            _ => PairingCodeView::Awaiting,
        }
    }
}

/// Answer to a pairing code request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PairingCodeView {
    /// A fresh code is available for scanning
    Available {
        image: String,
        #[serde(rename = "issuedAtMs")]
        issued_at_ms: u64,
    },
    /// No code yet, or the last one expired
    Awaiting,
    /// The session is connected and needs no pairing
    AlreadyConnected,
}
