//! Process-wide admission for transport opens
//!
//! The transport is fragile to concurrent or rapid pairing across tenants.
//! The gate bounds how many sessions may be establishing at once and spaces
//! successive transport opens apart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Shared admission control for all sessions of a coordinator
pub struct OpenGate {
    /// One permit per session allowed in `connecting`/`qr_pending`
    permits: Arc<Semaphore>,
    /// Capacity of `permits`
    max_establishing: usize,
    /// Minimum spacing between two opens
    spacing: Duration,
    /// Slot reserved by the most recent open
    last_slot: Mutex<Option<Instant>>,
}

impl OpenGate {
    /// Create a gate admitting `max_establishing` sessions at a time
    pub fn new(max_establishing: usize, spacing: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_establishing)),
            max_establishing,
            spacing,
            last_slot: Mutex::new(None),
        }
    }

    /// Wait for an establishing permit.
    ///
    /// The permit must be held for as long as the session is connecting or
    /// waiting for a pairing scan. Fails once the gate is closed.
    pub async fn acquire_establishing(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.permits).acquire_owned().await
    }

    /// Reserve the next open slot and sleep until it starts.
    ///
    /// Slots are handed out in call order, each at least `spacing` after the
    /// previous one.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut last = self.last_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let slot = match *last {
                Some(previous) => (previous + self.spacing).max(now),
                None => now,
            };
            *last = Some(slot);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Number of sessions currently holding an establishing permit
    pub fn establishing(&self) -> usize {
        self.max_establishing
            .saturating_sub(self.permits.available_permits())
    }

    /// Reject all further permit requests
    pub fn close(&self) {
        self.permits.close();
    }
}
