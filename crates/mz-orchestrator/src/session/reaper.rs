//! Idle session reaper
//!
//! Periodically removes sessions without any message or state transition
//! for longer than the configured idle threshold.
//!
//! # Idle Removal
//!
//! A reaped session goes through the same path as an explicit removal:
//! - The transport is logged out and the session actor stops
//! - After the purge delay the tenant's credentials are deleted

use tokio_util::sync::CancellationToken;

use crate::coordinator::TenantCoordinator;

/// Run the idle reaper until cancelled.
///
/// Every `reap_interval` this asks the coordinator to remove sessions idle
/// for longer than `idle_threshold`. The first check happens one full
/// interval after start.
///
/// # Arguments
///
/// * `coordinator` - The coordinator owning the sessions
/// * `cancel` - Cancellation token for graceful shutdown
pub async fn run_idle_reaper(coordinator: TenantCoordinator, cancel: CancellationToken) {
    let config = &coordinator.state().config;
    let mut interval = tokio::time::interval(config.reap_interval);
    // The first tick completes immediately.
    interval.tick().await;

    tracing::info!(
        "Starting idle reaper (threshold: {:?}, check interval: {:?})",
        config.idle_threshold,
        config.reap_interval
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let reaped = coordinator.reap_idle_sessions().await;
                if !reaped.is_empty() {
                    tracing::info!("Reaped {} idle sessions", reaped.len());
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Idle reaper shutting down");
                break;
            }
        }
    }
}
