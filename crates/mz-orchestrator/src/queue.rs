//! Serial session creation queue
//!
//! Creation requests are processed one at a time by a single worker, so that
//! at most one tenant is being admitted at any instant regardless of how many
//! callers race on `create_session`.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mz_core::error::CoordinatorError;
use mz_core::types::TenantId;

use crate::coordinator::TenantCoordinator;

/// Successful outcome of a creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    /// A fresh session was created and its transport opened
    Created,
    /// The tenant already had a connected session
    AlreadyConnected,
}

/// A queued creation waiting for the worker
pub(crate) struct CreationRequest {
    pub tenant_id: TenantId,
    pub reply: oneshot::Sender<Result<CreateOutcome, CoordinatorError>>,
}

/// Run the creation worker until cancelled.
///
/// Requests are taken off the queue in arrival order and each one is fully
/// processed, including the new session's transport open, before the next
/// is looked at. The tenant's pending mark is cleared before the caller is
/// answered.
///
/// # Arguments
///
/// * `coordinator` - The coordinator performing each creation
/// * `requests` - Queue fed by `TenantCoordinator::create_session`
/// * `cancel` - Cancellation token for graceful shutdown
pub(crate) async fn run_creation_worker(
    coordinator: TenantCoordinator,
    mut requests: mpsc::UnboundedReceiver<CreationRequest>,
    cancel: CancellationToken,
) {
    tracing::info!("Starting session creation worker");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::info!("Session creation worker shutting down");
                break;
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                let result = coordinator.process_creation(&request.tenant_id).await;
                coordinator.state().sessions.clear_pending(&request.tenant_id);

                if let Err(e) = &result {
                    tracing::warn!(
                        "Session creation for tenant {} failed: {}",
                        request.tenant_id,
                        e
                    );
                }
                // The caller may have given up waiting.
                let _ = request.reply.send(result);
            }
        }
    }
}
