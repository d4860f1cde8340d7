//! mz-orchestrator: Multi-tenant messaging session manager
//!
//! Runs one session state machine per tenant on top of an external session
//! transport, and coordinates creation, pairing, reconnection, idle reaping
//! and removal of many sessions under a shared concurrency ceiling.

pub mod coordinator;
pub mod credentials;
pub mod events;
pub mod queue;
pub mod session;
pub mod state;

pub use coordinator::{CoordinatorStats, TenantCoordinator};
pub use events::SessionEvent;
pub use queue::CreateOutcome;
pub use session::{PairingCodeView, SessionSnapshot, TenantSession};
pub use state::CoordinatorState;
