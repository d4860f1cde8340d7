//! Tenant session state machine and its supporting pieces

pub mod backoff;
pub mod gate;
mod handle;
mod machine;
pub mod reaper;
mod registry;
mod snapshot;

pub use backoff::{DisconnectTier, ReconnectBackoff, ReconnectPolicy, RetryDecision};
pub use gate::OpenGate;
pub use handle::TenantSession;
pub use machine::{SessionContext, SessionSettings};
pub use registry::{PurgeGuard, SessionRegistry};
pub use snapshot::{PairingCode, PairingCodeView, SessionSnapshot};
