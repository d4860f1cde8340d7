//! mz-core: Core abstractions and configuration for MultiZap
//!
//! This crate provides the shared types, error taxonomy, configuration and
//! collaborator traits (session transport, credential store, pairing code
//! encoder) used by the tenant session orchestrator.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::MzError;
pub use types::{SessionStatus, TenantId};
