//! Core error types for MultiZap

use std::path::PathBuf;
use thiserror::Error;

use crate::types::TenantId;

/// Top-level error type for the MultiZap ecosystem
#[derive(Error, Debug)]
pub enum MzError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Credential store error
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Coordinator error
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the session transport capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening a transport session failed
    #[error("Failed to open transport: {0}")]
    Open(String),

    /// The send primitive failed
    #[error("Failed to send: {0}")]
    Send(String),

    /// Graceful logout failed
    #[error("Failed to log out: {0}")]
    Logout(String),

    /// The transport session is already closed
    #[error("Transport closed")]
    Closed,
}

/// Errors reported by a credential store
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tenant id cannot be used as a storage key
    #[error("Invalid tenant id for credential storage: {0:?}")]
    InvalidTenantId(String),
}

/// Failure turning a pairing code into its presentable form
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to encode pairing code: {0}")]
pub struct EncodeError(pub String);

/// Session-level errors, surfaced synchronously to the caller
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation requires a connected session
    #[error("Session {0} is not connected")]
    NotConnected(TenantId),

    /// Media type outside {image, video, audio, document}
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Connection attempt budget is spent
    #[error("Connection attempts exhausted ({attempts}/{max})")]
    AttemptsExhausted { attempts: u32, max: u32 },

    /// A connection attempt is already in flight
    #[error("Connection already in progress for {0}")]
    AlreadyConnecting(TenantId),

    /// Opening the transport failed
    #[error("Transport open failed: {0}")]
    TransportOpen(#[source] TransportError),

    /// The transport rejected an outbound message
    #[error("Send failed: {0}")]
    SendFailed(#[source] TransportError),

    /// Credentials could not be loaded
    #[error("Credential store failure: {0}")]
    Credentials(#[from] CredentialError),

    /// The session has been terminated and accepts no more commands
    #[error("Session {0} is terminated")]
    Terminated(TenantId),
}

/// Coordinator-level policy rejections
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Total session limit reached
    #[error("Session capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    /// A creation for this tenant is queued or establishing
    #[error("Session creation already in progress for {0}")]
    AlreadyInProgress(TenantId),

    /// No session for this tenant
    #[error("Session not found: {0}")]
    NotFound(TenantId),

    /// The coordinator has been stopped
    #[error("Coordinator stopped")]
    Stopped,

    /// Failure inside the tenant's session
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl SessionError {
    /// Stable identifier of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotConnected(_) => "not_connected",
            SessionError::UnsupportedMediaType(_) => "unsupported_media_type",
            SessionError::AttemptsExhausted { .. } => "attempts_exhausted",
            SessionError::AlreadyConnecting(_) => "already_in_progress",
            SessionError::TransportOpen(_) => "transport_open_error",
            SessionError::SendFailed(_) => "send_failed",
            SessionError::Credentials(_) => "credential_error",
            SessionError::Terminated(_) => "terminated",
        }
    }

    /// Whether the failure was caused by the caller (4xx) rather than the
    /// environment (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected(_)
                | SessionError::UnsupportedMediaType(_)
                | SessionError::AttemptsExhausted { .. }
                | SessionError::AlreadyConnecting(_)
                | SessionError::Terminated(_)
        )
    }
}

impl CoordinatorError {
    /// Stable identifier of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::CapacityExceeded { .. } => "capacity_exceeded",
            CoordinatorError::AlreadyInProgress(_) => "already_in_progress",
            CoordinatorError::NotFound(_) => "not_found",
            CoordinatorError::Stopped => "stopped",
            CoordinatorError::Session(e) => e.kind(),
        }
    }

    /// Whether the failure was caused by the caller (4xx) rather than the
    /// environment (5xx).
    pub fn is_client_error(&self) -> bool {
        match self {
            CoordinatorError::CapacityExceeded { .. }
            | CoordinatorError::AlreadyInProgress(_)
            | CoordinatorError::NotFound(_) => true,
            CoordinatorError::Stopped => false,
            CoordinatorError::Session(e) => e.is_client_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_error_kind_delegates_to_session() {
        let err = CoordinatorError::from(SessionError::NotConnected(TenantId::new("t1")));
        assert_eq!(err.kind(), "not_connected");
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Session t1 is not connected");
    }

    #[test]
    fn test_transport_open_is_server_error() {
        let err = SessionError::TransportOpen(TransportError::Open("refused".into()));
        assert_eq!(err.kind(), "transport_open_error");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_aggregate_conversion() {
        fn purge() -> Result<(), MzError> {
            let result: Result<(), CredentialError> =
                Err(CredentialError::InvalidTenantId("..".into()));
            result?;
            Ok(())
        }
        assert!(matches!(purge(), Err(MzError::Credential(_))));
    }

    #[test]
    fn test_capacity_message() {
        let err = CoordinatorError::CapacityExceeded { max: 10 };
        assert_eq!(err.to_string(), "Session capacity exceeded (max 10)");
        assert_eq!(err.kind(), "capacity_exceeded");
    }
}
