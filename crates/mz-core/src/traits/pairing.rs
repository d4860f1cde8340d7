//! Pairing code presentation

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::EncodeError;

/// Turns the raw pairing payload into something a human can scan.
///
/// The visual encoding belongs to the embedding application; the session
/// manager only stores and relays what the encoder returns.
pub trait PairingCodeEncoder: Send + Sync {
    fn encode(&self, code: &str) -> Result<String, EncodeError>;
}

/// Wraps the raw payload in a base64 `data:` URL.
///
/// Used when no image renderer is configured, so that callers always get a
/// self-describing value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataUrlEncoder;

impl PairingCodeEncoder for DataUrlEncoder {
    fn encode(&self, code: &str) -> Result<String, EncodeError> {
        if code.is_empty() {
            return Err(EncodeError("empty pairing code".to_string()));
        }
        Ok(format!("data:text/plain;base64,{}", STANDARD.encode(code)))
    }
}
