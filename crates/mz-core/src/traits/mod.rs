//! Collaborator trait definitions

mod credentials;
mod pairing;
mod transport;

pub use credentials::CredentialStore;
pub use pairing::{DataUrlEncoder, PairingCodeEncoder};
pub use transport::{SessionTransport, TaggedEvent, TransportEvent, TransportEvents, TransportHandle};
