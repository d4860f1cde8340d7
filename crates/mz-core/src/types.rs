//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    /// Create a new tenant ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a tenant session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session exists but has never connected
    Idle,
    /// Transport is being opened
    Connecting,
    /// A pairing code was issued and is waiting to be scanned
    QrPending,
    /// Transport reports the session as open
    Connected,
    /// Transport is gone, no retry decided yet
    Disconnected,
    /// A reconnection timer is armed
    ReconnectScheduled,
    /// Session is finished and will not be reused
    Terminated,
}

impl SessionStatus {
    /// Whether the session is establishing a connection and counts against
    /// the concurrency ceiling.
    pub fn is_establishing(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::QrPending)
    }

    /// Whether the session is connected or on its way to being connected.
    pub fn is_live(self) -> bool {
        self.is_establishing() || self == SessionStatus::Connected
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::QrPending => write!(f, "qr_pending"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::ReconnectScheduled => write!(f, "reconnect_scheduled"),
            SessionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Transport-assigned identifier of a sent message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported media categories for outbound media messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Whether a caption is delivered alongside this kind of media
    pub fn accepts_caption(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Image => write!(f, "image"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Document => write!(f, "document"),
        }
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            "audio" => Ok(MediaKind::Audio),
            "document" => Ok(MediaKind::Document),
            other => Err(other.to_string()),
        }
    }
}

/// Media message as submitted by a caller.
///
/// `media_type` is kept as a string so that unsupported values can be
/// rejected with a precise error instead of a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    /// One of `image`, `video`, `audio`, `document`
    #[serde(rename = "type")]
    pub media_type: String,
    /// Location of the media content
    pub url: String,
    /// MIME type (documents)
    #[serde(default)]
    pub mimetype: Option<String>,
    /// File name shown to the recipient (documents)
    #[serde(default)]
    pub file_name: Option<String>,
}

impl MediaMessage {
    /// Parse the declared media type
    pub fn kind(&self) -> Result<MediaKind, String> {
        self.media_type.parse()
    }
}

/// Payload handed to the transport's send primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundPayload {
    /// Plain text message
    Text { text: String },
    /// Media message
    Media {
        media: MediaKind,
        url: String,
        caption: Option<String>,
        mimetype: Option<String>,
        file_name: Option<String>,
    },
}

impl OutboundPayload {
    /// Build a text payload
    pub fn text(text: impl Into<String>) -> Self {
        OutboundPayload::Text { text: text.into() }
    }

    /// Build a media payload, dropping fields the media kind does not carry.
    pub fn media(kind: MediaKind, message: MediaMessage, caption: Option<String>) -> Self {
        let is_document = kind == MediaKind::Document;
        OutboundPayload::Media {
            media: kind,
            url: message.url,
            caption: caption
                .filter(|c| !c.is_empty())
                .filter(|_| kind.accepts_caption()),
            mimetype: message.mimetype.filter(|_| is_document),
            file_name: message.file_name.filter(|_| is_document),
        }
    }
}

/// Opaque credential material owned by the transport.
///
/// The session manager never inspects it: it is loaded before a transport
/// open and written back verbatim on every credential change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialState(pub serde_json::Value);

impl CredentialState {
    /// State for a tenant that has never paired
    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    /// Whether any credential material is present
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}
