//! Wire-facing data model.
//!
//! Everything a device socket can emit is decoded once, at the edge, into
//! the tagged enums below. The ingestion pipeline and the retry queue both
//! work on [`RawMessage`], so a message replayed from disk takes exactly
//! the same path as a live one.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::jid::Jid;

/// Binary payload carried inside a JSON envelope (media keys mostly).
/// Serialized as `{"type":"bytes","len":N,"data":"<base64>"}` so queue
/// files stay line-oriented and human-inspectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedBytes(pub Vec<u8>);

impl Serialize for TaggedBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TaggedBytes", 3)?;
        s.serialize_field("type", "bytes")?;
        s.serialize_field("len", &self.0.len())?;
        s.serialize_field("data", &BASE64.encode(&self.0))?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for TaggedBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            kind: String,
            data: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        if raw.kind != "bytes" {
            return Err(D::Error::custom(format!(
                "expected tagged bytes, got type {:?}",
                raw.kind
            )));
        }
        let bytes = BASE64
            .decode(raw.data.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64 payload: {e}")))?;
        Ok(TaggedBytes(bytes))
    }
}

/// Provider-side identity of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    pub remote_jid: Jid,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    /// Sender inside a group chat. Absent for direct chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Document,
    Audio,
    Sticker,
}

/// Everything needed to fetch one media blob from the provider later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_key: Option<TaggedBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_length: Option<u64>,
}

/// Quote/mention context attached to a content node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stanza_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted: Option<Box<EnvelopeContent>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentioned: Vec<String>,
}

/// One decoded content node. Wrapper variants nest another node and are
/// peeled off by the pipeline before classification. Adjacently tagged
/// so nested wrappers keep their own `type` key intact on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EnvelopeContent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextInfo>,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextInfo>,
    },
    Video {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextInfo>,
    },
    Document {
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextInfo>,
    },
    Audio {
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextInfo>,
    },
    Sticker {
        media: MediaRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextInfo>,
    },
    Ephemeral(Box<EnvelopeContent>),
    ViewOnce(Box<EnvelopeContent>),
    ViewOnceV2(Box<EnvelopeContent>),
    ViewOnceV2Extension(Box<EnvelopeContent>),
    DocumentWithCaption(Box<EnvelopeContent>),
    Edited(Box<EnvelopeContent>),
    /// Anything the socket produced that we do not model (reactions,
    /// protocol messages, polls). Persisted with a generic placeholder.
    Unknown,
}

/// One message as received from the socket, before any CRM mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub key: MessageKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Provider timestamp. Seconds or milliseconds depending on the code
    /// path that produced it; [`RawMessage::timestamp_ms`] disambiguates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<EnvelopeContent>,
}

impl RawMessage {
    /// Timestamp in epoch milliseconds, defaulting to now when absent.
    pub fn timestamp_ms(&self) -> i64 {
        match self.timestamp {
            Some(ts) if ts > 1_000_000_000_000 => ts,
            Some(ts) => ts * 1000,
            None => Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Live,
    History,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::Live => "live",
            MessageSource::History => "history",
        }
    }
}

/// Chat upsert pushed by the socket (history sync or live).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUpsert {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Contact upsert pushed by the socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactUpsert {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// The authenticated device owner, reported on a successful open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectedUser {
    /// Raw device address, possibly with a `:device` suffix.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
}

/// Why the socket closed. Drives the reconnect state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The account was unpaired remotely. Terminal.
    LoggedOut,
    /// Corrupt crypto state. Counts toward forced re-pairing.
    BadSession,
    /// The provider asked for a quick reconnect.
    RestartRequired,
    ConnectionLost,
    Other { detail: String },
}

impl CloseReason {
    /// Short label persisted as the session's `sync_last_error`.
    pub fn label(&self) -> &str {
        match self {
            CloseReason::LoggedOut => "logged_out",
            CloseReason::BadSession => "bad_session",
            CloseReason::RestartRequired => "restart_required",
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::Other { detail } => detail,
        }
    }
}

/// Events a device socket pushes into its session channel.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Qr {
        code: String,
    },
    Open {
        user: ConnectedUser,
    },
    Close {
        reason: CloseReason,
    },
    /// Updated credential blob to persist. Opaque to the bridge.
    AuthUpdate {
        auth: serde_json::Value,
    },
    /// History sync batch: chats, contacts and a backlog of messages.
    History {
        chats: Vec<ChatUpsert>,
        contacts: Vec<ContactUpsert>,
        messages: Vec<RawMessage>,
    },
    LiveMessages {
        messages: Vec<RawMessage>,
    },
    ChatsUpsert {
        chats: Vec<ChatUpsert>,
    },
    ContactsUpsert {
        contacts: Vec<ContactUpsert>,
        /// True for the full address book dump right after pairing.
        initial: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

/// Who a persisted message is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAuthor {
    /// Sent from the paired device itself.
    Team,
    Contact,
    /// Sent by an automation agent through the CRM. Never overwritten by
    /// provider echoes of the same message.
    Agent,
}

impl MessageAuthor {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageAuthor::Team => "team",
            MessageAuthor::Contact => "contact",
            MessageAuthor::Agent => "agente",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    ViewOnce,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::ViewOnce => "view_once",
        }
    }
}
