//! Multi-tenant bridge between WhatsApp device sessions and a CRM.
//!
//! One [`Bridge`] owns a registry of per-account [`Session`]s, each driven
//! by a device socket event stream. Incoming traffic is mapped onto lead,
//! conversation, message and attachment rows through the [`store::CrmStore`]
//! seam, with realtime fan-out, an agents webhook and a bounded on-disk
//! retry queue for store outages.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod jid;
pub mod jobs;
pub mod notify;
pub mod qr;
pub mod realtime;
pub mod retry_queue;
pub mod session;
pub mod socket;
pub mod storage;
pub mod store;
pub mod types;
pub mod util;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{IngestError, SessionError, SocketError, StoreError};
pub use jid::Jid;
pub use session::Session;
pub use types::{
    CloseReason, ConnectedUser, EnvelopeContent, MessageKey, MessageSource, RawMessage,
    SessionStatus, SocketEvent,
};
