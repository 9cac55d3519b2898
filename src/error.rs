//! Error taxonomy for the bridge.
//!
//! Only store errors carry a transient/fatal classification: transient
//! failures (timeouts, resets, 5xx) are never surfaced as pipeline
//! failures and instead arm unavailable-mode and enqueue the raw message.
//! Everything else propagates to the caller, which logs and continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Timeouts, connection resets and 5xx responses. Eligible for the
    /// retry queue.
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Classify an HTTP status from the store's API layer.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let message = format!("http {}: {}", status, detail.into());
        if status >= 500 {
            StoreError::Transient(message)
        } else {
            StoreError::Fatal(message)
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => StoreError::Transient(err.to_string()),
            _ => StoreError::Fatal(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is not available")]
    NotAvailable,
    #[error("socket request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("media download failed: {0}")]
    Media(SocketError),
}

impl IngestError {
    /// Whether the failure should flip the store into unavailable-mode and
    /// send the raw envelope to the retry queue.
    pub fn is_transient_store(&self) -> bool {
        matches!(self, IngestError::Store(err) if err.is_transient())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Socket(#[from] SocketError),
}
