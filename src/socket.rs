//! The seam between the bridge and the actual WhatsApp device protocol.
//!
//! The bridge never talks to the wire directly; it drives a
//! [`DeviceSocket`] handle and consumes the [`SocketEvent`] stream the
//! factory hands back alongside it. The in-process [`mock`] implementation
//! backs the integration tests.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{SessionError, SocketError};
use crate::jid::Jid;
use crate::types::{GroupMetadata, MediaRef, SocketEvent};

/// Request/response surface of one paired device connection. Event-shaped
/// traffic arrives on the channel returned by [`SocketFactory::connect`].
#[async_trait]
pub trait DeviceSocket: Send + Sync {
    /// Profile picture URL for a contact or group. `Ok(None)` means the
    /// target has no picture or hides it from us.
    async fn profile_picture_url(
        &self,
        jid: &Jid,
        preview: bool,
    ) -> Result<Option<String>, SocketError>;

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata, SocketError>;

    /// Resolve a device identity to its phone identity, if the provider
    /// knows the pairing.
    async fn pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>, SocketError>;

    async fn lid_for_pn(&self, pn: &Jid) -> Result<Option<Jid>, SocketError>;

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, SocketError>;

    /// Ask the peer for a privacy token, which sometimes unlocks an avatar
    /// fetch that would otherwise 403. Failures are expected and ignored.
    async fn request_privacy_token(&self, jid: &Jid) -> Result<(), SocketError>;

    async fn logout(&self) -> Result<(), SocketError>;
}

/// Buffer for one session's event channel. Sized for history bursts.
pub const EVENT_CHANNEL_CAPACITY: usize = 512;

#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Open a device connection for one account, resuming from `auth` when
    /// present or starting a fresh QR pairing when `None`.
    async fn connect(
        &self,
        account_id: &str,
        auth: Option<serde_json::Value>,
    ) -> Result<(Arc<dyn DeviceSocket>, mpsc::Receiver<SocketEvent>), SessionError>;
}

pub mod mock {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scriptable socket for tests: seed lookups up front, then drive the
    /// session by pushing events through the factory's handle.
    #[derive(Default)]
    pub struct MockSocket {
        pub avatars: DashMap<String, Option<String>>,
        pub groups: DashMap<String, GroupMetadata>,
        pub lid_to_pn: DashMap<String, Jid>,
        pub pn_to_lid: DashMap<String, Jid>,
        pub media: DashMap<String, Vec<u8>>,
        pub logout_calls: AtomicUsize,
        pub fail_media: std::sync::atomic::AtomicBool,
    }

    impl MockSocket {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DeviceSocket for MockSocket {
        async fn profile_picture_url(
            &self,
            jid: &Jid,
            _preview: bool,
        ) -> Result<Option<String>, SocketError> {
            match self.avatars.get(&jid.to_string()) {
                Some(entry) => Ok(entry.clone()),
                None => Ok(None),
            }
        }

        async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata, SocketError> {
            self.groups
                .get(&group.to_string())
                .map(|entry| entry.clone())
                .ok_or_else(|| SocketError::Request(format!("unknown group {group}")))
        }

        async fn pn_for_lid(&self, lid: &Jid) -> Result<Option<Jid>, SocketError> {
            Ok(self.lid_to_pn.get(&lid.user).map(|entry| entry.clone()))
        }

        async fn lid_for_pn(&self, pn: &Jid) -> Result<Option<Jid>, SocketError> {
            Ok(self.pn_to_lid.get(&pn.user).map(|entry| entry.clone()))
        }

        async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, SocketError> {
            if self.fail_media.load(Ordering::SeqCst) {
                return Err(SocketError::Request("download failed".into()));
            }
            let key = media.direct_path.clone().unwrap_or_default();
            Ok(self
                .media
                .get(&key)
                .map(|entry| entry.clone())
                .unwrap_or_else(|| b"media-bytes".to_vec()))
        }

        async fn request_privacy_token(&self, _jid: &Jid) -> Result<(), SocketError> {
            Ok(())
        }

        async fn logout(&self) -> Result<(), SocketError> {
            self.logout_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// One connected account as seen from the test side.
    pub struct MockHandle {
        pub socket: Arc<MockSocket>,
        pub events: mpsc::Sender<SocketEvent>,
        /// Auth blob passed to the connect call that produced this handle.
        pub auth: Option<serde_json::Value>,
    }

    #[derive(Default)]
    pub struct MockSocketFactory {
        pub handles: DashMap<String, Arc<MockHandle>>,
        pub connect_count: AtomicUsize,
        /// Sockets to hand out on connect, keyed by account. Missing
        /// entries get a fresh default socket.
        pub prepared: DashMap<String, Arc<MockSocket>>,
    }

    impl MockSocketFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn prepare(&self, account_id: &str, socket: Arc<MockSocket>) {
            self.prepared.insert(account_id.to_string(), socket);
        }

        pub fn handle(&self, account_id: &str) -> Option<Arc<MockHandle>> {
            self.handles.get(account_id).map(|entry| entry.clone())
        }

        pub async fn push(&self, account_id: &str, event: SocketEvent) {
            let handle = self
                .handle(account_id)
                .unwrap_or_else(|| panic!("no mock handle for {account_id}"));
            handle.events.send(event).await.expect("event channel closed");
        }
    }

    #[async_trait]
    impl SocketFactory for MockSocketFactory {
        async fn connect(
            &self,
            account_id: &str,
            auth: Option<serde_json::Value>,
        ) -> Result<(Arc<dyn DeviceSocket>, mpsc::Receiver<SocketEvent>), SessionError> {
            self.connect_count.fetch_add(1, Ordering::SeqCst);
            let socket = self
                .prepared
                .get(account_id)
                .map(|entry| entry.clone())
                .unwrap_or_else(|| Arc::new(MockSocket::new()));
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            self.handles.insert(
                account_id.to_string(),
                Arc::new(MockHandle {
                    socket: socket.clone(),
                    events: tx,
                    auth,
                }),
            );
            Ok((socket, rx))
        }
    }
}
