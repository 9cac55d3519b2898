//! One live account session: the socket handle plus everything the
//! pipeline needs to interpret traffic for that account.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::cache::SessionCaches;
use crate::config::BridgeConfig;
use crate::jid::Jid;
use crate::socket::DeviceSocket;
use crate::types::SessionStatus;

/// Identity of the paired device owner, filled on a successful open.
#[derive(Debug, Clone, Default)]
pub struct OwnProfile {
    pub jid: Option<Jid>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Scheduling state of one backfill job.
#[derive(Default)]
pub struct JobFlag {
    pub scheduled: AtomicBool,
    pub running: AtomicBool,
}

#[derive(Default)]
pub struct JobFlags {
    pub lead_names: JobFlag,
    pub sender_names: JobFlag,
    pub avatars: JobFlag,
}

pub struct Session {
    pub account_id: String,
    pub workspace_id: String,
    socket: RwLock<Option<Arc<dyn DeviceSocket>>>,
    status: RwLock<SessionStatus>,
    /// Set for the whole teardown of an intentional disconnect; close
    /// events arriving while blocked are ignored.
    blocked: AtomicBool,
    own: RwLock<OwnProfile>,
    last_qr: RwLock<Option<String>>,
    pub caches: SessionCaches,
    pub jobs: JobFlags,
    pub config: BridgeConfig,
}

impl Session {
    pub fn new(
        account_id: String,
        workspace_id: String,
        socket: Arc<dyn DeviceSocket>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            workspace_id,
            socket: RwLock::new(Some(socket)),
            status: RwLock::new(SessionStatus::Connecting),
            blocked: AtomicBool::new(false),
            own: RwLock::new(OwnProfile::default()),
            last_qr: RwLock::new(None),
            caches: SessionCaches::new(),
            jobs: JobFlags::default(),
            config,
        })
    }

    /// Clone the socket handle out; guards are never held across awaits.
    pub fn socket(&self) -> Option<Arc<dyn DeviceSocket>> {
        self.socket.read().unwrap().clone()
    }

    pub fn drop_socket(&self) {
        *self.socket.write().unwrap() = None;
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap() = status;
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn own(&self) -> OwnProfile {
        self.own.read().unwrap().clone()
    }

    pub fn set_own(&self, profile: OwnProfile) {
        *self.own.write().unwrap() = profile;
    }

    pub fn update_own<F: FnOnce(&mut OwnProfile)>(&self, f: F) {
        f(&mut self.own.write().unwrap());
    }

    pub fn last_qr(&self) -> Option<String> {
        self.last_qr.read().unwrap().clone()
    }

    pub fn set_last_qr(&self, qr: Option<String>) {
        *self.last_qr.write().unwrap() = qr;
    }
}
