//! Process-wide bridge context: the session registry plus every external
//! seam (store, object storage, realtime, agents webhook, socket factory).
//! All state is owned here and passed down explicitly; there are no
//! ambient singletons.

use dashmap::DashMap;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::connection::{BadSessionTracker, RestartTracker};
use crate::error::SessionError;
use crate::notify::AgentsNotifier;
use crate::realtime::Realtime;
use crate::retry_queue::RetryQueue;
use crate::session::Session;
use crate::socket::SocketFactory;
use crate::storage::ObjectStorage;
use crate::store::{CrmStore, MANUAL_DISCONNECT};
use crate::types::SessionStatus;

pub struct Bridge {
    pub config: BridgeConfig,
    pub store: Arc<dyn CrmStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub realtime: Arc<dyn Realtime>,
    pub notifier: Arc<dyn AgentsNotifier>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub retry_queue: RetryQueue,
    pub(crate) sessions: DashMap<String, Arc<Session>>,
    pub(crate) restarts: RestartTracker,
    pub(crate) bad_sessions: BadSessionTracker,
    drain_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn CrmStore>,
        storage: Arc<dyn ObjectStorage>,
        realtime: Arc<dyn Realtime>,
        notifier: Arc<dyn AgentsNotifier>,
        socket_factory: Arc<dyn SocketFactory>,
    ) -> Arc<Self> {
        let retry_queue = RetryQueue::new(&config);
        let bad_sessions = BadSessionTracker::new(&config);
        Arc::new(Self {
            config,
            store,
            storage,
            realtime,
            notifier,
            socket_factory,
            retry_queue,
            sessions: DashMap::new(),
            restarts: RestartTracker::new(),
            bad_sessions,
            drain_task: std::sync::Mutex::new(None),
        })
    }

    pub fn session(&self, account_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(account_id).map(|entry| entry.clone())
    }

    /// Open (or reuse) the session for one account. `force_new` tears
    /// down any existing session and starts a fresh QR pairing.
    pub async fn create_session(
        self: &Arc<Self>,
        account_id: &str,
        workspace_id: &str,
        force_new: bool,
    ) -> Result<Arc<Session>, SessionError> {
        if !force_new {
            if let Some(existing) = self.session(account_id) {
                if !existing.is_blocked() && existing.status() != SessionStatus::Disconnected {
                    return Ok(existing);
                }
            }
        }
        if force_new {
            if let Some((_, old)) = self.sessions.remove(account_id) {
                old.block();
                if let Some(socket) = old.socket() {
                    let _ = socket.logout().await;
                }
            }
            self.restarts.clear(account_id);
            self.bad_sessions.clear(account_id);
        }
        self.store
            .ensure_session_row(account_id, workspace_id)
            .await?;
        let auth = if force_new {
            None
        } else {
            self.store.load_auth(account_id).await?
        };
        info!(
            "Opening session for account {account_id} (stored credentials: {})",
            auth.is_some()
        );
        let (socket, events) = self.socket_factory.connect(account_id, auth).await?;
        let session = Session::new(
            account_id.to_string(),
            workspace_id.to_string(),
            socket,
            self.config.clone(),
        );
        self.sessions
            .insert(account_id.to_string(), session.clone());
        let bridge = self.clone();
        let task_session = session.clone();
        tokio::spawn(async move {
            bridge.run_session_loop(task_session, events).await;
        });
        Ok(session)
    }

    /// Intentional disconnect. Keeps credentials so the account can be
    /// reconnected later, but flags the row so bootstrap leaves it alone.
    /// Also valid while the account is between sessions (a reconnect timer
    /// armed but no live socket): the timer is cancelled and the row is
    /// still flagged.
    pub async fn disconnect(&self, account_id: &str) -> Result<(), SessionError> {
        if let Some((_, session)) = self.sessions.remove(account_id) {
            session.block();
            session.set_status(SessionStatus::Disconnected);
            if let Some(socket) = session.socket() {
                if let Err(err) = socket.logout().await {
                    warn!("Logout failed for {account_id}: {err}");
                }
            }
            session.drop_socket();
        }
        self.restarts.clear(account_id);
        self.bad_sessions.clear(account_id);
        self.store
            .mark_disconnected(account_id, MANUAL_DISCONNECT, false)
            .await?;
        info!("Disconnected account {account_id}");
        Ok(())
    }

    /// Reconnect every credentialed account on process start. Failures
    /// are per-account; one bad account never blocks the rest.
    pub async fn bootstrap(self: &Arc<Self>) -> anyhow::Result<usize> {
        let accounts = self.store.accounts_to_bootstrap().await?;
        let mut opened = 0;
        for account in accounts {
            match self
                .create_session(&account.account_id, &account.workspace_id, false)
                .await
            {
                Ok(_) => opened += 1,
                Err(err) => {
                    error!("Bootstrap failed for account {}: {err}", account.account_id)
                }
            }
        }
        info!("Bootstrap opened {opened} sessions");
        Ok(opened)
    }

    /// Load the retry queue from disk and start the periodic drain task.
    pub async fn start(self: &Arc<Self>) {
        self.retry_queue.load_from_disk().await;
        let bridge = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bridge.config.retry_queue_flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bridge.flush_retry_queue().await;
            }
        });
        *self.drain_task.lock().unwrap() = Some(handle);
    }

    /// One drain pass over the retry queue. Accounts without a live
    /// session are skipped without disturbing the others; the first
    /// transient store failure halts the whole pass, since retrying the
    /// rest against a down store is pointless.
    pub async fn flush_retry_queue(self: &Arc<Self>) {
        if !self.retry_queue.enabled()
            || self.retry_queue.is_unavailable()
            || !self.retry_queue.has_pending().await
        {
            return;
        }
        if !self.retry_queue.begin_flush() {
            return;
        }
        let _guard = scopeguard::guard((), |_| self.retry_queue.end_flush());
        let mut skip: HashSet<String> = HashSet::new();
        let mut processed = 0usize;
        let mut dropped = 0usize;
        while let Some(item) = self.retry_queue.next_after(&skip).await {
            let session = match self.session(&item.account_id) {
                Some(session)
                    if !session.is_blocked()
                        && session.status() != SessionStatus::Disconnected =>
                {
                    session
                }
                _ => {
                    skip.insert(item.account_id);
                    continue;
                }
            };
            match self
                .process_message(&session, item.message.clone(), item.source, false)
                .await
            {
                Ok(()) => {
                    self.retry_queue.remove(&item.id).await;
                    // Rewrite per removal, so a crash mid-pass cannot
                    // replay an item that already landed.
                    self.retry_queue.rewrite_to_disk().await;
                    processed += 1;
                }
                Err(err) if err.is_transient_store() => {
                    warn!("Store still unavailable during drain: {err}");
                    self.retry_queue.mark_unavailable();
                    break;
                }
                Err(err) => {
                    warn!(
                        "Dropping queued message {} for account {}: {err}",
                        item.id, item.account_id
                    );
                    self.retry_queue.remove(&item.id).await;
                    self.retry_queue.rewrite_to_disk().await;
                    dropped += 1;
                }
            }
        }
        if processed > 0 || dropped > 0 {
            info!("Retry queue drain: {processed} replayed, {dropped} dropped");
        }
    }

    /// Stop background tasks. Sessions are left connected; this is for
    /// graceful process shutdown where sockets die with the process.
    pub fn shutdown(&self) {
        if let Some(handle) = self.drain_task.lock().unwrap().take() {
            handle.abort();
        }
        self.restarts.abort_all();
    }
}
