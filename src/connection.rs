//! Connection state machine: QR flow, open/close transitions, backoff
//! reconnects and bad-session escalation.

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::identity::{contact_ids, contact_name, expand_contact_ids, own_name_from_user};
use crate::jid;
use crate::qr::qr_data_url;
use crate::session::{OwnProfile, Session};
use crate::store::StoredIdentity;
use crate::types::{
    ChatUpsert, CloseReason, ConnectedUser, ContactUpsert, MessageSource, SessionStatus,
    SocketEvent,
};

/// Backoff before reconnect attempt `attempts` (1-based):
/// `base * 2^(attempts-1)`, capped.
pub fn restart_delay(config: &BridgeConfig, attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(30);
    config
        .restart_backoff
        .saturating_mul(1u32 << shift)
        .min(config.restart_max_backoff)
}

/// Counts bad-session closes per account inside a sliding window. Hitting
/// the threshold means the stored credentials are beyond repair and the
/// account must pair again.
pub struct BadSessionTracker {
    strikes: DashMap<String, Vec<Instant>>,
    threshold: u32,
    window: Duration,
}

impl BadSessionTracker {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            strikes: DashMap::new(),
            threshold: config.bad_session_threshold,
            window: config.bad_session_window,
        }
    }

    /// Record a strike; returns true when re-pairing should be forced.
    pub fn register(&self, account_id: &str) -> bool {
        self.register_at(account_id, Instant::now())
    }

    pub fn register_at(&self, account_id: &str, now: Instant) -> bool {
        let mut entry = self.strikes.entry(account_id.to_string()).or_default();
        entry.retain(|at| now.duration_since(*at) <= self.window);
        entry.push(now);
        entry.len() as u32 >= self.threshold
    }

    pub fn clear(&self, account_id: &str) {
        self.strikes.remove(account_id);
    }
}

struct RestartEntry {
    attempts: u32,
    timer: Option<AbortHandle>,
}

/// Pending reconnects, one timer per account. Attempt counts persist
/// across timer fires and are only reset by a successful open or an
/// explicit disconnect, so repeated half-open connects keep climbing the
/// backoff curve.
pub struct RestartTracker {
    entries: DashMap<String, RestartEntry>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Bump and return the attempt count, aborting any pending timer.
    fn next_attempt(&self, account_id: &str) -> u32 {
        let mut entry = self
            .entries
            .entry(account_id.to_string())
            .or_insert(RestartEntry {
                attempts: 0,
                timer: None,
            });
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.attempts += 1;
        entry.attempts
    }

    fn set_timer(&self, account_id: &str, handle: AbortHandle) {
        if let Some(mut entry) = self.entries.get_mut(account_id) {
            entry.timer = Some(handle);
        }
    }

    fn clear_timer(&self, account_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(account_id) {
            entry.timer = None;
        }
    }

    pub fn clear(&self, account_id: &str) {
        if let Some((_, entry)) = self.entries.remove(account_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    pub fn abort_all(&self) {
        for mut entry in self.entries.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn attempts(&self, account_id: &str) -> u32 {
        self.entries
            .get(account_id)
            .map(|entry| entry.attempts)
            .unwrap_or(0)
    }
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Consume one session's event stream until the socket closes.
    pub(crate) async fn run_session_loop(
        self: Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::Receiver<SocketEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let is_close = matches!(event, SocketEvent::Close { .. });
            self.handle_socket_event(&session, event).await;
            if is_close {
                break;
            }
        }
        debug!("Event loop ended for account {}", session.account_id);
    }

    async fn handle_socket_event(self: &Arc<Self>, session: &Arc<Session>, event: SocketEvent) {
        match event {
            SocketEvent::Qr { code } => self.handle_qr(session, &code).await,
            SocketEvent::Open { user } => self.handle_open(session, user).await,
            SocketEvent::Close { reason } => self.handle_close(session, reason).await,
            SocketEvent::AuthUpdate { auth } => {
                if let Err(err) = self.store.save_auth(&session.account_id, &auth).await {
                    error!(
                        "Failed to persist credentials for {}: {err}",
                        session.account_id
                    );
                }
            }
            SocketEvent::History {
                chats,
                contacts,
                messages,
            } => {
                self.handle_chats_upsert(session, &chats).await;
                self.handle_contacts_upsert(session, &contacts, false).await;
                self.handle_history(session, messages).await;
            }
            SocketEvent::LiveMessages { messages } => {
                for message in messages {
                    if let Err(err) = self
                        .process_message(session, message, MessageSource::Live, true)
                        .await
                    {
                        error!(
                            "Failed to ingest live message for {}: {err}",
                            session.account_id
                        );
                    }
                }
            }
            SocketEvent::ChatsUpsert { chats } => self.handle_chats_upsert(session, &chats).await,
            SocketEvent::ContactsUpsert { contacts, initial } => {
                self.handle_contacts_upsert(session, &contacts, initial)
                    .await
            }
        }
    }

    async fn handle_qr(&self, session: &Arc<Session>, code: &str) {
        let data_url = match qr_data_url(code) {
            Ok(url) => url,
            Err(err) => {
                error!("Failed to render QR for {}: {err}", session.account_id);
                return;
            }
        };
        // The provider re-emits the current code on some event replays;
        // only a changed code is worth a row update.
        if session.last_qr().as_deref() == Some(data_url.as_str()) {
            return;
        }
        session.set_last_qr(Some(data_url.clone()));
        session.set_status(SessionStatus::Connecting);
        info!("New pairing QR for account {}", session.account_id);
        if let Err(err) = self
            .store
            .mark_connecting(&session.account_id, Some(&data_url), None)
            .await
        {
            error!("Failed to store QR for {}: {err}", session.account_id);
        }
    }

    async fn handle_open(self: &Arc<Self>, session: &Arc<Session>, user: ConnectedUser) {
        self.restarts.clear(&session.account_id);
        self.bad_sessions.clear(&session.account_id);
        let own_jid = jid::normalize_address(&user.id);
        let own_name = own_name_from_user(&user);
        session.set_own(OwnProfile {
            jid: own_jid.clone(),
            name: own_name.clone(),
            avatar_url: None,
        });
        session.set_status(SessionStatus::Connected);
        session.set_last_qr(None);
        info!(
            "Account {} connected as {}",
            session.account_id,
            own_jid
                .as_ref()
                .map(|j| j.to_string())
                .unwrap_or_else(|| user.id.clone())
        );
        let avatar = match &own_jid {
            Some(jid) => session.resolve_avatar(jid, true).await,
            None => None,
        };
        if avatar.is_some() {
            let url = avatar.clone();
            session.update_own(|own| own.avatar_url = url);
        }
        let identity = StoredIdentity {
            number: own_jid
                .map(|j| j.to_string())
                .unwrap_or_else(|| user.id.clone()),
            name: own_name,
            avatar_url: avatar,
        };
        if let Err(err) = self.store.mark_connected(&session.account_id, &identity).await {
            error!(
                "Failed to mark account {} connected: {err}",
                session.account_id
            );
        }
        self.schedule_backfills(session);
        if self.retry_queue.has_pending().await {
            let bridge = self.clone();
            tokio::spawn(async move {
                bridge.flush_retry_queue().await;
            });
        }
    }

    async fn handle_close(self: &Arc<Self>, session: &Arc<Session>, reason: CloseReason) {
        if session.is_blocked() {
            debug!(
                "Ignoring close for blocked account {}: {}",
                session.account_id,
                reason.label()
            );
            return;
        }
        let account_id = session.account_id.clone();
        let workspace_id = session.workspace_id.clone();
        session.set_status(SessionStatus::Disconnected);
        session.drop_socket();
        self.sessions
            .remove_if(&account_id, |_, entry| Arc::ptr_eq(entry, session));
        warn!("Socket closed for account {account_id}: {}", reason.label());
        match reason {
            CloseReason::LoggedOut => {
                self.restarts.clear(&account_id);
                self.bad_sessions.clear(&account_id);
                if let Err(err) = self
                    .store
                    .mark_disconnected(&account_id, reason.label(), true)
                    .await
                {
                    error!("Failed to mark {account_id} logged out: {err}");
                }
            }
            CloseReason::BadSession if self.bad_sessions.register(&account_id) => {
                warn!("Account {account_id} hit the bad-session limit; forcing re-pair");
                self.restarts.clear(&account_id);
                self.bad_sessions.clear(&account_id);
                if let Err(err) = self
                    .store
                    .mark_disconnected(&account_id, "bad_session_reauth_required", true)
                    .await
                {
                    error!("Failed to flag {account_id} for re-pairing: {err}");
                }
            }
            other => {
                if let Err(err) = self
                    .store
                    .mark_connecting(&account_id, None, Some(other.label()))
                    .await
                {
                    error!("Failed to update session row for {account_id}: {err}");
                }
                let fixed = other == CloseReason::RestartRequired;
                self.schedule_restart(account_id, workspace_id, fixed);
            }
        }
    }

    /// Arm a reconnect timer. Attempt counting lives in the tracker so a
    /// connect that opens the socket but never reaches `Open` still pays
    /// an increased delay on the next failure.
    pub(crate) fn schedule_restart(
        self: &Arc<Self>,
        account_id: String,
        workspace_id: String,
        fixed_delay: bool,
    ) {
        let attempts = self.restarts.next_attempt(&account_id);
        let timer_key = account_id.clone();
        let bridge = self.clone();
        let handle = tokio::spawn(async move {
            if attempts > bridge.config.restart_max_attempts {
                error!(
                    "Giving up on account {account_id} after {} reconnect attempts",
                    attempts - 1
                );
                bridge.restarts.clear(&account_id);
                if let Err(err) = bridge
                    .store
                    .mark_disconnected(&account_id, "max_reconnect_attempts", false)
                    .await
                {
                    error!("Failed to mark {account_id} disconnected: {err}");
                }
                return;
            }
            let delay = if fixed_delay {
                bridge.config.restart_fixed_delay
            } else {
                restart_delay(&bridge.config, attempts)
            };
            info!("Reconnecting account {account_id} in {delay:?} (attempt {attempts})");
            tokio::time::sleep(delay).await;
            bridge.restarts.clear_timer(&account_id);
            if bridge.sessions.contains_key(&account_id) {
                return;
            }
            if let Err(err) = bridge
                .create_session(&account_id, &workspace_id, false)
                .await
            {
                warn!("Reconnect attempt {attempts} failed for {account_id}: {err}");
                bridge.schedule_restart(account_id, workspace_id, false);
            }
        });
        self.restarts.set_timer(&timer_key, handle.abort_handle());
    }

    pub(crate) async fn handle_chats_upsert(&self, session: &Arc<Session>, chats: &[ChatUpsert]) {
        for chat in chats {
            let Some(chat_jid) = jid::normalize_address(&chat.id) else {
                continue;
            };
            let key = chat_jid.to_string();
            session.caches.merge_chat(&ChatUpsert {
                id: key.clone(),
                ..chat.clone()
            });
            // Chat names repair nameless leads that already exist.
            let name = chat
                .name
                .clone()
                .or_else(|| chat.subject.clone())
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());
            if let Some(name) = name {
                let phones: Vec<String> = jid::phone_candidate(&key).into_iter().collect();
                if let Err(err) = self
                    .store
                    .set_lead_name_where_missing(&session.workspace_id, &[key], &phones, &name)
                    .await
                {
                    warn!("Lead name sync from chat failed: {err}");
                }
            }
        }
    }

    pub(crate) async fn handle_contacts_upsert(
        self: &Arc<Self>,
        session: &Arc<Session>,
        contacts: &[ContactUpsert],
        initial: bool,
    ) {
        for contact in contacts {
            let ids = contact_ids(contact);
            if ids.is_empty() {
                continue;
            }
            for id in &ids {
                session.caches.merge_contact(id, contact);
                // A contact that now carries a picture invalidates any
                // cached lookup miss.
                if contact.avatar_url.as_deref().is_some_and(|u| !u.is_empty()) {
                    session.caches.forget_avatar(id);
                }
            }
            // Learn the address-form pairing when both sides are present.
            let lid_user = ids
                .iter()
                .filter_map(|id| id.strip_suffix("@lid"))
                .next();
            let pn_user = ids
                .iter()
                .filter_map(|id| id.strip_suffix("@s.whatsapp.net"))
                .next();
            if let (Some(lid), Some(pn)) = (lid_user, pn_user) {
                session.caches.map_addresses(lid, pn);
            }
            if let Some(name) = contact_name(contact) {
                let (wa_ids, phones) = expand_contact_ids(contact);
                match self
                    .store
                    .set_lead_name_where_missing(&session.workspace_id, &wa_ids, &phones, &name)
                    .await
                {
                    Ok(updated) if updated > 0 => {
                        debug!("Contact sync named {updated} leads ({name})")
                    }
                    Ok(_) => {}
                    Err(err) => warn!("Lead name sync from contact failed: {err}"),
                }
                self.sync_self_profile_from_contact(session, contact, &name)
                    .await;
            }
        }
        if initial && !contacts.is_empty() {
            // The post-pairing address book dump is the best moment to
            // repair names across the whole workspace.
            self.spawn_lead_name_backfill(session);
            self.spawn_sender_name_backfill(session);
        }
    }

    async fn sync_self_profile_from_contact(
        &self,
        session: &Arc<Session>,
        contact: &ContactUpsert,
        name: &str,
    ) {
        let Some(own_jid) = session.own().jid else {
            return;
        };
        let is_own = contact_ids(contact)
            .iter()
            .any(|id| id == &own_jid.to_string());
        if !is_own {
            return;
        }
        session.update_own(|own| {
            if own.name.is_none() {
                own.name = Some(name.to_string());
            }
        });
        if let Err(err) = self
            .store
            .update_account_profile(&session.account_id, Some(name), None)
            .await
        {
            warn!("Failed to sync own profile name: {err}");
        }
    }
}
