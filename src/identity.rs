//! Identity resolution on top of a live session.
//!
//! A human contact can show up under a phone identity, a device identity,
//! or bare digits, and the CRM must land all of them on one lead row.
//! Resolution is cache-first, then asks the socket, then gives up quietly;
//! a missing name or avatar is never an error, the backfill jobs retry
//! later.

use log::{debug, warn};

use crate::jid::{self, Jid};
use crate::session::Session;
use crate::types::{ContactUpsert, ConnectedUser, GroupMetadata, RawMessage};

/// Canonical identity of a lead derived from a chat address.
#[derive(Debug, Clone)]
pub struct LeadIdentity {
    pub wa_id: Jid,
    pub phone: Option<String>,
    pub is_group: bool,
}

impl Session {
    /// Device identity -> phone identity. Cache first, then the socket.
    pub async fn pn_for_lid(&self, lid: &Jid) -> Option<Jid> {
        if !lid.is_lid() {
            return None;
        }
        if let Some(user) = self.caches.pn_for_lid(&lid.user) {
            return Some(Jid::pn(user));
        }
        if let Some(phone) = self.caches.participant_phone(&lid.user) {
            self.caches.map_addresses(&lid.user, &phone);
            return Some(Jid::pn(phone));
        }
        let socket = self.socket()?;
        match socket.pn_for_lid(lid).await {
            Ok(Some(pn)) => {
                let pn = pn.normalized();
                self.caches.map_addresses(&lid.user, &pn.user);
                Some(pn)
            }
            Ok(None) => None,
            Err(err) => {
                debug!("pn lookup failed for {lid}: {err}");
                None
            }
        }
    }

    pub async fn lid_for_pn(&self, pn: &Jid) -> Option<Jid> {
        if !pn.is_pn() {
            return None;
        }
        if let Some(user) = self.caches.lid_for_pn(&pn.user) {
            return Some(Jid::lid(user));
        }
        let socket = self.socket()?;
        match socket.lid_for_pn(pn).await {
            Ok(Some(lid)) => {
                let lid = lid.normalized();
                self.caches.map_addresses(&lid.user, &pn.user);
                Some(lid)
            }
            Ok(None) => None,
            Err(err) => {
                debug!("lid lookup failed for {pn}: {err}");
                None
            }
        }
    }

    /// Map a chat address onto the lead identity it should be filed
    /// under. Device identities are bridged to their phone identity when
    /// possible so both address forms converge on one lead.
    pub async fn normalize_lead_identity(&self, raw: &Jid) -> LeadIdentity {
        let normalized = raw.normalized();
        if normalized.is_group() {
            return LeadIdentity {
                wa_id: normalized,
                phone: None,
                is_group: true,
            };
        }
        if normalized.is_lid() {
            if let Some(pn) = self.pn_for_lid(&normalized).await {
                let phone = jid::phone_candidate(&pn.to_string());
                return LeadIdentity {
                    wa_id: pn,
                    phone,
                    is_group: false,
                };
            }
            return LeadIdentity {
                wa_id: normalized,
                phone: None,
                is_group: false,
            };
        }
        let phone = jid::phone_candidate(&normalized.to_string());
        LeadIdentity {
            wa_id: normalized,
            phone,
            is_group: false,
        }
    }

    /// Whether an address refers to the paired device owner, under either
    /// address form.
    pub async fn is_self(&self, raw: &Jid) -> bool {
        let Some(own) = self.own().jid else {
            return false;
        };
        let candidate = raw.normalized();
        if candidate == own {
            return true;
        }
        if candidate.user == own.user {
            return true;
        }
        // Bridge one level across address forms.
        if candidate.is_lid() {
            if let Some(pn) = self.pn_for_lid(&candidate).await {
                return pn.user == own.user;
            }
        } else if candidate.is_pn() && own.is_lid() {
            if let Some(lid) = self.lid_for_pn(&candidate).await {
                return lid.user == own.user;
            }
        }
        false
    }

    /// Group metadata through the per-session TTL cache.
    pub async fn ensure_group_metadata(&self, group: &Jid, force: bool) -> Option<GroupMetadata> {
        if !group.is_group() {
            return None;
        }
        let key = group.to_string();
        if !force {
            if let Some(metadata) = self.caches.group_meta(&key, self.config.group_meta_ttl) {
                return Some(metadata);
            }
        }
        let socket = self.socket()?;
        match socket.group_metadata(group).await {
            Ok(metadata) => {
                self.caches.store_group_meta(metadata.clone());
                Some(metadata)
            }
            Err(err) => {
                warn!("Group metadata fetch failed for {group}: {err}");
                None
            }
        }
    }

    /// Fetch an avatar for a chat or contact. Failed lookups for plain
    /// phone identities are cached negatively so a chatty contact does
    /// not trigger a lookup per message; `force` bypasses both cache
    /// directions.
    pub async fn resolve_avatar(&self, target: &Jid, force: bool) -> Option<String> {
        let jid = target.normalized();
        let key = jid.to_string();
        if !force {
            if let Some(cached) = self.caches.cached_avatar(&key) {
                return cached;
            }
        }
        let socket = self.socket()?;
        // Some peers only expose their picture after a privacy token
        // exchange; failures here are common and harmless.
        let _ = socket.request_privacy_token(&jid).await;
        let mut url = match socket.profile_picture_url(&jid, false).await {
            Ok(url) => url,
            Err(err) => {
                debug!("Avatar fetch failed for {jid}: {err}");
                None
            }
        };
        if url.is_none() {
            url = socket.profile_picture_url(&jid, true).await.ok().flatten();
        }
        match &url {
            Some(found) => {
                self.caches.store_avatar(&key, Some(found.clone()));
                self.caches.set_chat_avatar(&key, found);
            }
            None => {
                if !force && !jid.is_lid() && !jid.is_group() {
                    self.caches.store_avatar(&key, None);
                }
            }
        }
        url
    }

    /// Best display name for a chat. Precedence: cached chat name, group
    /// subject, contact record (under either address form), then the
    /// message's push name unless it would echo the device owner back.
    pub async fn resolve_chat_name(&self, chat: &Jid, message: Option<&RawMessage>) -> Option<String> {
        let key = chat.to_string();
        if let Some(meta) = self.caches.chat(&key) {
            if let Some(name) = trimmed(meta.name) {
                return Some(name);
            }
        }
        if chat.is_group() {
            if let Some(metadata) = self.ensure_group_metadata(chat, false).await {
                if let Some(subject) = trimmed(metadata.subject) {
                    self.caches.set_chat_name(&key, &subject);
                    return Some(subject);
                }
            }
            return None;
        }
        if let Some(name) = self.contact_name_for(chat).await {
            return Some(name);
        }
        if let Some(message) = message {
            if !message.key.from_me {
                if let Some(push) = trimmed(message.push_name.clone()) {
                    if !self.is_own_name(&push) {
                        return Some(push);
                    }
                }
            }
        }
        None
    }

    /// Contact record lookup bridging both address forms.
    pub async fn contact_name_for(&self, jid: &Jid) -> Option<String> {
        let normalized = jid.normalized();
        if let Some(contact) = self.caches.contact(&normalized.to_string()) {
            if let Some(name) = contact_name(&contact) {
                return Some(name);
            }
        }
        let alias = if normalized.is_lid() {
            self.pn_for_lid(&normalized).await
        } else if normalized.is_pn() {
            self.lid_for_pn(&normalized).await
        } else {
            None
        };
        let alias = alias?;
        let contact = self.caches.contact(&alias.to_string())?;
        contact_name(&contact)
    }

    /// Name for a group participant, used on message rows.
    pub async fn resolve_participant_name(
        &self,
        participant: &Jid,
        message: Option<&RawMessage>,
    ) -> Option<String> {
        if let Some(name) = self.contact_name_for(participant).await {
            return Some(name);
        }
        if let Some(message) = message {
            if !message.key.from_me {
                if let Some(push) = trimmed(message.push_name.clone()) {
                    if !self.is_own_name(&push) {
                        return Some(push);
                    }
                }
            }
        }
        None
    }

    fn is_own_name(&self, candidate: &str) -> bool {
        self.own()
            .name
            .as_deref()
            .is_some_and(|own| own.trim().eq_ignore_ascii_case(candidate.trim()))
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Best display name from a contact record: address book name first, then
/// the self-assigned push name, then the business-verified name.
pub fn contact_name(contact: &ContactUpsert) -> Option<String> {
    trimmed(contact.name.clone())
        .or_else(|| trimmed(contact.notify.clone()))
        .or_else(|| trimmed(contact.verified_name.clone()))
}

/// Every address a contact record is known by.
pub fn contact_ids(contact: &ContactUpsert) -> Vec<String> {
    let mut ids = Vec::new();
    for raw in [Some(&contact.id), contact.lid.as_ref()]
        .into_iter()
        .flatten()
    {
        if let Some(jid) = jid::normalize_address(raw) {
            let id = jid.to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if let Some(phone) = &contact.phone_number {
        if let Some(jid) = jid::normalize_address(phone) {
            let id = jid.to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Addresses and bare digit strings a contact can match leads by.
pub fn expand_contact_ids(contact: &ContactUpsert) -> (Vec<String>, Vec<String>) {
    let ids = contact_ids(contact);
    let mut phones = Vec::new();
    for id in &ids {
        if let Some(phone) = jid::phone_candidate(id) {
            if !phones.contains(&phone) {
                phones.push(phone);
            }
        }
    }
    if let Some(phone) = contact
        .phone_number
        .as_deref()
        .and_then(jid::phone_candidate)
    {
        if !phones.contains(&phone) {
            phones.push(phone);
        }
    }
    (ids, phones)
}

/// Display name for the device owner from the open event.
pub fn own_name_from_user(user: &ConnectedUser) -> Option<String> {
    trimmed(user.name.clone())
        .or_else(|| trimmed(user.verified_name.clone()))
        .or_else(|| trimmed(user.notify.clone()))
}
