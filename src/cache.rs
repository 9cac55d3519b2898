//! Per-session metadata caches.
//!
//! Each live session keeps its own view of chat names, contact records,
//! avatar lookups and the two-way address mapping. Everything here is
//! best-effort: a cold cache only costs extra socket round-trips.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::types::{ChatUpsert, ContactUpsert, GroupMetadata};

#[derive(Debug, Clone, Default)]
pub struct ChatMeta {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

struct GroupMetaEntry {
    metadata: GroupMetadata,
    fetched_at: Instant,
}

#[derive(Default)]
pub struct SessionCaches {
    chats: DashMap<String, ChatMeta>,
    contacts: DashMap<String, ContactUpsert>,
    /// `None` is a negative entry: the lookup failed and should not be
    /// retried until a forced refresh.
    avatars: DashMap<String, Option<String>>,
    /// Device-identity user -> phone digits, filled from group metadata.
    participant_phones: DashMap<String, String>,
    group_meta: DashMap<String, GroupMetaEntry>,
    lid_to_pn: DashMap<String, String>,
    pn_to_lid: DashMap<String, String>,
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

impl SessionCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a chat upsert, never clobbering a known value with an empty
    /// one.
    pub fn merge_chat(&self, chat: &ChatUpsert) {
        let mut entry = self.chats.entry(chat.id.clone()).or_default();
        let name = chat.name.clone().or_else(|| chat.subject.clone());
        if non_empty(&name) {
            entry.name = name;
        }
        if non_empty(&chat.avatar_url) {
            entry.avatar_url = chat.avatar_url.clone();
        }
    }

    pub fn set_chat_name(&self, id: &str, name: &str) {
        if name.trim().is_empty() {
            return;
        }
        self.chats.entry(id.to_string()).or_default().name = Some(name.to_string());
    }

    pub fn set_chat_avatar(&self, id: &str, url: &str) {
        if url.trim().is_empty() {
            return;
        }
        self.chats.entry(id.to_string()).or_default().avatar_url = Some(url.to_string());
    }

    pub fn chat(&self, id: &str) -> Option<ChatMeta> {
        self.chats.get(id).map(|entry| entry.clone())
    }

    /// Merge a contact under every id it is known by, keeping existing
    /// field values when the upsert carries nothing better.
    pub fn merge_contact(&self, key: &str, contact: &ContactUpsert) {
        let mut guard = self.contacts.entry(key.to_string()).or_default();
        let entry = guard.value_mut();
        if entry.id.is_empty() {
            entry.id = contact.id.clone();
        }
        for (slot, incoming) in [
            (&mut entry.lid, &contact.lid),
            (&mut entry.phone_number, &contact.phone_number),
            (&mut entry.name, &contact.name),
            (&mut entry.notify, &contact.notify),
            (&mut entry.verified_name, &contact.verified_name),
            (&mut entry.avatar_url, &contact.avatar_url),
        ] {
            if non_empty(incoming) {
                *slot = incoming.clone();
            }
        }
    }

    pub fn contact(&self, key: &str) -> Option<ContactUpsert> {
        self.contacts.get(key).map(|entry| entry.clone())
    }

    pub fn cached_avatar(&self, key: &str) -> Option<Option<String>> {
        self.avatars.get(key).map(|entry| entry.clone())
    }

    pub fn store_avatar(&self, key: &str, url: Option<String>) {
        self.avatars.insert(key.to_string(), url);
    }

    pub fn forget_avatar(&self, key: &str) {
        self.avatars.remove(key);
    }

    pub fn participant_phone(&self, lid_user: &str) -> Option<String> {
        self.participant_phones
            .get(lid_user)
            .map(|entry| entry.clone())
    }

    pub fn map_addresses(&self, lid_user: &str, pn_user: &str) {
        if lid_user.is_empty() || pn_user.is_empty() {
            return;
        }
        self.lid_to_pn
            .insert(lid_user.to_string(), pn_user.to_string());
        self.pn_to_lid
            .insert(pn_user.to_string(), lid_user.to_string());
    }

    pub fn pn_for_lid(&self, lid_user: &str) -> Option<String> {
        self.lid_to_pn.get(lid_user).map(|entry| entry.clone())
    }

    pub fn lid_for_pn(&self, pn_user: &str) -> Option<String> {
        self.pn_to_lid.get(pn_user).map(|entry| entry.clone())
    }

    /// Group metadata if present and younger than `ttl`.
    pub fn group_meta(&self, group_id: &str, ttl: Duration) -> Option<GroupMetadata> {
        let entry = self.group_meta.get(group_id)?;
        if entry.fetched_at.elapsed() > ttl {
            return None;
        }
        Some(entry.metadata.clone())
    }

    /// Cache fresh group metadata and index every participant's phone
    /// digits under their device identity.
    pub fn store_group_meta(&self, metadata: GroupMetadata) {
        for participant in &metadata.participants {
            if let (Some(lid), Some(phone)) = (&participant.lid, &participant.phone_number) {
                let lid_user = lid.split('@').next().unwrap_or(lid);
                let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
                if !lid_user.is_empty() && !digits.is_empty() {
                    self.participant_phones
                        .insert(lid_user.to_string(), digits.clone());
                    self.map_addresses(lid_user, &digits);
                }
            }
        }
        self.group_meta.insert(
            metadata.id.clone(),
            GroupMetaEntry {
                metadata,
                fetched_at: Instant::now(),
            },
        );
    }
}
