//! CRM persistence seam.
//!
//! [`CrmStore`] is the only way the bridge touches lead, conversation,
//! message and session rows. Every method returns [`StoreError`] so the
//! caller can tell transient outages (queue the message, flip
//! unavailable-mode) from fatal ones (drop and log).
//!
//! [`MemoryStore`] is a complete in-process implementation used by the
//! test suites; it mirrors the uniqueness and merge rules the production
//! store enforces with SQL constraints.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::StoreError;

/// Session rows carrying this error label are skipped by bootstrap; the
/// operator disconnected the account on purpose.
pub const MANUAL_DISCONNECT: &str = "manual_disconnect";

#[derive(Debug, Clone, Default)]
pub struct StoredIdentity {
    /// Canonical phone address of the paired device.
    pub number: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BootstrapAccount {
    pub account_id: String,
    pub workspace_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct LeadUpsert {
    pub workspace_id: String,
    /// Canonical chat address (phone identity or group id).
    pub wa_id: String,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone)]
pub struct ConversationUpsert {
    pub workspace_id: String,
    pub account_id: String,
    pub lead_id: String,
    pub channel: String,
    /// Chat address on the provider side.
    pub external_id: String,
    pub last_message_at: i64,
}

#[derive(Debug, Clone)]
pub struct ConversationRef {
    pub id: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MessageUpsert {
    pub workspace_id: String,
    pub conversation_id: String,
    /// Provider message id, unique per workspace.
    pub external_id: String,
    pub author: String,
    pub kind: String,
    pub text: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub timestamp_ms: i64,
    pub view_once: bool,
    pub quoted_external_id: Option<String>,
    pub quoted_sender_id: Option<String>,
    pub quoted_kind: Option<String>,
    pub quoted_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub author: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentInsert {
    pub workspace_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub storage_key: String,
    pub mimetype: Option<String>,
    pub file_name: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct LeadRef {
    pub id: String,
    pub wa_id: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SenderBackfillRow {
    pub id: String,
    pub sender_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub lead_wa_id: String,
    pub lead_phone: Option<String>,
}

#[async_trait]
pub trait CrmStore: Send + Sync {
    // Session lifecycle.
    async fn ensure_session_row(
        &self,
        account_id: &str,
        workspace_id: &str,
    ) -> Result<(), StoreError>;
    async fn load_auth(&self, account_id: &str) -> Result<Option<serde_json::Value>, StoreError>;
    async fn save_auth(&self, account_id: &str, auth: &serde_json::Value)
    -> Result<(), StoreError>;
    async fn mark_connecting(
        &self,
        account_id: &str,
        qr: Option<&str>,
        error_label: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn mark_connected(
        &self,
        account_id: &str,
        identity: &StoredIdentity,
    ) -> Result<(), StoreError>;
    async fn mark_disconnected(
        &self,
        account_id: &str,
        error_label: &str,
        clear_auth: bool,
    ) -> Result<(), StoreError>;
    async fn update_account_profile(
        &self,
        account_id: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), StoreError>;
    /// Accounts with stored credentials that should reconnect on process
    /// start. Excludes rows flagged with [`MANUAL_DISCONNECT`].
    async fn accounts_to_bootstrap(&self) -> Result<Vec<BootstrapAccount>, StoreError>;

    // History sync progress, shown in the CRM while a backlog replays.
    async fn sync_started(&self, account_id: &str) -> Result<(), StoreError>;
    async fn sync_progress(
        &self,
        account_id: &str,
        processed: u64,
        total: u64,
    ) -> Result<(), StoreError>;
    async fn sync_finished(&self, account_id: &str) -> Result<(), StoreError>;

    // Ingestion writes.
    async fn upsert_lead(&self, lead: &LeadUpsert) -> Result<String, StoreError>;
    async fn upsert_conversation(
        &self,
        conversation: &ConversationUpsert,
    ) -> Result<ConversationRef, StoreError>;
    async fn get_message(
        &self,
        workspace_id: &str,
        external_id: &str,
    ) -> Result<Option<MessageRow>, StoreError>;
    async fn upsert_message(&self, message: &MessageUpsert) -> Result<String, StoreError>;
    async fn has_attachment(&self, message_id: &str) -> Result<bool, StoreError>;
    async fn insert_attachment(&self, attachment: &AttachmentInsert) -> Result<String, StoreError>;

    // Backfill queries.
    async fn leads_missing_name(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<LeadRef>, StoreError>;
    async fn leads_missing_avatar(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<LeadRef>, StoreError>;
    async fn set_lead_name(&self, lead_id: &str, name: &str) -> Result<(), StoreError>;
    async fn set_lead_avatar(&self, lead_id: &str, avatar_url: &str) -> Result<(), StoreError>;
    /// Fill the name on every nameless lead matching any of the given
    /// addresses or phone digit strings. Returns affected row count.
    async fn set_lead_name_where_missing(
        &self,
        workspace_id: &str,
        wa_ids: &[String],
        phones: &[String],
        name: &str,
    ) -> Result<u64, StoreError>;
    async fn messages_missing_sender_name(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<SenderBackfillRow>, StoreError>;
    async fn messages_missing_sender_avatar(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<SenderBackfillRow>, StoreError>;
    async fn set_message_sender_name(
        &self,
        message_id: &str,
        name: &str,
    ) -> Result<(), StoreError>;
    async fn set_message_sender_avatar(
        &self,
        message_id: &str,
        avatar_url: &str,
    ) -> Result<(), StoreError>;
    async fn conversation_context(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationContext>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation.

#[derive(Debug, Clone, Default)]
pub struct AccountRecord {
    pub workspace_id: String,
    pub status: String,
    pub qr: Option<String>,
    pub last_error: Option<String>,
    pub auth: Option<serde_json::Value>,
    pub number: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub syncing: bool,
    pub sync_processed: u64,
    pub sync_total: u64,
    pub sync_progress_updates: u64,
    pub qr_updates: u64,
}

#[derive(Debug, Clone)]
pub struct LeadRecord {
    pub id: String,
    pub workspace_id: String,
    pub wa_id: String,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub workspace_id: String,
    pub account_id: String,
    pub lead_id: String,
    pub channel: String,
    pub external_id: String,
    pub last_message_at: i64,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: String,
    pub external_id: String,
    pub author: String,
    pub kind: String,
    pub text: String,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub timestamp_ms: i64,
    pub view_once: bool,
    pub quoted_external_id: Option<String>,
    pub quoted_sender_id: Option<String>,
    pub quoted_kind: Option<String>,
    pub quoted_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub id: String,
    pub message_id: String,
    pub storage_key: String,
    pub mimetype: Option<String>,
    pub size: u64,
}

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<String, AccountRecord>,
    leads: Vec<LeadRecord>,
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
    attachments: Vec<AttachmentRecord>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    next_id: AtomicU64,
    /// When set, every call fails with [`StoreError::Transient`]. Used to
    /// simulate a store outage.
    pub fail_transient: AtomicBool,
    /// Counts backfill query calls, so tests can tell one job run from
    /// two.
    pub backfill_scans: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_transient.load(Ordering::SeqCst) {
            Err(StoreError::Transient("store unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn make_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // Test accessors.

    pub fn account(&self, account_id: &str) -> Option<AccountRecord> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .get(account_id)
            .cloned()
    }

    pub fn leads(&self) -> Vec<LeadRecord> {
        self.inner.lock().unwrap().leads.clone()
    }

    pub fn lead_by_wa_id(&self, wa_id: &str) -> Option<LeadRecord> {
        self.inner
            .lock()
            .unwrap()
            .leads
            .iter()
            .find(|l| l.wa_id == wa_id)
            .cloned()
    }

    pub fn conversations(&self) -> Vec<ConversationRecord> {
        self.inner.lock().unwrap().conversations.clone()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn message_by_external_id(&self, external_id: &str) -> Option<MessageRecord> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.external_id == external_id)
            .cloned()
    }

    pub fn attachments(&self) -> Vec<AttachmentRecord> {
        self.inner.lock().unwrap().attachments.clone()
    }

    /// Seed a credentialed session row, as if a previous process had
    /// paired this account.
    pub fn seed_account(&self, account_id: &str, workspace_id: &str, auth: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.accounts.insert(
            account_id.to_string(),
            AccountRecord {
                workspace_id: workspace_id.to_string(),
                status: "disconnected".into(),
                auth: Some(auth),
                ..Default::default()
            },
        );
    }

    /// Overwrite one message's author, simulating a CRM-side agent send
    /// that raced the provider echo.
    pub fn set_message_author(&self, external_id: &str, author: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner
            .messages
            .iter_mut()
            .find(|m| m.external_id == external_id)
        {
            message.author = author.to_string();
        }
    }
}

#[async_trait]
impl CrmStore for MemoryStore {
    async fn ensure_session_row(
        &self,
        account_id: &str,
        workspace_id: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountRecord {
                workspace_id: workspace_id.to_string(),
                status: "disconnected".into(),
                ..Default::default()
            });
        Ok(())
    }

    async fn load_auth(&self, account_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .get(account_id)
            .and_then(|a| a.auth.clone()))
    }

    async fn save_auth(
        &self,
        account_id: &str,
        auth: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.auth = Some(auth.clone());
        }
        Ok(())
    }

    async fn mark_connecting(
        &self,
        account_id: &str,
        qr: Option<&str>,
        error_label: Option<&str>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.status = "connecting".into();
            account.qr = qr.map(str::to_string);
            account.last_error = error_label.map(str::to_string);
            if qr.is_some() {
                account.qr_updates += 1;
            }
        }
        Ok(())
    }

    async fn mark_connected(
        &self,
        account_id: &str,
        identity: &StoredIdentity,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.status = "connected".into();
            account.qr = None;
            account.last_error = None;
            account.number = Some(identity.number.clone());
            if let Some(name) = &identity.name {
                account.name = Some(name.clone());
            }
            if let Some(url) = &identity.avatar_url {
                account.avatar_url = Some(url.clone());
            }
        }
        Ok(())
    }

    async fn mark_disconnected(
        &self,
        account_id: &str,
        error_label: &str,
        clear_auth: bool,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.status = "disconnected".into();
            account.qr = None;
            account.last_error = Some(error_label.to_string());
            if clear_auth {
                account.auth = None;
            }
        }
        Ok(())
    }

    async fn update_account_profile(
        &self,
        account_id: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            if let Some(name) = name {
                account.name = Some(name.to_string());
            }
            if let Some(url) = avatar_url {
                account.avatar_url = Some(url.to_string());
            }
        }
        Ok(())
    }

    async fn accounts_to_bootstrap(&self) -> Result<Vec<BootstrapAccount>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<BootstrapAccount> = inner
            .accounts
            .iter()
            .filter(|(_, a)| {
                a.auth.is_some() && a.last_error.as_deref() != Some(MANUAL_DISCONNECT)
            })
            .map(|(id, a)| BootstrapAccount {
                account_id: id.clone(),
                workspace_id: a.workspace_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(out)
    }

    async fn sync_started(&self, account_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.syncing = true;
            account.sync_processed = 0;
            account.sync_total = 0;
        }
        Ok(())
    }

    async fn sync_progress(
        &self,
        account_id: &str,
        processed: u64,
        total: u64,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.sync_processed = processed;
            account.sync_total = total;
            account.sync_progress_updates += 1;
        }
        Ok(())
    }

    async fn sync_finished(&self, account_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(account) = inner.accounts.get_mut(account_id) {
            account.syncing = false;
        }
        Ok(())
    }

    async fn upsert_lead(&self, lead: &LeadUpsert) -> Result<String, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let found = inner.leads.iter_mut().find(|l| {
            l.workspace_id == lead.workspace_id
                && (l.wa_id == lead.wa_id
                    || (l.phone.is_some()
                        && non_empty(&lead.phone).is_some()
                        && l.phone == lead.phone))
        });
        if let Some(existing) = found {
            existing.wa_id = lead.wa_id.clone();
            if let Some(phone) = non_empty(&lead.phone) {
                existing.phone = Some(phone.to_string());
            }
            if let Some(name) = non_empty(&lead.name) {
                existing.name = Some(name.to_string());
            }
            if let Some(url) = non_empty(&lead.avatar_url) {
                existing.avatar_url = Some(url.to_string());
            }
            return Ok(existing.id.clone());
        }
        let id = self.make_id("lead");
        inner.leads.push(LeadRecord {
            id: id.clone(),
            workspace_id: lead.workspace_id.clone(),
            wa_id: lead.wa_id.clone(),
            phone: non_empty(&lead.phone).map(str::to_string),
            name: non_empty(&lead.name).map(str::to_string),
            avatar_url: non_empty(&lead.avatar_url).map(str::to_string),
            is_group: lead.is_group,
        });
        Ok(id)
    }

    async fn upsert_conversation(
        &self,
        conversation: &ConversationUpsert,
    ) -> Result<ConversationRef, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let found = inner.conversations.iter_mut().find(|c| {
            c.workspace_id == conversation.workspace_id
                && c.lead_id == conversation.lead_id
                && c.channel == conversation.channel
        });
        if let Some(existing) = found {
            existing.external_id = conversation.external_id.clone();
            if conversation.last_message_at > existing.last_message_at {
                existing.last_message_at = conversation.last_message_at;
            }
            return Ok(ConversationRef {
                id: existing.id.clone(),
                is_new: false,
            });
        }
        let id = self.make_id("conv");
        inner.conversations.push(ConversationRecord {
            id: id.clone(),
            workspace_id: conversation.workspace_id.clone(),
            account_id: conversation.account_id.clone(),
            lead_id: conversation.lead_id.clone(),
            channel: conversation.channel.clone(),
            external_id: conversation.external_id.clone(),
            last_message_at: conversation.last_message_at,
        });
        Ok(ConversationRef { id, is_new: true })
    }

    async fn get_message(
        &self,
        workspace_id: &str,
        external_id: &str,
    ) -> Result<Option<MessageRow>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .find(|m| m.workspace_id == workspace_id && m.external_id == external_id)
            .map(|m| MessageRow {
                id: m.id.clone(),
                author: m.author.clone(),
            }))
    }

    async fn upsert_message(&self, message: &MessageUpsert) -> Result<String, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let found = inner.messages.iter_mut().find(|m| {
            m.workspace_id == message.workspace_id && m.external_id == message.external_id
        });
        if let Some(existing) = found {
            existing.text = message.text.clone();
            existing.kind = message.kind.clone();
            // An agent-authored row keeps its attribution when the
            // provider echo of the same message arrives.
            if existing.author != crate::types::MessageAuthor::Agent.as_str() {
                existing.author = message.author.clone();
            }
            if let Some(name) = non_empty(&message.sender_name) {
                existing.sender_name = Some(name.to_string());
            }
            return Ok(existing.id.clone());
        }
        let id = self.make_id("msg");
        inner.messages.push(MessageRecord {
            id: id.clone(),
            workspace_id: message.workspace_id.clone(),
            conversation_id: message.conversation_id.clone(),
            external_id: message.external_id.clone(),
            author: message.author.clone(),
            kind: message.kind.clone(),
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: non_empty(&message.sender_name).map(str::to_string),
            sender_avatar_url: None,
            timestamp_ms: message.timestamp_ms,
            view_once: message.view_once,
            quoted_external_id: message.quoted_external_id.clone(),
            quoted_sender_id: message.quoted_sender_id.clone(),
            quoted_kind: message.quoted_kind.clone(),
            quoted_text: message.quoted_text.clone(),
        });
        Ok(id)
    }

    async fn has_attachment(&self, message_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.attachments.iter().any(|a| a.message_id == message_id))
    }

    async fn insert_attachment(&self, attachment: &AttachmentInsert) -> Result<String, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let id = self.make_id("att");
        inner.attachments.push(AttachmentRecord {
            id: id.clone(),
            message_id: attachment.message_id.clone(),
            storage_key: attachment.storage_key.clone(),
            mimetype: attachment.mimetype.clone(),
            size: attachment.size,
        });
        Ok(id)
    }

    async fn leads_missing_name(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<LeadRef>, StoreError> {
        self.check()?;
        self.backfill_scans.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .leads
            .iter()
            .filter(|l| l.workspace_id == workspace_id && non_empty(&l.name).is_none())
            .take(limit)
            .map(|l| LeadRef {
                id: l.id.clone(),
                wa_id: l.wa_id.clone(),
                phone: l.phone.clone(),
            })
            .collect())
    }

    async fn leads_missing_avatar(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<LeadRef>, StoreError> {
        self.check()?;
        self.backfill_scans.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .leads
            .iter()
            .filter(|l| l.workspace_id == workspace_id && non_empty(&l.avatar_url).is_none())
            .take(limit)
            .map(|l| LeadRef {
                id: l.id.clone(),
                wa_id: l.wa_id.clone(),
                phone: l.phone.clone(),
            })
            .collect())
    }

    async fn set_lead_name(&self, lead_id: &str, name: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(lead) = inner.leads.iter_mut().find(|l| l.id == lead_id) {
            lead.name = Some(name.to_string());
        }
        Ok(())
    }

    async fn set_lead_avatar(&self, lead_id: &str, avatar_url: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(lead) = inner.leads.iter_mut().find(|l| l.id == lead_id) {
            lead.avatar_url = Some(avatar_url.to_string());
        }
        Ok(())
    }

    async fn set_lead_name_where_missing(
        &self,
        workspace_id: &str,
        wa_ids: &[String],
        phones: &[String],
        name: &str,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let mut updated = 0;
        for lead in inner.leads.iter_mut().filter(|l| {
            l.workspace_id == workspace_id
                && non_empty(&l.name).is_none()
                && (wa_ids.contains(&l.wa_id)
                    || l.phone.as_ref().is_some_and(|p| phones.contains(p)))
        }) {
            lead.name = Some(name.to_string());
            updated += 1;
        }
        Ok(updated)
    }

    async fn messages_missing_sender_name(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<SenderBackfillRow>, StoreError> {
        self.check()?;
        self.backfill_scans.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.workspace_id == workspace_id
                    && m.sender_id.is_some()
                    && non_empty(&m.sender_name).is_none()
            })
            .take(limit)
            .map(|m| SenderBackfillRow {
                id: m.id.clone(),
                sender_id: m.sender_id.clone().unwrap_or_default(),
                conversation_id: m.conversation_id.clone(),
            })
            .collect())
    }

    async fn messages_missing_sender_avatar(
        &self,
        workspace_id: &str,
        limit: usize,
    ) -> Result<Vec<SenderBackfillRow>, StoreError> {
        self.check()?;
        self.backfill_scans.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.workspace_id == workspace_id
                    && m.sender_id.is_some()
                    && non_empty(&m.sender_avatar_url).is_none()
            })
            .take(limit)
            .map(|m| SenderBackfillRow {
                id: m.id.clone(),
                sender_id: m.sender_id.clone().unwrap_or_default(),
                conversation_id: m.conversation_id.clone(),
            })
            .collect())
    }

    async fn set_message_sender_name(
        &self,
        message_id: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.iter_mut().find(|m| m.id == message_id) {
            message.sender_name = Some(name.to_string());
        }
        Ok(())
    }

    async fn set_message_sender_avatar(
        &self,
        message_id: &str,
        avatar_url: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.iter_mut().find(|m| m.id == message_id) {
            message.sender_avatar_url = Some(avatar_url.to_string());
        }
        Ok(())
    }

    async fn conversation_context(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationContext>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        let Some(conversation) = inner.conversations.iter().find(|c| c.id == conversation_id)
        else {
            return Ok(None);
        };
        Ok(inner
            .leads
            .iter()
            .find(|l| l.id == conversation.lead_id)
            .map(|l| ConversationContext {
                lead_wa_id: l.wa_id.clone(),
                lead_phone: l.phone.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lead_upsert_merges_by_phone() {
        let store = MemoryStore::new();
        let first = store
            .upsert_lead(&LeadUpsert {
                workspace_id: "ws".into(),
                wa_id: "5511999999999".into(),
                phone: Some("5511999999999".into()),
                name: Some("Alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        // Same contact seen later under its canonical address.
        let second = store
            .upsert_lead(&LeadUpsert {
                workspace_id: "ws".into(),
                wa_id: "5511999999999@s.whatsapp.net".into(),
                phone: Some("5511999999999".into()),
                name: None,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first, second);
        let lead = store.lead_by_wa_id("5511999999999@s.whatsapp.net").unwrap();
        assert_eq!(lead.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_message_upsert_preserves_agent_author() {
        let store = MemoryStore::new();
        store
            .upsert_message(&MessageUpsert {
                workspace_id: "ws".into(),
                conversation_id: "c1".into(),
                external_id: "MSG1".into(),
                author: "agente".into(),
                kind: "text".into(),
                text: "hello from automation".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .upsert_message(&MessageUpsert {
                workspace_id: "ws".into(),
                conversation_id: "c1".into(),
                external_id: "MSG1".into(),
                author: "team".into(),
                kind: "text".into(),
                text: "hello from automation".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let row = store.message_by_external_id("MSG1").unwrap();
        assert_eq!(row.author, "agente");
    }

    #[tokio::test]
    async fn test_bootstrap_skips_manual_disconnect() {
        let store = MemoryStore::new();
        store.seed_account("acc-1", "ws", serde_json::json!({"creds": 1}));
        store.seed_account("acc-2", "ws", serde_json::json!({"creds": 2}));
        store
            .mark_disconnected("acc-2", MANUAL_DISCONNECT, false)
            .await
            .unwrap();
        let accounts = store.accounts_to_bootstrap().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id, "acc-1");
    }

    #[tokio::test]
    async fn test_fail_transient_flag() {
        let store = MemoryStore::new();
        store.fail_transient.store(true, Ordering::SeqCst);
        let err = store.load_auth("acc").await.unwrap_err();
        assert!(err.is_transient());
    }
}
