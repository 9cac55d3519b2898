//! Message ingestion: from a raw socket envelope to lead, conversation,
//! message and attachment rows, plus the realtime and webhook side
//! effects.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::Bridge;
use crate::error::IngestError;
use crate::jid::Jid;
use crate::notify::AgentNotification;
use crate::realtime::{emit_attachment_created, emit_conversation_updated, emit_message_created};
use crate::session::Session;
use crate::storage::build_storage_key;
use crate::store::{AttachmentInsert, ConversationUpsert, LeadUpsert, MessageUpsert};
use crate::types::{
    ContextInfo, EnvelopeContent, MediaRef, MessageAuthor, MessageKind, MessageSource, RawMessage,
};

/// Persisted in place of any view-once content.
pub const VIEW_ONCE_PLACEHOLDER: &str = "View this content in WhatsApp on your phone";

const CHANNEL: &str = "whatsapp";

/// Peel wrapper variants off a content node, reporting whether any
/// view-once layer was crossed.
pub fn unwrap_content(content: &EnvelopeContent, max_depth: usize) -> (&EnvelopeContent, bool) {
    let mut current = content;
    let mut view_once = false;
    for _ in 0..max_depth {
        current = match current {
            EnvelopeContent::Ephemeral(inner)
            | EnvelopeContent::DocumentWithCaption(inner)
            | EnvelopeContent::Edited(inner) => inner,
            EnvelopeContent::ViewOnce(inner)
            | EnvelopeContent::ViewOnceV2(inner)
            | EnvelopeContent::ViewOnceV2Extension(inner) => {
                view_once = true;
                inner
            }
            other => return (other, view_once),
        };
    }
    (current, view_once)
}

/// Classify a (already unwrapped) content node into the persisted kind,
/// display text and optional media reference.
pub fn classify(content: &EnvelopeContent) -> (MessageKind, String, Option<&MediaRef>) {
    match content {
        EnvelopeContent::Text { text, .. } => (MessageKind::Text, text.clone(), None),
        EnvelopeContent::Image { caption, media, .. } => (
            MessageKind::Image,
            caption.clone().unwrap_or_else(|| "Image received".into()),
            Some(media),
        ),
        EnvelopeContent::Video { caption, media, .. } => (
            MessageKind::Video,
            caption.clone().unwrap_or_else(|| "Video received".into()),
            Some(media),
        ),
        EnvelopeContent::Document { media, .. } => (
            MessageKind::Document,
            media
                .file_name
                .clone()
                .unwrap_or_else(|| "Document received".into()),
            Some(media),
        ),
        EnvelopeContent::Audio { media, .. } => {
            (MessageKind::Audio, "Audio message".into(), Some(media))
        }
        EnvelopeContent::Sticker { media, .. } => (MessageKind::Sticker, "Sticker".into(), Some(media)),
        _ => (MessageKind::Text, "Message received".into(), None),
    }
}

pub fn context_of(content: &EnvelopeContent) -> Option<&ContextInfo> {
    match content {
        EnvelopeContent::Text { context, .. }
        | EnvelopeContent::Image { context, .. }
        | EnvelopeContent::Video { context, .. }
        | EnvelopeContent::Document { context, .. }
        | EnvelopeContent::Audio { context, .. }
        | EnvelopeContent::Sticker { context, .. } => context.as_ref(),
        _ => None,
    }
}

impl Bridge {
    /// Ingest one message. `queue_on_store_fail` is true for socket
    /// traffic and false for retry-queue replays; it decides whether a
    /// transient store failure parks the message or propagates.
    pub async fn process_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message: RawMessage,
        source: MessageSource,
        queue_on_store_fail: bool,
    ) -> Result<(), IngestError> {
        let chat = message.key.remote_jid.normalized();
        if chat.user.is_empty() || message.key.id.is_empty() {
            return Ok(());
        }
        if chat.is_broadcast() {
            return Ok(());
        }
        if session.is_blocked() {
            debug!("Dropping message for blocked account {}", session.account_id);
            return Ok(());
        }
        let can_queue = queue_on_store_fail && self.retry_queue.enabled();
        if can_queue && self.retry_queue.is_unavailable() {
            self.retry_queue
                .enqueue(&session.account_id, source, message)
                .await;
            return Ok(());
        }
        let started = Instant::now();
        let result = self.ingest(session, &message, source).await;
        let elapsed = started.elapsed();
        if elapsed.as_secs() >= 1 {
            warn!(
                "Slow ingestion ({elapsed:?}) for message {} on account {}",
                message.key.id, session.account_id
            );
        }
        match result {
            Err(err) if err.is_transient_store() && can_queue => {
                warn!(
                    "Store unavailable; queueing message {} for account {}: {err}",
                    message.key.id, session.account_id
                );
                self.retry_queue.mark_unavailable();
                self.retry_queue
                    .enqueue(&session.account_id, source, message)
                    .await;
                Ok(())
            }
            other => other,
        }
    }

    async fn ingest(
        self: &Arc<Self>,
        session: &Arc<Session>,
        message: &RawMessage,
        source: MessageSource,
    ) -> Result<(), IngestError> {
        let Some(content) = &message.content else {
            return Ok(());
        };
        let chat = message.key.remote_jid.normalized();
        let (inner, view_once) = unwrap_content(content, session.config.unwrap_depth);
        let (kind, raw_text, media) = classify(inner);
        let context = context_of(inner);
        let timestamp_ms = message.timestamp_ms();

        let lead = session.normalize_lead_identity(&chat).await;
        let chat_name = session.resolve_chat_name(&chat, Some(message)).await;
        let avatar = session.resolve_avatar(&lead.wa_id, false).await;

        let lead_id = self
            .store
            .upsert_lead(&LeadUpsert {
                workspace_id: session.workspace_id.clone(),
                wa_id: lead.wa_id.to_string(),
                phone: lead.phone.clone(),
                name: chat_name.clone(),
                avatar_url: avatar,
                is_group: lead.is_group,
            })
            .await?;
        let conversation = self
            .store
            .upsert_conversation(&ConversationUpsert {
                workspace_id: session.workspace_id.clone(),
                account_id: session.account_id.clone(),
                lead_id: lead_id.clone(),
                channel: CHANNEL.into(),
                external_id: chat.to_string(),
                last_message_at: timestamp_ms,
            })
            .await?;

        let (kind, text) = if view_once {
            (MessageKind::ViewOnce, VIEW_ONCE_PLACEHOLDER.to_string())
        } else {
            let mentions = context.map(|c| c.mentioned.as_slice()).unwrap_or(&[]);
            (kind, self.rewrite_mentions(session, raw_text, mentions).await)
        };
        let author = if message.key.from_me {
            MessageAuthor::Team
        } else {
            MessageAuthor::Contact
        };
        let sender_jid: Option<Jid> = if lead.is_group {
            message.key.participant.as_ref().map(|j| j.normalized())
        } else if message.key.from_me {
            session.own().jid
        } else {
            Some(lead.wa_id.clone())
        };
        let sender_name = if message.key.from_me {
            session.own().name
        } else if lead.is_group {
            match &sender_jid {
                Some(sender) => {
                    // Own traffic from another paired device: never let
                    // the push name shadow the owner's profile name.
                    if session.is_self(sender).await {
                        session.own().name
                    } else {
                        session.resolve_participant_name(sender, Some(message)).await
                    }
                }
                None => None,
            }
        } else {
            chat_name.clone()
        };

        let is_new_message = self
            .store
            .get_message(&session.workspace_id, &message.key.id)
            .await?
            .is_none();
        let (quoted_external_id, quoted_sender_id, quoted_kind, quoted_text) = match context {
            Some(ctx) => {
                let (quoted_kind, quoted_text) = match &ctx.quoted {
                    Some(quoted) => {
                        let (inner, quoted_view_once) =
                            unwrap_content(quoted, session.config.unwrap_depth);
                        let (kind, text, _) = classify(inner);
                        if quoted_view_once {
                            (Some(MessageKind::ViewOnce), Some(VIEW_ONCE_PLACEHOLDER.into()))
                        } else {
                            (Some(kind), Some(text))
                        }
                    }
                    None => (None, None),
                };
                let quoted_sender = match &ctx.participant {
                    Some(participant) => {
                        let normalized = participant.normalized();
                        // Same bridging as the message sender: a device
                        // identity maps to its phone identity when known.
                        let bridged = session.pn_for_lid(&normalized).await;
                        Some(bridged.unwrap_or(normalized).to_string())
                    }
                    None => None,
                };
                (
                    ctx.stanza_id.clone(),
                    quoted_sender,
                    quoted_kind.map(|k| k.as_str().to_string()),
                    quoted_text,
                )
            }
            None => (None, None, None, None),
        };
        let message_row_id = self
            .store
            .upsert_message(&MessageUpsert {
                workspace_id: session.workspace_id.clone(),
                conversation_id: conversation.id.clone(),
                external_id: message.key.id.clone(),
                author: author.as_str().into(),
                kind: kind.as_str().into(),
                text: text.clone(),
                sender_id: sender_jid.map(|j| j.to_string()),
                sender_name: sender_name.clone(),
                timestamp_ms,
                view_once,
                quoted_external_id,
                quoted_sender_id,
                quoted_kind,
                quoted_text,
            })
            .await?;

        let is_recent =
            Utc::now().timestamp_millis() - timestamp_ms
                <= self.config.realtime_recency_window.as_millis() as i64;
        let eligible = source == MessageSource::Live;
        if eligible && is_new_message {
            emit_message_created(
                self.realtime.as_ref(),
                &session.workspace_id,
                &conversation.id,
                serde_json::json!({
                    "id": message_row_id,
                    "external_id": message.key.id,
                    "conversation_id": conversation.id,
                    "author": author.as_str(),
                    "kind": kind.as_str(),
                    "text": text,
                    "sender_name": sender_name,
                    "timestamp": timestamp_ms,
                }),
            )
            .await;
        }
        if eligible || (source == MessageSource::History && conversation.is_new) {
            emit_conversation_updated(
                self.realtime.as_ref(),
                &session.workspace_id,
                serde_json::json!({
                    "conversation_id": conversation.id,
                    "lead_id": lead_id,
                    "last_message_at": timestamp_ms,
                    "is_new": conversation.is_new,
                }),
            )
            .await;
        }
        // Redeliveries of a known provider id must not re-trigger
        // automations.
        if eligible && is_new_message && is_recent && author == MessageAuthor::Contact {
            let notifier = self.notifier.clone();
            let notification = AgentNotification {
                workspace_id: session.workspace_id.clone(),
                account_id: session.account_id.clone(),
                conversation_id: conversation.id.clone(),
                message_id: message_row_id.clone(),
                message_external_id: message.key.id.clone(),
                text: text.clone(),
                is_group: lead.is_group,
            };
            tokio::spawn(async move {
                notifier.notify(notification).await;
            });
        }

        if !view_once {
            if let Some(media) = media {
                self.persist_media(session, &conversation.id, &message_row_id, media, eligible)
                    .await?;
            }
        }
        if is_new_message {
            debug!(
                "Stored {} message {} in conversation {}",
                source.as_str(),
                message.key.id,
                conversation.id
            );
        }
        Ok(())
    }

    async fn persist_media(
        self: &Arc<Self>,
        session: &Arc<Session>,
        conversation_id: &str,
        message_row_id: &str,
        media: &MediaRef,
        eligible: bool,
    ) -> Result<(), IngestError> {
        if self.store.has_attachment(message_row_id).await? {
            return Ok(());
        }
        let Some(socket) = session.socket() else {
            return Err(IngestError::Media(crate::error::SocketError::NotAvailable));
        };
        let bytes = socket
            .download_media(media)
            .await
            .map_err(IngestError::Media)?;
        let size = bytes.len() as u64;
        let key = build_storage_key(
            &session.workspace_id,
            conversation_id,
            message_row_id,
            media.file_name.as_deref(),
            media.mimetype.as_deref(),
        );
        self.storage
            .put(&key, bytes, media.mimetype.as_deref())
            .await
            .map_err(IngestError::Store)?;
        let attachment_id = self
            .store
            .insert_attachment(&AttachmentInsert {
                workspace_id: session.workspace_id.clone(),
                conversation_id: conversation_id.to_string(),
                message_id: message_row_id.to_string(),
                storage_key: key.clone(),
                mimetype: media.mimetype.clone(),
                file_name: media.file_name.clone(),
                size,
            })
            .await?;
        if eligible {
            emit_attachment_created(
                self.realtime.as_ref(),
                conversation_id,
                serde_json::json!({
                    "id": attachment_id,
                    "message_id": message_row_id,
                    "conversation_id": conversation_id,
                    "storage_key": key,
                    "mimetype": media.mimetype,
                    "size": size,
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Replace `@<digits>` mentions with `@<Name>` where the mentioned
    /// contact resolves to a display name.
    async fn rewrite_mentions(
        &self,
        session: &Arc<Session>,
        mut text: String,
        mentioned: &[String],
    ) -> String {
        for raw in mentioned {
            let Some(jid) = crate::jid::normalize_address(raw) else {
                continue;
            };
            let token = format!("@{}", jid.user);
            if !text.contains(&token) {
                continue;
            }
            if let Some(name) = session.contact_name_for(&jid).await {
                text = text.replace(&token, &format!("@{name}"));
            }
        }
        text
    }

    /// Replay a history batch: drop stale messages, oldest first, with
    /// periodic progress updates so the CRM can show a sync bar.
    pub(crate) async fn handle_history(
        self: &Arc<Self>,
        session: &Arc<Session>,
        messages: Vec<RawMessage>,
    ) {
        let cutoff =
            Utc::now().timestamp_millis() - self.config.history_cutoff_days * 24 * 3600 * 1000;
        let mut messages: Vec<RawMessage> = messages
            .into_iter()
            .filter(|m| m.timestamp_ms() >= cutoff)
            .collect();
        messages.sort_by_key(|m| m.timestamp_ms());
        if messages.is_empty() {
            return;
        }
        let total = messages.len() as u64;
        info!(
            "Replaying {total} history messages for account {}",
            session.account_id
        );
        if let Err(err) = self.store.sync_started(&session.account_id).await {
            warn!("Failed to mark sync start: {err}");
        }
        let mut processed = 0u64;
        let mut seen_chats = std::collections::HashSet::new();
        for message in messages {
            let chat = message.key.remote_jid.normalized().to_string();
            let first_touch = seen_chats.insert(chat);
            if first_touch || processed % 50 == 0 {
                if let Err(err) = self
                    .store
                    .sync_progress(&session.account_id, processed, total)
                    .await
                {
                    warn!("Failed to record sync progress: {err}");
                }
            }
            let id = message.key.id.clone();
            if let Err(err) = self
                .process_message(session, message, MessageSource::History, true)
                .await
            {
                error!(
                    "Failed to replay history message {id} for {}: {err}",
                    session.account_id
                );
            }
            processed += 1;
        }
        if let Err(err) = self
            .store
            .sync_progress(&session.account_id, processed, total)
            .await
        {
            warn!("Failed to record final sync progress: {err}");
        }
        if let Err(err) = self.store.sync_finished(&session.account_id).await {
            warn!("Failed to mark sync finished: {err}");
        }
        info!(
            "History replay finished for account {} ({processed} messages)",
            session.account_id
        );
    }
}
