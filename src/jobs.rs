//! Background backfill jobs.
//!
//! Each connected session gets three staggered jobs: lead names, message
//! sender names and avatars. Jobs are per-session, guarded by a running
//! flag so overlapping triggers collapse into one pass, and they bail out
//! as soon as the session is no longer connected.

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::bridge::Bridge;
use crate::jid;
use crate::session::{JobFlag, Session};

const MAX_LEAD_NAME_ROUNDS: usize = 25;

#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillReport {
    pub scanned: usize,
    pub updated: usize,
}

fn try_begin(flag: &JobFlag) -> bool {
    !flag.running.swap(true, Ordering::SeqCst)
}

impl Bridge {
    /// Arm the three post-connect jobs with their staggered delays. Each
    /// is scheduled at most once per connect.
    pub(crate) fn schedule_backfills(self: &Arc<Self>, session: &Arc<Session>) {
        let [avatar_delay, lead_delay, sender_delay] = self.config.job_stagger;
        if !session.jobs.avatars.scheduled.swap(true, Ordering::SeqCst) {
            let bridge = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(avatar_delay).await;
                session.jobs.avatars.scheduled.store(false, Ordering::SeqCst);
                if let Err(err) = bridge.backfill_avatars(&session).await {
                    warn!("Avatar backfill failed for {}: {err}", session.account_id);
                }
            });
        }
        if !session.jobs.lead_names.scheduled.swap(true, Ordering::SeqCst) {
            let bridge = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(lead_delay).await;
                session
                    .jobs
                    .lead_names
                    .scheduled
                    .store(false, Ordering::SeqCst);
                if let Err(err) = bridge.backfill_lead_names(&session).await {
                    warn!("Lead name backfill failed for {}: {err}", session.account_id);
                }
            });
        }
        if !session.jobs.sender_names.scheduled.swap(true, Ordering::SeqCst) {
            let bridge = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(sender_delay).await;
                session
                    .jobs
                    .sender_names
                    .scheduled
                    .store(false, Ordering::SeqCst);
                if let Err(err) = bridge.backfill_sender_names(&session).await {
                    warn!(
                        "Sender name backfill failed for {}: {err}",
                        session.account_id
                    );
                }
            });
        }
    }

    /// Immediate (unstaggered) trigger, used after the initial address
    /// book dump lands.
    pub(crate) fn spawn_lead_name_backfill(self: &Arc<Self>, session: &Arc<Session>) {
        let bridge = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge.backfill_lead_names(&session).await {
                warn!("Lead name backfill failed for {}: {err}", session.account_id);
            }
        });
    }

    pub(crate) fn spawn_sender_name_backfill(self: &Arc<Self>, session: &Arc<Session>) {
        let bridge = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(err) = bridge.backfill_sender_names(&session).await {
                warn!(
                    "Sender name backfill failed for {}: {err}",
                    session.account_id
                );
            }
        });
    }

    /// Fill names on nameless leads from caches, contacts and group
    /// subjects. Runs in rounds until a round makes no progress.
    pub async fn backfill_lead_names(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> anyhow::Result<BackfillReport> {
        if !session.is_connected() || !try_begin(&session.jobs.lead_names) {
            return Ok(BackfillReport::default());
        }
        let _guard = scopeguard::guard((), |_| {
            session.jobs.lead_names.running.store(false, Ordering::SeqCst);
        });
        let mut report = BackfillReport::default();
        for round in 0..MAX_LEAD_NAME_ROUNDS {
            if !session.is_connected() {
                break;
            }
            let leads = self
                .store
                .leads_missing_name(&session.workspace_id, self.config.backfill_lead_limit)
                .await?;
            if leads.is_empty() {
                break;
            }
            let mut progressed = 0usize;
            for lead in &leads {
                report.scanned += 1;
                let Some(lead_jid) = jid::normalize_address(&lead.wa_id) else {
                    continue;
                };
                if let Some(name) = session.resolve_chat_name(&lead_jid, None).await {
                    self.store.set_lead_name(&lead.id, &name).await?;
                    progressed += 1;
                    report.updated += 1;
                }
            }
            debug!(
                "Lead name backfill round {round}: {progressed}/{} named",
                leads.len()
            );
            if progressed == 0 {
                break;
            }
        }
        if report.updated > 0 {
            info!(
                "Lead name backfill for {}: {} of {} leads named",
                session.account_id, report.updated, report.scanned
            );
        }
        Ok(report)
    }

    /// Fill sender names on group message rows that were persisted before
    /// the sender's contact record was known.
    pub async fn backfill_sender_names(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> anyhow::Result<BackfillReport> {
        if !session.is_connected() || !try_begin(&session.jobs.sender_names) {
            return Ok(BackfillReport::default());
        }
        let _guard = scopeguard::guard((), |_| {
            session
                .jobs
                .sender_names
                .running
                .store(false, Ordering::SeqCst);
        });
        let mut report = BackfillReport::default();
        let rows = self
            .store
            .messages_missing_sender_name(&session.workspace_id, self.config.backfill_message_limit)
            .await?;
        for row in rows {
            report.scanned += 1;
            let Some(sender) = jid::normalize_address(&row.sender_id) else {
                continue;
            };
            let mut name = session.contact_name_for(&sender).await;
            if name.is_none() {
                // Direct chats: the sender is the lead itself.
                if let Some(context) = self.store.conversation_context(&row.conversation_id).await?
                {
                    if context.lead_wa_id == sender.to_string() {
                        name = session.resolve_chat_name(&sender, None).await;
                    }
                }
            }
            if let Some(name) = name {
                self.store.set_message_sender_name(&row.id, &name).await?;
                report.updated += 1;
            }
        }
        if report.updated > 0 {
            info!(
                "Sender name backfill for {}: {} of {} messages named",
                session.account_id, report.updated, report.scanned
            );
        }
        Ok(report)
    }

    /// Fetch avatars for leads and message senders that have none yet.
    /// Forced lookups, so negative cache entries do not stick.
    pub async fn backfill_avatars(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> anyhow::Result<BackfillReport> {
        if !session.is_connected() || !try_begin(&session.jobs.avatars) {
            return Ok(BackfillReport::default());
        }
        let _guard = scopeguard::guard((), |_| {
            session.jobs.avatars.running.store(false, Ordering::SeqCst);
        });
        let mut report = BackfillReport::default();
        let leads = self
            .store
            .leads_missing_avatar(&session.workspace_id, self.config.backfill_lead_limit)
            .await?;
        for lead in leads {
            if !session.is_connected() {
                break;
            }
            report.scanned += 1;
            let Some(lead_jid) = jid::normalize_address(&lead.wa_id) else {
                continue;
            };
            if let Some(url) = session.resolve_avatar(&lead_jid, true).await {
                self.store.set_lead_avatar(&lead.id, &url).await?;
                report.updated += 1;
            }
        }
        let rows = self
            .store
            .messages_missing_sender_avatar(
                &session.workspace_id,
                self.config.backfill_message_limit,
            )
            .await?;
        for row in rows {
            if !session.is_connected() {
                break;
            }
            report.scanned += 1;
            let Some(sender) = jid::normalize_address(&row.sender_id) else {
                continue;
            };
            if let Some(url) = session.resolve_avatar(&sender, true).await {
                self.store.set_message_sender_avatar(&row.id, &url).await?;
                report.updated += 1;
            }
        }
        if report.updated > 0 {
            info!(
                "Avatar backfill for {}: {} of {} targets resolved",
                session.account_id, report.updated, report.scanned
            );
        }
        Ok(report)
    }
}
