//! Bounded on-disk retry queue for store outages.
//!
//! When the CRM store throws a transient error the raw message is parked
//! here instead of being lost. The queue is a JSONL file: one append per
//! enqueue, full rewrite after a drain pass or an overflow eviction.
//! Ordering within one account is FIFO; the bridge decides which accounts
//! a drain pass may touch.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::BridgeConfig;
use crate::types::{MessageSource, RawMessage};
use crate::util::random_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryItem {
    pub id: String,
    pub account_id: String,
    pub source: MessageSource,
    pub message: RawMessage,
    pub queued_at: DateTime<Utc>,
}

pub struct RetryQueue {
    enabled: bool,
    max_size: usize,
    path: PathBuf,
    cooldown: Duration,
    items: Mutex<VecDeque<RetryItem>>,
    unavailable_until: std::sync::Mutex<Option<Instant>>,
    flush_running: AtomicBool,
}

impl RetryQueue {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            enabled: config.retry_queue_enabled,
            max_size: config.retry_queue_max,
            path: config.retry_queue_path.clone(),
            cooldown: config.retry_queue_cooldown,
            items: Mutex::new(VecDeque::new()),
            unavailable_until: std::sync::Mutex::new(None),
            flush_running: AtomicBool::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Flip the store into unavailable-mode for the cooldown window.
    pub fn mark_unavailable(&self) {
        let mut guard = self.unavailable_until.lock().unwrap();
        *guard = Some(Instant::now() + self.cooldown);
    }

    pub fn clear_unavailable(&self) {
        *self.unavailable_until.lock().unwrap() = None;
    }

    pub fn is_unavailable(&self) -> bool {
        let mut guard = self.unavailable_until.lock().unwrap();
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    /// Replay the queue file from a previous process, keeping parseable
    /// lines and logging the rest.
    pub async fn load_from_disk(&self) {
        if !self.enabled {
            return;
        }
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                error!("Failed to read retry queue file {:?}: {err}", self.path);
                return;
            }
        };
        let mut items = self.items.lock().await;
        let mut skipped = 0usize;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RetryItem>(line) {
                Ok(item) => items.push_back(item),
                Err(err) => {
                    skipped += 1;
                    warn!("Dropping unparseable retry queue line: {err}");
                }
            }
        }
        if !items.is_empty() || skipped > 0 {
            info!(
                "Loaded {} queued messages from disk ({} lines skipped)",
                items.len(),
                skipped
            );
        }
    }

    /// Park one message. Oldest entries are evicted when full. Disk
    /// failures are logged, never propagated; the in-memory copy is the
    /// source of truth until the next rewrite.
    pub async fn enqueue(&self, account_id: &str, source: MessageSource, message: RawMessage) {
        if !self.enabled {
            return;
        }
        let item = RetryItem {
            id: random_id(),
            account_id: account_id.to_string(),
            source,
            message,
            queued_at: Utc::now(),
        };
        let overflowed = {
            let mut items = self.items.lock().await;
            let mut overflowed = false;
            while items.len() >= self.max_size {
                items.pop_front();
                overflowed = true;
            }
            items.push_back(item.clone());
            overflowed
        };
        if overflowed {
            warn!(
                "Retry queue full ({} entries); dropped oldest message",
                self.max_size
            );
            self.rewrite_to_disk().await;
        } else if let Err(err) = self.append_line(&item).await {
            error!("Failed to persist retry queue entry: {err}");
        }
        debug!("Queued message {} for account {account_id}", item.id);
    }

    async fn append_line(&self, item: &RetryItem) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(item).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Rewrite the whole file to match memory. Called after drain passes
    /// and overflow evictions.
    pub async fn rewrite_to_disk(&self) {
        if !self.enabled {
            return;
        }
        let serialized = {
            let items = self.items.lock().await;
            let mut out = String::new();
            for item in items.iter() {
                match serde_json::to_string(item) {
                    Ok(line) => {
                        out.push_str(&line);
                        out.push('\n');
                    }
                    Err(err) => error!("Failed to serialize retry queue entry: {err}"),
                }
            }
            out
        };
        if let Some(parent) = self.path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                error!("Failed to create retry queue dir: {err}");
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&self.path, serialized).await {
            error!("Failed to rewrite retry queue file: {err}");
        }
    }

    /// Next item whose account is not in `skip`, preserving per-account
    /// FIFO order.
    pub async fn next_after(&self, skip: &HashSet<String>) -> Option<RetryItem> {
        let items = self.items.lock().await;
        items
            .iter()
            .find(|item| !skip.contains(&item.account_id))
            .cloned()
    }

    pub async fn remove(&self, id: &str) {
        let mut items = self.items.lock().await;
        if let Some(pos) = items.iter().position(|item| item.id == id) {
            items.remove(pos);
        }
    }

    pub async fn pending(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn has_pending(&self) -> bool {
        !self.items.lock().await.is_empty()
    }

    /// Claim the single-drainer guard. Returns false when a pass is
    /// already running.
    pub fn begin_flush(&self) -> bool {
        !self.flush_running.swap(true, Ordering::SeqCst)
    }

    pub fn end_flush(&self) {
        self.flush_running.store(false, Ordering::SeqCst);
    }
}
