//! Realtime fan-out to connected CRM browsers.
//!
//! Publishing is fire-and-forget: delivery failures are logged, never
//! propagated, and never block ingestion.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::util::random_id;

pub const EVENT_MESSAGE_CREATED: &str = "message:created";
pub const EVENT_CONVERSATION_UPDATED: &str = "conversation:updated";
pub const EVENT_ATTACHMENT_CREATED: &str = "attachment:created";

pub fn workspace_channel(workspace_id: &str) -> String {
    format!("private-workspace-{workspace_id}")
}

pub fn conversation_channel(conversation_id: &str) -> String {
    format!("private-conversation-{conversation_id}")
}

#[async_trait]
pub trait Realtime: Send + Sync {
    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value);
}

/// Wrap a payload with the envelope fields every event carries.
fn envelope(mut payload: serde_json::Value) -> serde_json::Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert("event_id".into(), random_id().into());
        object.insert("emitted_at".into(), Utc::now().to_rfc3339().into());
    }
    payload
}

pub async fn emit_message_created(
    realtime: &dyn Realtime,
    workspace_id: &str,
    conversation_id: &str,
    payload: serde_json::Value,
) {
    let payload = envelope(payload);
    realtime
        .publish(
            &conversation_channel(conversation_id),
            EVENT_MESSAGE_CREATED,
            payload.clone(),
        )
        .await;
    realtime
        .publish(
            &workspace_channel(workspace_id),
            EVENT_MESSAGE_CREATED,
            payload,
        )
        .await;
}

pub async fn emit_conversation_updated(
    realtime: &dyn Realtime,
    workspace_id: &str,
    payload: serde_json::Value,
) {
    realtime
        .publish(
            &workspace_channel(workspace_id),
            EVENT_CONVERSATION_UPDATED,
            envelope(payload),
        )
        .await;
}

pub async fn emit_attachment_created(
    realtime: &dyn Realtime,
    conversation_id: &str,
    payload: serde_json::Value,
) {
    realtime
        .publish(
            &conversation_channel(conversation_id),
            EVENT_ATTACHMENT_CREATED,
            envelope(payload),
        )
        .await;
}

/// Used when no realtime backend is configured. Warns once, then swallows
/// events silently.
#[derive(Default)]
pub struct NoopRealtime {
    warned: AtomicBool,
}

#[async_trait]
impl Realtime for NoopRealtime {
    async fn publish(&self, _channel: &str, _event: &str, _payload: serde_json::Value) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!("No realtime backend configured; dropping events");
        }
    }
}

/// Records every published event for assertions.
#[derive(Default)]
pub struct MemoryRealtime {
    pub events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl MemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event == event)
            .count()
    }
}

#[async_trait]
impl Realtime for MemoryRealtime {
    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) {
        self.events.lock().unwrap().push(RecordedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        });
    }
}
