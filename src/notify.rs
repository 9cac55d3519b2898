//! Webhook that wakes the automation-agents service when a contact
//! message lands. Fire-and-forget, same as realtime.

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AgentNotification {
    pub workspace_id: String,
    pub account_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub message_external_id: String,
    pub text: String,
    pub is_group: bool,
}

#[async_trait]
pub trait AgentsNotifier: Send + Sync {
    async fn notify(&self, notification: AgentNotification);
}

/// POSTs notifications to the agents service. The blocking HTTP client
/// runs on the blocking pool so the session task never stalls on it.
pub struct HttpAgentsNotifier {
    base_url: String,
    api_key: String,
}

impl HttpAgentsNotifier {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl AgentsNotifier for HttpAgentsNotifier {
    async fn notify(&self, notification: AgentNotification) {
        let url = format!("{}/hooks/message-received", self.base_url);
        let api_key = self.api_key.clone();
        let result = tokio::task::spawn_blocking(move || {
            ureq::post(&url)
                .header("x-agents-key", &api_key)
                .send_json(&notification)
        })
        .await;
        match result {
            Ok(Ok(_)) => debug!("Notified agents service"),
            Ok(Err(err)) => warn!("Agents webhook failed: {err}"),
            Err(err) => warn!("Agents webhook task panicked: {err}"),
        }
    }
}

#[derive(Default)]
pub struct MemoryNotifier {
    pub notifications: std::sync::Mutex<Vec<AgentNotification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<AgentNotification> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentsNotifier for MemoryNotifier {
    async fn notify(&self, notification: AgentNotification) {
        self.notifications.lock().unwrap().push(notification);
    }
}
