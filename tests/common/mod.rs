#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use whatsapp_bridge::bridge::Bridge;
use whatsapp_bridge::config::BridgeConfig;
use whatsapp_bridge::jid::Jid;
use whatsapp_bridge::notify::{AgentsNotifier, MemoryNotifier};
use whatsapp_bridge::realtime::{MemoryRealtime, Realtime};
use whatsapp_bridge::socket::SocketFactory;
use whatsapp_bridge::socket::mock::MockSocketFactory;
use whatsapp_bridge::storage::{MemoryObjectStorage, ObjectStorage};
use whatsapp_bridge::store::{CrmStore, MemoryStore};
use whatsapp_bridge::types::{
    ConnectedUser, EnvelopeContent, MediaKind, MediaRef, MessageKey, RawMessage, SocketEvent,
    TaggedBytes,
};

pub const WORKSPACE: &str = "ws-1";
pub const OWNER_ID: &str = "5599888877776:3@s.whatsapp.net";
pub const OWNER_NUMBER: &str = "5599888877776@s.whatsapp.net";

pub struct TestHarness {
    pub bridge: Arc<Bridge>,
    pub store: Arc<MemoryStore>,
    pub storage: Arc<MemoryObjectStorage>,
    pub realtime: Arc<MemoryRealtime>,
    pub notifier: Arc<MemoryNotifier>,
    pub factory: Arc<MockSocketFactory>,
    pub queue_path: std::path::PathBuf,
    _queue_dir: tempfile::TempDir,
}

pub fn build_bridge() -> TestHarness {
    build_bridge_with(|_| {})
}

pub fn build_bridge_with(tweak: impl FnOnce(&mut BridgeConfig)) -> TestHarness {
    let _ = env_logger::builder().is_test(true).try_init();
    let queue_dir = tempfile::tempdir().unwrap();
    let mut config = BridgeConfig {
        retry_queue_path: queue_dir.path().join("queue.jsonl"),
        job_stagger: [Duration::from_millis(20); 3],
        ..Default::default()
    };
    tweak(&mut config);
    let queue_path = config.retry_queue_path.clone();
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(MemoryObjectStorage::new());
    let realtime = Arc::new(MemoryRealtime::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let factory = Arc::new(MockSocketFactory::new());
    let bridge = Bridge::new(
        config,
        store.clone() as Arc<dyn CrmStore>,
        storage.clone() as Arc<dyn ObjectStorage>,
        realtime.clone() as Arc<dyn Realtime>,
        notifier.clone() as Arc<dyn AgentsNotifier>,
        factory.clone() as Arc<dyn SocketFactory>,
    );
    TestHarness {
        bridge,
        store,
        storage,
        realtime,
        notifier,
        factory,
        queue_path,
        _queue_dir: queue_dir,
    }
}

/// Poll the retry queue until it holds `expected` items.
pub async fn wait_for_pending(bridge: &Arc<Bridge>, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if bridge.retry_queue.pending().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {expected} queued messages");
}

pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Open a session and drive it to the connected state.
pub async fn connect(harness: &TestHarness, account: &str) {
    harness
        .bridge
        .create_session(account, WORKSPACE, false)
        .await
        .unwrap();
    harness
        .factory
        .push(
            account,
            SocketEvent::Open {
                user: ConnectedUser {
                    id: OWNER_ID.into(),
                    name: Some("Owner".into()),
                    verified_name: None,
                    notify: None,
                },
            },
        )
        .await;
    let bridge = harness.bridge.clone();
    let account = account.to_string();
    wait_until("session connected", move || {
        bridge
            .session(&account)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    })
    .await;
}

pub fn message_key(id: &str, chat: &str) -> MessageKey {
    MessageKey {
        remote_jid: chat.parse::<Jid>().unwrap(),
        id: id.to_string(),
        from_me: false,
        participant: None,
    }
}

pub fn text_message(id: &str, chat: &str, text: &str) -> RawMessage {
    RawMessage {
        key: message_key(id, chat),
        push_name: Some("Alice".into()),
        timestamp: Some(chrono::Utc::now().timestamp()),
        content: Some(EnvelopeContent::Text {
            text: text.to_string(),
            context: None,
        }),
    }
}

pub fn image_message(id: &str, chat: &str, direct_path: &str) -> RawMessage {
    RawMessage {
        key: message_key(id, chat),
        push_name: Some("Alice".into()),
        timestamp: Some(chrono::Utc::now().timestamp()),
        content: Some(EnvelopeContent::Image {
            caption: None,
            media: MediaRef {
                kind: MediaKind::Image,
                mimetype: Some("image/jpeg".into()),
                file_name: None,
                media_key: Some(TaggedBytes(vec![7, 7, 7])),
                direct_path: Some(direct_path.to_string()),
                file_length: Some(64),
            },
            context: None,
        }),
    }
}
