mod common;

use common::*;
use whatsapp_bridge::types::{ConnectedUser, ContactUpsert, SocketEvent};

const CHAT: &str = "5511999999999@s.whatsapp.net";

async fn ingest_nameless_message(harness: &TestHarness, id: &str) {
    let mut message = text_message(id, CHAT, "hello");
    message.push_name = None;
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::LiveMessages {
                messages: vec![message],
            },
        )
        .await;
    let store = harness.store.clone();
    let id = id.to_string();
    wait_until("message persisted", move || {
        store.message_by_external_id(&id).is_some()
    })
    .await;
}

#[tokio::test]
async fn test_lead_name_backfill_uses_late_contact() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    ingest_nameless_message(&harness, "MSG1").await;
    assert!(harness.store.lead_by_wa_id(CHAT).unwrap().name.is_none());

    // Contact record arrives later, cache-only (no lead matched yet by
    // the upsert handler because we bypass it here).
    let session = harness.bridge.session("acc-1").unwrap();
    session.caches.merge_contact(
        CHAT,
        &ContactUpsert {
            id: CHAT.into(),
            name: Some("Alice Completa".into()),
            ..Default::default()
        },
    );

    let report = harness.bridge.backfill_lead_names(&session).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(
        harness.store.lead_by_wa_id(CHAT).unwrap().name.as_deref(),
        Some("Alice Completa")
    );
}

#[tokio::test]
async fn test_sender_name_backfill_names_direct_messages() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    ingest_nameless_message(&harness, "MSG1").await;
    let row = harness.store.message_by_external_id("MSG1").unwrap();
    assert!(row.sender_name.is_none());

    let session = harness.bridge.session("acc-1").unwrap();
    session.caches.merge_contact(
        CHAT,
        &ContactUpsert {
            id: CHAT.into(),
            notify: Some("Alice".into()),
            ..Default::default()
        },
    );
    let report = harness
        .bridge
        .backfill_sender_names(&session)
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    let row = harness.store.message_by_external_id("MSG1").unwrap();
    assert_eq!(row.sender_name.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn test_avatar_backfill_forces_negative_cache_retry() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    // First ingest finds no avatar and caches the miss.
    ingest_nameless_message(&harness, "MSG1").await;
    assert!(harness.store.lead_by_wa_id(CHAT).unwrap().avatar_url.is_none());

    // The contact uploads a picture afterwards.
    let socket = harness.factory.handle("acc-1").unwrap().socket.clone();
    socket
        .avatars
        .insert(CHAT.to_string(), Some("https://pps/alice.jpg".into()));

    let session = harness.bridge.session("acc-1").unwrap();
    let report = harness.bridge.backfill_avatars(&session).await.unwrap();
    assert!(report.updated >= 1);
    assert_eq!(
        harness
            .store
            .lead_by_wa_id(CHAT)
            .unwrap()
            .avatar_url
            .as_deref(),
        Some("https://pps/alice.jpg")
    );
}

#[tokio::test]
async fn test_backfills_scheduled_once_per_connection() {
    let harness = build_bridge_with(|config| {
        config.job_stagger = [std::time::Duration::from_millis(80); 3];
    });
    connect(&harness, "acc-1").await;
    // A second open event on the same session must not double-arm the
    // jobs.
    harness
        .factory
        .push(
            "acc-1",
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

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    // One run each: lead names (one query), sender names (one), avatars
    // (leads plus message senders).
    assert_eq!(
        harness
            .store
            .backfill_scans
            .load(std::sync::atomic::Ordering::SeqCst),
        4
    );
}

#[tokio::test]
async fn test_backfill_runs_are_exclusive() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    let session = harness.bridge.session("acc-1").unwrap();
    session
        .jobs
        .lead_names
        .running
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let report = harness.bridge.backfill_lead_names(&session).await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn test_backfill_requires_connected_session() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    let session = harness.bridge.session("acc-1").unwrap();
    session.set_status(whatsapp_bridge::types::SessionStatus::Disconnected);
    let report = harness.bridge.backfill_avatars(&session).await.unwrap();
    assert_eq!(report.scanned, 0);
}
