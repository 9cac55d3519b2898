mod common;

use common::*;
use std::sync::atomic::Ordering;
use whatsapp_bridge::types::{MessageSource, SocketEvent};

const CHAT: &str = "5511999999999@s.whatsapp.net";

#[tokio::test]
async fn test_store_outage_parks_message_then_drain_lands_it() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;

    harness.store.fail_transient.store(true, Ordering::SeqCst);
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::LiveMessages {
                messages: vec![text_message("MSG1", CHAT, "during outage")],
            },
        )
        .await;
    wait_for_pending(&harness.bridge, 1).await;

    // Nothing reached the table; the queue file has the raw envelope.
    assert!(harness.store.messages().is_empty());
    let raw = std::fs::read_to_string(&harness.queue_path).unwrap();
    assert!(raw.contains("MSG1"));
    assert!(harness.bridge.retry_queue.is_unavailable());

    // Store recovers; a drain pass replays the message.
    harness.store.fail_transient.store(false, Ordering::SeqCst);
    harness.bridge.retry_queue.clear_unavailable();
    harness.bridge.flush_retry_queue().await;

    let row = harness.store.message_by_external_id("MSG1").unwrap();
    assert_eq!(row.text, "during outage");
    assert_eq!(harness.bridge.retry_queue.pending().await, 0);
    let raw = std::fs::read_to_string(&harness.queue_path).unwrap_or_default();
    assert!(!raw.contains("MSG1"));
}

#[tokio::test]
async fn test_drain_halts_on_transient_without_dropping() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    harness
        .bridge
        .retry_queue
        .enqueue("acc-1", MessageSource::Live, text_message("Q1", CHAT, "one"))
        .await;
    harness
        .bridge
        .retry_queue
        .enqueue("acc-1", MessageSource::Live, text_message("Q2", CHAT, "two"))
        .await;

    harness.store.fail_transient.store(true, Ordering::SeqCst);
    harness.bridge.flush_retry_queue().await;

    // The pass halted at the first transient failure; both items remain.
    assert_eq!(harness.bridge.retry_queue.pending().await, 2);
    assert!(harness.bridge.retry_queue.is_unavailable());

    harness.store.fail_transient.store(false, Ordering::SeqCst);
    harness.bridge.retry_queue.clear_unavailable();
    harness.bridge.flush_retry_queue().await;
    assert_eq!(harness.bridge.retry_queue.pending().await, 0);
    // FIFO: Q1 landed before Q2.
    let messages = harness.store.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].external_id, "Q1");
    assert_eq!(messages[1].external_id, "Q2");
}

#[tokio::test]
async fn test_drain_skips_accounts_without_live_session() {
    let harness = build_bridge();
    connect(&harness, "acc-live").await;
    harness
        .bridge
        .retry_queue
        .enqueue(
            "acc-dead",
            MessageSource::Live,
            text_message("DEAD1", CHAT, "stranded"),
        )
        .await;
    harness
        .bridge
        .retry_queue
        .enqueue(
            "acc-live",
            MessageSource::Live,
            text_message("LIVE1", CHAT, "deliverable"),
        )
        .await;

    harness.bridge.flush_retry_queue().await;

    // The dead account's message stays queued; the live one landed.
    assert_eq!(harness.bridge.retry_queue.pending().await, 1);
    assert!(harness.store.message_by_external_id("LIVE1").is_some());
    assert!(harness.store.message_by_external_id("DEAD1").is_none());
    // The queue file was rewritten when the item was removed, not at
    // some later point.
    let raw = std::fs::read_to_string(&harness.queue_path).unwrap();
    assert!(raw.contains("DEAD1"));
    assert!(!raw.contains("LIVE1"));
}

#[tokio::test]
async fn test_unavailable_mode_queues_without_touching_store() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    harness.bridge.retry_queue.mark_unavailable();
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::LiveMessages {
                messages: vec![text_message("MSG-COOL", CHAT, "cooldown")],
            },
        )
        .await;
    wait_for_pending(&harness.bridge, 1).await;
    assert!(harness.store.messages().is_empty());
}

#[tokio::test]
async fn test_queue_survives_process_restart() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    harness.store.fail_transient.store(true, Ordering::SeqCst);
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::LiveMessages {
                messages: vec![text_message("MSG-RESTART", CHAT, "persisted")],
            },
        )
        .await;
    wait_for_pending(&harness.bridge, 1).await;
    let queue_path = harness.queue_path.clone();

    // A second bridge pointed at the same file picks the message up.
    let harness2 = build_bridge_with(|config| {
        config.retry_queue_path = queue_path;
    });
    connect(&harness2, "acc-1").await;
    harness2.bridge.retry_queue.load_from_disk().await;
    assert_eq!(harness2.bridge.retry_queue.pending().await, 1);
    harness2.bridge.flush_retry_queue().await;
    assert!(harness2.store.message_by_external_id("MSG-RESTART").is_some());
}
