mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::time::Duration;
use whatsapp_bridge::store::{CrmStore, MANUAL_DISCONNECT};
use whatsapp_bridge::types::{CloseReason, SocketEvent};

#[tokio::test]
async fn test_qr_then_open_lifecycle() {
    let harness = build_bridge();
    harness
        .bridge
        .create_session("acc-1", WORKSPACE, false)
        .await
        .unwrap();
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Qr {
                code: "2@pairing-code".into(),
            },
        )
        .await;
    let store = harness.store.clone();
    wait_until("QR stored", move || {
        store
            .account("acc-1")
            .and_then(|a| a.qr)
            .is_some_and(|qr| qr.starts_with("data:image/svg+xml;base64,"))
    })
    .await;
    assert_eq!(harness.store.account("acc-1").unwrap().status, "connecting");

    connect(&harness, "acc-1").await;
    let account = harness.store.account("acc-1").unwrap();
    assert_eq!(account.status, "connected");
    assert!(account.qr.is_none());
    // Device suffix stripped from the stored number.
    assert_eq!(account.number.as_deref(), Some(OWNER_NUMBER));
    assert_eq!(account.name.as_deref(), Some("Owner"));
}

#[tokio::test]
async fn test_credentials_persisted_on_auth_update() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::AuthUpdate {
                auth: serde_json::json!({"creds": "blob", "keys": [1, 2, 3]}),
            },
        )
        .await;
    let store = harness.store.clone();
    wait_until("auth persisted", move || {
        store.account("acc-1").is_some_and(|a| a.auth.is_some())
    })
    .await;
    let auth = harness.store.account("acc-1").unwrap().auth.unwrap();
    assert_eq!(auth["creds"], "blob");
}

#[tokio::test]
async fn test_logged_out_is_terminal_and_clears_auth() {
    let harness = build_bridge();
    harness
        .store
        .seed_account("acc-1", WORKSPACE, serde_json::json!({"creds": 1}));
    connect(&harness, "acc-1").await;
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Close {
                reason: CloseReason::LoggedOut,
            },
        )
        .await;
    let store = harness.store.clone();
    wait_until("logged out", move || {
        store
            .account("acc-1")
            .is_some_and(|a| a.status == "disconnected" && a.auth.is_none())
    })
    .await;
    // No reconnect is ever scheduled.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.factory.connect_count.load(Ordering::SeqCst), 1);
    assert!(harness.bridge.session("acc-1").is_none());
}

#[tokio::test]
async fn test_connection_lost_reconnects_with_backoff() {
    let harness = build_bridge_with(|config| {
        config.restart_backoff = Duration::from_millis(20);
    });
    connect(&harness, "acc-1").await;
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Close {
                reason: CloseReason::ConnectionLost,
            },
        )
        .await;
    let factory = harness.factory.clone();
    wait_until("reconnect", move || {
        factory.connect_count.load(Ordering::SeqCst) == 2
    })
    .await;
    let account = harness.store.account("acc-1").unwrap();
    assert_eq!(account.status, "connecting");
    assert_eq!(account.last_error.as_deref(), Some("connection_lost"));
}

#[tokio::test]
async fn test_bad_session_strikes_force_repair() {
    let harness = build_bridge_with(|config| {
        config.bad_session_threshold = 2;
        config.restart_backoff = Duration::from_millis(20);
    });
    harness
        .store
        .seed_account("acc-1", WORKSPACE, serde_json::json!({"creds": 1}));
    connect(&harness, "acc-1").await;

    // First strike reconnects.
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Close {
                reason: CloseReason::BadSession,
            },
        )
        .await;
    let factory = harness.factory.clone();
    wait_until("reconnect after first strike", move || {
        factory.connect_count.load(Ordering::SeqCst) == 2
    })
    .await;

    // Second strike inside the window escalates: auth cleared, no retry.
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Close {
                reason: CloseReason::BadSession,
            },
        )
        .await;
    let store = harness.store.clone();
    wait_until("forced re-pair", move || {
        store.account("acc-1").is_some_and(|a| {
            a.auth.is_none() && a.last_error.as_deref() == Some("bad_session_reauth_required")
        })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.factory.connect_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_manual_disconnect_blocks_close_handling() {
    let harness = build_bridge();
    connect(&harness, "acc-1").await;
    harness.bridge.disconnect("acc-1").await.unwrap();
    let account = harness.store.account("acc-1").unwrap();
    assert_eq!(account.status, "disconnected");
    assert_eq!(account.last_error.as_deref(), Some(MANUAL_DISCONNECT));
    // Credentials survive a manual disconnect.
    let socket = harness.factory.handle("acc-1").unwrap().socket.clone();
    assert_eq!(socket.logout_calls.load(Ordering::SeqCst), 1);

    // The socket's own close event arrives afterwards and must not
    // trigger a reconnect or overwrite the row.
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Close {
                reason: CloseReason::ConnectionLost,
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let account = harness.store.account("acc-1").unwrap();
    assert_eq!(account.last_error.as_deref(), Some(MANUAL_DISCONNECT));
    assert_eq!(harness.factory.connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    let harness = build_bridge_with(|config| {
        config.restart_backoff = Duration::from_millis(300);
    });
    connect(&harness, "acc-1").await;
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Close {
                reason: CloseReason::ConnectionLost,
            },
        )
        .await;
    let store = harness.store.clone();
    wait_until("close handled", move || {
        store
            .account("acc-1")
            .is_some_and(|a| a.last_error.as_deref() == Some("connection_lost"))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The reconnect timer is armed but no session is registered; the
    // operator disconnect must still win.
    assert!(harness.bridge.session("acc-1").is_none());
    harness.bridge.disconnect("acc-1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(harness.factory.connect_count.load(Ordering::SeqCst), 1);
    let account = harness.store.account("acc-1").unwrap();
    assert_eq!(account.status, "disconnected");
    assert_eq!(account.last_error.as_deref(), Some(MANUAL_DISCONNECT));
}

#[tokio::test]
async fn test_repeated_qr_code_written_once() {
    let harness = build_bridge();
    harness
        .bridge
        .create_session("acc-1", WORKSPACE, false)
        .await
        .unwrap();
    for _ in 0..3 {
        harness
            .factory
            .push(
                "acc-1",
                SocketEvent::Qr {
                    code: "2@pairing-code".into(),
                },
            )
            .await;
    }
    let store = harness.store.clone();
    wait_until("QR stored", move || {
        store.account("acc-1").is_some_and(|a| a.qr.is_some())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.store.account("acc-1").unwrap().qr_updates, 1);

    // A rotated code still goes through.
    harness
        .factory
        .push(
            "acc-1",
            SocketEvent::Qr {
                code: "2@rotated-code".into(),
            },
        )
        .await;
    let store = harness.store.clone();
    wait_until("rotated QR stored", move || {
        store.account("acc-1").is_some_and(|a| a.qr_updates == 2)
    })
    .await;
}

#[tokio::test]
async fn test_bootstrap_reopens_credentialed_accounts() {
    let harness = build_bridge();
    harness
        .store
        .seed_account("acc-1", WORKSPACE, serde_json::json!({"creds": 1}));
    harness
        .store
        .seed_account("acc-2", WORKSPACE, serde_json::json!({"creds": 2}));
    harness
        .store
        .mark_disconnected("acc-2", MANUAL_DISCONNECT, false)
        .await
        .unwrap();

    let opened = harness.bridge.bootstrap().await.unwrap();
    assert_eq!(opened, 1);
    assert!(harness.bridge.session("acc-1").is_some());
    assert!(harness.bridge.session("acc-2").is_none());
    // The stored credentials were handed to the socket factory.
    let handle = harness.factory.handle("acc-1").unwrap();
    assert_eq!(handle.auth.as_ref().unwrap()["creds"], 1);
}

#[tokio::test]
async fn test_force_new_session_discards_credentials() {
    let harness = build_bridge();
    harness
        .store
        .seed_account("acc-1", WORKSPACE, serde_json::json!({"creds": 1}));
    connect(&harness, "acc-1").await;
    harness
        .bridge
        .create_session("acc-1", WORKSPACE, true)
        .await
        .unwrap();
    let handle = harness.factory.handle("acc-1").unwrap();
    assert!(handle.auth.is_none());
    assert_eq!(harness.factory.connect_count.load(Ordering::SeqCst), 2);
}
