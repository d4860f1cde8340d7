//! Per-tenant state machine behavior observed through the coordinator

mod common;

use std::time::Duration;

use tokio::time::Instant;

use common::{harness, next_event, status_change, test_config, wait_for_status, OnOpen};
use mz_core::error::{CoordinatorError, SessionError};
use mz_core::traits::{CredentialStore, TransportEvent};
use mz_core::types::{CredentialState, MediaMessage, OutboundPayload, SessionStatus, TenantId};
use mz_orchestrator::{CreateOutcome, PairingCodeView, SessionEvent};

fn media(kind: &str) -> MediaMessage {
    MediaMessage {
        media_type: kind.to_string(),
        url: "https://cdn.example.com/file".to_string(),
        mimetype: Some("application/pdf".to_string()),
        file_name: Some("file.pdf".to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_pairing_then_connect() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport
        .set_behavior(&tenant, OnOpen::IssueCode("2@ref,noise,identity".to_string()));

    let outcome = h.coordinator.create_session(tenant.clone()).await.unwrap();
    assert_eq!(outcome, CreateOutcome::Created);

    let session = h.coordinator.session(&tenant).unwrap();
    let snapshot = wait_for_status(&session, SessionStatus::QrPending).await;
    assert!(snapshot.has_pairing_code);
    match h.coordinator.pairing_code(&tenant).unwrap() {
        PairingCodeView::Available { image, .. } => {
            assert!(image.starts_with("data:text/plain;base64,"));
        }
        other => panic!("expected an available pairing code, got {:?}", other),
    }

    h.transport
        .emit(&tenant, TransportEvent::ConnectionOpened)
        .await;
    let snapshot = wait_for_status(&session, SessionStatus::Connected).await;
    assert!(!snapshot.has_pairing_code);
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.connection_attempts, 0);
    assert_eq!(
        h.coordinator.pairing_code(&tenant).unwrap(),
        PairingCodeView::AlreadyConnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_qr_generated_event_carries_image() {
    let mut h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport
        .set_behavior(&tenant, OnOpen::IssueCode("code-1".to_string()));

    h.coordinator.create_session(tenant.clone()).await.unwrap();

    let event = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::QrGenerated { .. })
    })
    .await;
    let SessionEvent::QrGenerated { tenant_id, image, .. } = event else {
        unreachable!();
    };
    assert_eq!(tenant_id, tenant);
    assert_eq!(image, "data:text/plain;base64,Y29kZS0x");
}

#[tokio::test(start_paused = true)]
async fn test_no_code_yet_reports_awaiting() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");

    h.coordinator.create_session(tenant.clone()).await.unwrap();

    assert_eq!(
        h.coordinator.pairing_code(&tenant).unwrap(),
        PairingCodeView::Awaiting
    );
    assert!(matches!(
        h.coordinator.pairing_code(&TenantId::new("nobody")),
        Err(CoordinatorError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_pairing_code_expires() {
    let config = mz_core::config::ManagerConfig {
        pairing_code_ttl: Duration::from_secs(60),
        ..test_config()
    };
    let h = harness(config);
    let tenant = TenantId::new("t1");
    h.transport
        .set_behavior(&tenant, OnOpen::IssueCode("code".to_string()));

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::QrPending).await;

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(
        h.coordinator.pairing_code(&tenant).unwrap(),
        PairingCodeView::Awaiting
    );
    let snapshot = h.coordinator.get_status(&tenant).unwrap();
    assert!(!snapshot.has_pairing_code);
    assert_eq!(snapshot.status, SessionStatus::QrPending);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_code_ignored_when_connected() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    h.transport
        .emit(
            &tenant,
            TransportEvent::PairingCodeIssued {
                code: "late".to_string(),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Connected);
    assert!(!snapshot.has_pairing_code);
}

#[tokio::test(start_paused = true)]
async fn test_ordinary_close_schedules_reconnect() {
    let mut h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    let closed_at = Instant::now();
    h.transport
        .emit(
            &tenant,
            TransportEvent::ConnectionClosed {
                reason_code: Some(408),
                message: "connection lost".to_string(),
            },
        )
        .await;

    next_event(&mut h.events, status_change(&tenant, SessionStatus::Disconnected)).await;
    next_event(
        &mut h.events,
        status_change(&tenant, SessionStatus::ReconnectScheduled),
    )
    .await;
    next_event(&mut h.events, status_change(&tenant, SessionStatus::Connecting)).await;

    assert!(closed_at.elapsed() >= Duration::from_secs(15));

    wait_for_status(&session, SessionStatus::Connected).await;
    assert_eq!(session.snapshot().retry_count, 0);
    assert_eq!(h.transport.opens(&tenant), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_event_reports_delay() {
    let mut h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    h.transport
        .emit(
            &tenant,
            TransportEvent::ConnectionClosed {
                reason_code: None,
                message: "stream errored".to_string(),
            },
        )
        .await;

    let event = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::ReconnectScheduled {
            tenant_id: tenant.clone(),
            delay_ms: 15_000,
            attempt: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_terminal_close_terminates_and_removes() {
    let mut h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    h.transport
        .emit(
            &tenant,
            TransportEvent::ConnectionClosed {
                reason_code: Some(401),
                message: "logged out".to_string(),
            },
        )
        .await;

    next_event(&mut h.events, status_change(&tenant, SessionStatus::Disconnected)).await;
    let next = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::StatusChanged { .. })
    })
    .await;
    assert_eq!(
        next,
        SessionEvent::StatusChanged {
            tenant_id: tenant.clone(),
            from: SessionStatus::Disconnected,
            to: SessionStatus::Terminated,
        }
    );

    let critical = next_event(&mut h.events, |e| {
        matches!(
            e,
            SessionEvent::CriticalError { .. } | SessionEvent::ReconnectScheduled { .. }
        )
    })
    .await;
    assert!(matches!(
        critical,
        SessionEvent::CriticalError {
            reason_code: Some(401),
            ..
        }
    ));

    next_event(&mut h.events, |e| matches!(e, SessionEvent::Removed { .. })).await;
    assert!(matches!(
        h.coordinator.get_status(&tenant),
        Err(CoordinatorError::NotFound(_))
    ));
    assert_eq!(session.status(), SessionStatus::Terminated);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transport.opens(&tenant), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ordinary_retries_bounded_and_monotonic() {
    let config = mz_core::config::ManagerConfig {
        max_connection_attempts: 10,
        ..test_config()
    };
    let mut h = harness(config);
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Close(Some(408)));

    h.coordinator.create_session(tenant.clone()).await.unwrap();

    let mut delays = Vec::new();
    loop {
        let event = next_event(&mut h.events, |e| {
            matches!(
                e,
                SessionEvent::ReconnectScheduled { .. } | SessionEvent::CriticalError { .. }
            )
        })
        .await;
        match event {
            SessionEvent::ReconnectScheduled { delay_ms, .. } => delays.push(delay_ms),
            SessionEvent::CriticalError { message, .. } => {
                assert_eq!(message, "reconnection attempts exhausted");
                break;
            }
            _ => unreachable!(),
        }
    }

    assert_eq!(delays, vec![15_000, 30_000, 60_000]);
    assert!(delays.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(h.transport.opens(&tenant), 4);
}

#[tokio::test(start_paused = true)]
async fn test_severe_close_retried_once() {
    let config = mz_core::config::ManagerConfig {
        max_connection_attempts: 10,
        ..test_config()
    };
    let mut h = harness(config);
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Close(Some(440)));

    h.coordinator.create_session(tenant.clone()).await.unwrap();

    let first = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::ReconnectScheduled { .. })
    })
    .await;
    assert!(matches!(
        first,
        SessionEvent::ReconnectScheduled {
            delay_ms: 60_000,
            attempt: 1,
            ..
        }
    ));

    let second = next_event(&mut h.events, |e| {
        matches!(
            e,
            SessionEvent::ReconnectScheduled { .. } | SessionEvent::CriticalError { .. }
        )
    })
    .await;
    assert!(matches!(second, SessionEvent::CriticalError { .. }));
    assert_eq!(h.transport.opens(&tenant), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_is_rescheduled() {
    let mut h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    h.transport.set_behavior(&tenant, OnOpen::Fail);
    h.transport
        .emit(
            &tenant,
            TransportEvent::ConnectionClosed {
                reason_code: Some(408),
                message: "timed out".to_string(),
            },
        )
        .await;

    let first = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::ReconnectScheduled { .. })
    })
    .await;
    let second = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::ReconnectScheduled { .. })
    })
    .await;

    assert!(matches!(
        first,
        SessionEvent::ReconnectScheduled { attempt: 1, .. }
    ));
    assert!(matches!(
        second,
        SessionEvent::ReconnectScheduled {
            delay_ms: 30_000,
            attempt: 2,
            ..
        }
    ));
    assert_eq!(h.transport.counters(&tenant).live, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_epoch_events_are_dropped() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    let stale = h.transport.sink(&tenant);
    h.transport.set_behavior(&tenant, OnOpen::Nothing);
    h.transport
        .emit(
            &tenant,
            TransportEvent::ConnectionClosed {
                reason_code: Some(408),
                message: "lost".to_string(),
            },
        )
        .await;

    wait_for_status(&session, SessionStatus::Connecting).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.opens(&tenant), 2);

    stale.emit(TransportEvent::ConnectionOpened).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.status(), SessionStatus::Connecting);

    h.transport
        .emit(&tenant, TransportEvent::ConnectionOpened)
        .await;
    wait_for_status(&session, SessionStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_rejected_while_connecting() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    assert_eq!(session.status(), SessionStatus::Connecting);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyConnecting(_)));
    assert_eq!(h.transport.opens(&tenant), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_with_open_handle_is_noop() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    session.connect().await.unwrap();
    assert_eq!(h.transport.opens(&tenant), 1);
    assert_eq!(h.transport.counters(&tenant).max_live, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_attempts_exhausted() {
    let config = mz_core::config::ManagerConfig {
        max_connection_attempts: 1,
        ..test_config()
    };
    let h = harness(config);
    let tenant = TenantId::new("t1");

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    h.coordinator.disconnect_session(&tenant).await.unwrap();

    let session = h.coordinator.session(&tenant).unwrap();
    assert_eq!(session.status(), SessionStatus::Disconnected);

    let err = session.connect().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::AttemptsExhausted {
            attempts: 1,
            max: 1
        }
    ));
    assert_eq!(err.kind(), "attempts_exhausted");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    h.coordinator.disconnect_session(&tenant).await.unwrap();
    h.coordinator.disconnect_session(&tenant).await.unwrap();

    let snapshot = session.snapshot();
    assert_eq!(snapshot.status, SessionStatus::Disconnected);
    assert!(!snapshot.has_transport);
    assert_eq!(h.transport.logouts(), 1);
    assert_eq!(h.transport.counters(&tenant).live, 0);

    // No reconnection follows a deliberate disconnect.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transport.opens(&tenant), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_message_requires_connected() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport
        .set_behavior(&tenant, OnOpen::IssueCode("code".to_string()));

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::QrPending).await;

    let err = h
        .coordinator
        .send_message(&tenant, "5511999999999", "hello")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_connected");
    assert!(err.is_client_error());

    let err = h
        .coordinator
        .send_message(&TenantId::new("ghost"), "5511999999999", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound(_)));
    assert!(h.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_text_and_media() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    let first = h
        .coordinator
        .send_message(&tenant, "5511999999999", "hello")
        .await
        .unwrap();
    let second = h
        .coordinator
        .send_media_message(
            &tenant,
            "5511999999999",
            media("image"),
            Some("look".to_string()),
        )
        .await
        .unwrap();
    assert_ne!(first, second);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].2, OutboundPayload::text("hello"));
    match &sent[1].2 {
        OutboundPayload::Media {
            caption, mimetype, ..
        } => {
            assert_eq!(caption.as_deref(), Some("look"));
            assert!(mimetype.is_none());
        }
        other => panic!("expected media payload, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_media_never_reaches_transport() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    let err = h
        .coordinator
        .send_media_message(&tenant, "5511999999999", media("sticker"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Session(SessionError::UnsupportedMediaType(ref t)) if t == "sticker"
    ));
    assert!(h.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_surfaces() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    h.transport.fail_sends(true);
    let err = h
        .coordinator
        .send_message(&tenant, "5511999999999", "hello")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "send_failed");
    assert!(!err.is_client_error());
}

#[tokio::test(start_paused = true)]
async fn test_credentials_changes_are_persisted() {
    let h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    let state = CredentialState(serde_json::json!({"creds": {"me": "5511"}}));
    h.transport
        .emit(
            &tenant,
            TransportEvent::CredentialsChanged {
                state: state.clone(),
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.credentials.load(&tenant).await.unwrap(), state);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_are_relayed() {
    let mut h = harness(test_config());
    let tenant = TenantId::new("t1");
    h.transport.set_behavior(&tenant, OnOpen::Connect);

    h.coordinator.create_session(tenant.clone()).await.unwrap();
    let session = h.coordinator.session(&tenant).unwrap();
    wait_for_status(&session, SessionStatus::Connected).await;

    let raw = serde_json::json!({"key": {"remoteJid": "5511@s"}, "message": {"conversation": "hi"}});
    h.transport
        .emit(&tenant, TransportEvent::MessageReceived { raw: raw.clone() })
        .await;

    let event = next_event(&mut h.events, |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::MessageReceived {
            tenant_id: tenant,
            raw,
        }
    );
}
