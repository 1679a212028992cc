//! End-to-end coordinator scenarios on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;
use tokio::time::Instant;

use common::{Harness, RecordingChannel, TENANT, pages, pending, ready, ready_message};
use platform_connect::accounts::AccountManager;
use platform_connect::backend::Operation;
use platform_connect::detector::{ReconnectReason, ReconnectionDetector};
use platform_connect::errors::{BackendError, ConnectError};
use platform_connect::events::ConnectEvent;
use platform_connect::fallback::{FallbackCache, FallbackEntry, PendingSession};
use platform_connect::models::{
    AccountFlags, NewRoutingMapping, NewWebhookAccount, Platform, PollResponse, VerificationStatus,
};
use platform_connect::session::{DeliveryChannel, SessionMode, SessionState};

// =============================================================================
// Happy paths
// =============================================================================

#[tokio::test(start_paused = true)]
async fn single_resource_via_poll_auto_selects_and_finalizes() {
    let mut h = Harness::new();
    h.backend.script_poll("session-1", vec![pending(), ready(pages(1))]);
    let started = Instant::now();

    let snapshot = h.coordinator.start(Platform::Facebook).await.unwrap();
    assert_eq!(snapshot.state, SessionState::AwaitingAuthorization);
    assert_eq!(h.channel.open_count(), 1);

    h.wait_for(SessionState::PagesReady).await;
    let delivered = started.elapsed();
    assert!(delivered >= Duration::from_secs(4), "ready on second poll, got {:?}", delivered);

    let snapshot = h.wait_for(SessionState::Configuring).await;
    assert!(started.elapsed() - delivered <= Duration::from_secs(1));
    assert_eq!(snapshot.selected_resource.unwrap().external_id, "page-1");
    assert_eq!(h.channel.close_count(), 1);

    let account = h.coordinator.finalize(None).await.unwrap();
    assert!(account.is_active);
    assert_eq!(account.verification_status, VerificationStatus::Verified);
    assert_eq!(account.external_resource_id, "page-1");
    assert_eq!(account.tenant_id, TENANT);

    let mappings = h.backend.mappings();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].account_id, account.id);
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectEvent::ResourcesReady { channel: DeliveryChannel::Poll, count: 1, .. }
    )));
    assert!(events.iter().any(|e| matches!(e, ConnectEvent::ResourceSelected { automatic: true, .. })));
    assert!(events.iter().any(|e| matches!(e, ConnectEvent::AccountConnected { .. })));
}

#[tokio::test(start_paused = true)]
async fn multiple_resources_wait_for_explicit_choice() {
    let mut h = Harness::new();
    h.backend.script_poll("session-1", vec![ready(pages(3))]);

    h.coordinator.start(Platform::Instagram).await.unwrap();
    let snapshot = h.wait_for(SessionState::PagesReady).await;
    assert_eq!(snapshot.resources.len(), 3);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let snapshot = h.coordinator.snapshot().await;
    assert_eq!(snapshot.state, SessionState::PagesReady);
    assert!(snapshot.selected_resource.is_none());

    let err = h.coordinator.select_resource("page-9").await.unwrap_err();
    assert!(matches!(err, ConnectError::ResourceNotFound(_)));

    let snapshot = h.coordinator.select_resource("page-2").await.unwrap();
    assert_eq!(snapshot.state, SessionState::Configuring);

    let flags = AccountFlags {
        ai_enabled: true,
        auto_reply: false,
    };
    let account = h.coordinator.finalize(Some(flags)).await.unwrap();
    assert_eq!(account.external_resource_id, "page-2");
    assert!(account.ai_enabled);
    assert!(!account.auto_reply);
}

#[tokio::test(start_paused = true)]
async fn window_message_wins_and_later_deliveries_are_discarded() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    let mut h = Harness::with_fallback(cache.clone());
    h.backend.script_poll("session-1", vec![ready(pages(2))]);

    h.coordinator.start(Platform::Facebook).await.unwrap();

    // The window posts its message and leaves a fallback entry before the first poll tick.
    let resources = pages(2);
    cache
        .write(&FallbackEntry::ready("session-1", resources.clone(), None))
        .unwrap();
    h.channel.post(ready_message("session-1", &resources));

    let snapshot = h.wait_for(SessionState::PagesReady).await;
    assert_eq!(snapshot.resources, resources);
    assert_eq!(snapshot.external_identity.unwrap().display_name, "Jo Admin");

    // Late duplicates from every channel change nothing.
    h.channel.post(ready_message("session-1", &pages(1)));
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snapshot = h.coordinator.snapshot().await;
    assert_eq!(snapshot.state, SessionState::PagesReady);
    assert_eq!(snapshot.resources, resources);
    assert!(cache.read("session-1").unwrap().is_none());
    assert_eq!(h.backend.call_count(Operation::PollSession), 0);

    let ready_events: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ConnectEvent::ResourcesReady { channel, .. } => Some(channel),
            _ => None,
        })
        .collect();
    assert_eq!(ready_events, vec![DeliveryChannel::Message]);
    assert_eq!(h.channel.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn fallback_cache_delivers_when_message_is_lost() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    let mut h = Harness::with_fallback(cache.clone());

    h.coordinator.start(Platform::Whatsapp).await.unwrap();
    cache
        .write(&FallbackEntry::ready("session-1", pages(2), None))
        .unwrap();

    let snapshot = h.wait_for(SessionState::PagesReady).await;
    assert_eq!(snapshot.resources.len(), 2);
    assert!(cache.read("session-1").unwrap().is_none());
    assert!(cache.pending("session-1").unwrap().is_none());

    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        ConnectEvent::ResourcesReady { channel: DeliveryChannel::Fallback, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn message_for_another_session_is_ignored() {
    let mut h = Harness::new();
    h.coordinator.start(Platform::Facebook).await.unwrap();

    h.channel.post(ready_message("session-old", &pages(1)));
    h.channel.post(serde_json::json!({"type": "devtools", "payload": 1}));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.coordinator.snapshot().await.state, SessionState::AwaitingAuthorization);

    h.channel.post(ready_message("session-1", &pages(2)));
    h.wait_for(SessionState::PagesReady).await;
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn authorization_times_out_after_300s() {
    let mut h = Harness::new();
    h.coordinator.start(Platform::Facebook).await.unwrap();
    let started = Instant::now();

    let snapshot = h.wait_for(SessionState::Failed).await;
    assert!(started.elapsed() >= Duration::from_secs(300));
    assert!(snapshot.last_error.unwrap().contains("timed out"));
    assert!(snapshot.session_id.is_none());
    assert_eq!(h.channel.close_count(), 1);

    let polls = h.backend.call_count(Operation::PollSession);
    assert!(polls >= 149, "expected polling every 2s, got {}", polls);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.backend.call_count(Operation::PollSession), polls);

    // Cancelling afterwards is harmless and does not close the window again.
    h.coordinator.cancel().await;
    h.coordinator.cancel().await;
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);
    assert_eq!(h.channel.close_count(), 1);

    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        ConnectEvent::SessionFailed { kind: "authorization_timeout", .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn poll_errors_keep_polling() {
    let mut h = Harness::new();
    h.backend.fail_next(Operation::PollSession, BackendError::Transport("reset".into()));
    h.backend.fail_next(Operation::PollSession, BackendError::NotFound);
    h.backend.script_poll("session-1", vec![ready(pages(2))]);

    h.coordinator.start(Platform::Facebook).await.unwrap();
    h.wait_for(SessionState::PagesReady).await;
    assert_eq!(h.backend.call_count(Operation::PollSession), 3);
}

#[tokio::test(start_paused = true)]
async fn provider_error_fails_with_message() {
    let mut h = Harness::new();
    h.backend.script_poll(
        "session-1",
        vec![PollResponse {
            error: Some("User denied access".into()),
            ..PollResponse::default()
        }],
    );

    h.coordinator.start(Platform::Facebook).await.unwrap();
    let snapshot = h.wait_for(SessionState::Failed).await;
    assert!(snapshot.last_error.unwrap().contains("User denied access"));
    assert_eq!(h.channel.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_resource_list_fails_and_start_retries() {
    let mut h = Harness::new();
    h.backend.script_poll("session-1", vec![ready(Vec::new())]);

    h.coordinator.start(Platform::Facebook).await.unwrap();
    let snapshot = h.wait_for(SessionState::Failed).await;
    assert!(snapshot.last_error.unwrap().contains("No eligible"));

    let snapshot = h.coordinator.start(Platform::Facebook).await.unwrap();
    assert_eq!(snapshot.state, SessionState::AwaitingAuthorization);
    assert_eq!(snapshot.session_id.as_deref(), Some("session-2"));
}

#[tokio::test(start_paused = true)]
async fn init_failure_leaves_no_live_session() {
    let mut h = Harness::new();
    h.backend
        .fail_next(Operation::InitAuthorization, BackendError::Transport("offline".into()));

    let err = h.coordinator.start(Platform::Telegram).await.unwrap_err();
    assert!(matches!(err, ConnectError::InitializationFailure(_)));
    assert_eq!(h.channel.open_count(), 0);

    let snapshot = h.coordinator.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Failed);
    assert!(snapshot.session_id.is_none());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.backend.call_count(Operation::PollSession), 0);

    h.coordinator.start(Platform::Telegram).await.unwrap();
    h.wait_for(SessionState::AwaitingAuthorization).await;
}

#[tokio::test(start_paused = true)]
async fn blocked_popup_keeps_waiting() {
    let channel = RecordingChannel::blocked();
    let mut h = Harness::with_channel(channel);
    h.backend.script_poll("session-1", vec![ready(pages(2))]);

    let snapshot = h.coordinator.start(Platform::Facebook).await.unwrap();
    assert_eq!(snapshot.state, SessionState::AwaitingAuthorization);
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        ConnectEvent::PopupBlocked { authorization_url, .. } if authorization_url.contains("session-1")
    )));

    h.wait_for(SessionState::PagesReady).await;
    // Nothing was opened, so nothing is closed.
    assert_eq!(h.channel.close_count(), 0);
}

// =============================================================================
// Partial finalization and reconnection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn mapping_failure_leaves_flagged_account_and_retry_repairs_it() {
    let mut h = Harness::new();
    h.backend.script_poll("session-1", vec![ready(pages(1))]);
    h.coordinator.start(Platform::Facebook).await.unwrap();
    h.wait_for(SessionState::Configuring).await;

    h.backend.fail_next(
        Operation::CreateMapping,
        BackendError::Status {
            status: 503,
            message: "unavailable".into(),
        },
    );
    let err = h.coordinator.finalize(None).await.unwrap_err();
    assert!(err.is_partial_success());

    let accounts = h.backend.accounts();
    assert_eq!(accounts.len(), 1);
    let orphan = accounts[0].clone();
    assert!(h.backend.mappings().is_empty());

    let snapshot = h.coordinator.snapshot().await;
    assert_eq!(snapshot.state, SessionState::PagesReady);
    assert!(snapshot.selected_resource.is_some());
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        ConnectEvent::AccountPartiallyConnected { account_id, .. } if *account_id == orphan.id
    )));

    // Right after the write the account is still inside the mapping grace period.
    let fresh = ReconnectionDetector::new(h.backend.clone(), vec![Platform::Facebook]);
    assert!(fresh.scan().await.unwrap().notice.is_none());

    // A later load flags it and persists needs_reconnect.
    let detector = Arc::new(
        ReconnectionDetector::new(h.backend.clone(), vec![Platform::Facebook])
            .with_mapping_grace(Duration::ZERO),
    );
    let manager = AccountManager::new(h.backend.clone(), detector, h.coordinator.events());
    let listing = manager.load().await.unwrap();
    let notice = listing.notice.unwrap();
    assert_eq!(notice.accounts.len(), 1);
    assert_eq!(notice.accounts[0].account_id, orphan.id);
    assert_eq!(notice.accounts[0].reason, ReconnectReason::MissingMapping);
    assert_eq!(listing.accounts[0].verification_status, VerificationStatus::NeedsReconnect);

    // Retrying from the retained selection reuses the account.
    let account = h.coordinator.finalize(None).await.unwrap();
    assert_eq!(account.id, orphan.id);
    assert_eq!(account.verification_status, VerificationStatus::Verified);
    assert_eq!(h.backend.accounts().len(), 1);
    assert_eq!(h.backend.mappings().len(), 1);
    assert_eq!(h.backend.call_count(Operation::CreateAccount), 1);
}

#[tokio::test(start_paused = true)]
async fn account_write_failure_is_retryable() {
    let mut h = Harness::new();
    h.backend.script_poll("session-1", vec![ready(pages(1))]);
    h.coordinator.start(Platform::Facebook).await.unwrap();
    h.wait_for(SessionState::Configuring).await;

    h.backend
        .fail_next(Operation::CreateAccount, BackendError::Transport("reset".into()));
    let err = h.coordinator.finalize(None).await.unwrap_err();
    assert!(!err.is_partial_success());
    assert!(h.backend.accounts().is_empty());
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::PagesReady);

    h.coordinator.finalize(None).await.unwrap();
    assert_eq!(h.backend.accounts().len(), 1);
    assert_eq!(h.backend.mappings().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn repair_updates_existing_account() {
    let mut h = Harness::new();
    let existing = h.backend.seed_account(NewWebhookAccount {
        tenant_id: TENANT.into(),
        platform: Platform::Instagram,
        external_resource_id: "page-1".into(),
        display_name: "Acme Page 1".into(),
        credential_token: None,
        is_active: true,
        verification_status: VerificationStatus::TokenExpired,
        ai_enabled: true,
        auto_reply: false,
    });
    h.backend.seed_mapping(NewRoutingMapping {
        tenant_id: TENANT.into(),
        account_id: existing.id,
        platform: Platform::Instagram,
        external_resource_id: "page-1".into(),
    });
    h.backend.script_poll("session-1", vec![ready(pages(1))]);

    let snapshot = h.coordinator.start_repair(existing.id).await.unwrap();
    assert_eq!(snapshot.platform, Some(Platform::Instagram));
    assert_eq!(snapshot.mode, SessionMode::Repair { account_id: existing.id });

    h.wait_for(SessionState::Configuring).await;
    let account = h.coordinator.finalize(None).await.unwrap();

    assert_eq!(account.id, existing.id);
    assert_eq!(account.verification_status, VerificationStatus::Verified);
    assert_eq!(account.credential_token.as_ref().map(|t| t.expose()), Some("token-1"));
    assert!(account.ai_enabled);
    assert_eq!(h.backend.accounts().len(), 1);
    assert_eq!(h.backend.mappings().len(), 1);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn second_start_reuses_the_session() {
    let h = Harness::new();
    let first = h.coordinator.start(Platform::Facebook).await.unwrap();
    let second = h.coordinator.start(Platform::Facebook).await.unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(h.backend.call_count(Operation::InitAuthorization), 1);
    assert_eq!(h.channel.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn start_for_another_platform_replaces_the_session() {
    let mut h = Harness::new();
    h.coordinator.start(Platform::Facebook).await.unwrap();
    let snapshot = h.coordinator.start(Platform::Telegram).await.unwrap();

    assert_eq!(snapshot.platform, Some(Platform::Telegram));
    assert_eq!(snapshot.session_id.as_deref(), Some("session-2"));
    assert_eq!(h.channel.open_count(), 2);
    assert_eq!(h.channel.close_count(), 1);
    assert!(h.drain_events().iter().any(|e| matches!(e, ConnectEvent::SessionCancelled)));

    // Results for the replaced session are stale.
    h.channel.post(ready_message("session-1", &pages(1)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::AwaitingAuthorization);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_polling_and_closes_once() {
    let h = Harness::new();
    h.backend.script_poll("session-1", vec![pending(), pending(), ready(pages(1))]);
    h.coordinator.start(Platform::Facebook).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    h.coordinator.cancel().await;
    h.coordinator.cancel().await;
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);
    assert_eq!(h.channel.close_count(), 1);

    let polls = h.backend.call_count(Operation::PollSession);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.backend.call_count(Operation::PollSession), polls);
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_auto_select_discards_it() {
    let mut h = Harness::new();
    h.backend.script_poll("session-1", vec![ready(pages(1))]);
    h.coordinator.start(Platform::Facebook).await.unwrap();
    h.wait_for(SessionState::PagesReady).await;

    h.coordinator.cancel().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = h.coordinator.snapshot().await;
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.selected_resource.is_none());
}

#[tokio::test(start_paused = true)]
async fn resume_applies_recent_fallback_entry() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    cache
        .write(&FallbackEntry::ready("session-9", pages(1), None))
        .unwrap();
    cache
        .record_pending(&PendingSession::new("session-9", Platform::Facebook, SessionMode::Create))
        .unwrap();
    let mut stale = FallbackEntry::ready("session-3", pages(2), None);
    stale.written_at = Utc::now() - chrono::Duration::minutes(5);
    cache.write(&stale).unwrap();

    let mut h = Harness::with_fallback(cache.clone());
    let snapshot = h.coordinator.resume_abandoned(Platform::Facebook).await.unwrap();
    assert_eq!(snapshot.state, SessionState::PagesReady);
    assert_eq!(snapshot.session_id.as_deref(), Some("session-9"));

    let snapshot = h.wait_for(SessionState::Configuring).await;
    assert_eq!(snapshot.selected_resource.unwrap().external_id, "page-1");
    assert!(cache.read("session-9").unwrap().is_none());
    assert!(cache.pending("session-9").unwrap().is_none());
    assert!(cache.read("session-3").unwrap().is_none());

    h.coordinator.finalize(None).await.unwrap();
    assert_eq!(h.backend.accounts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resume_without_recent_entry_does_nothing() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    let h = Harness::with_fallback(cache);

    assert!(h.coordinator.resume_abandoned(Platform::Facebook).await.is_none());
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn start_records_the_issued_platform_until_cancelled() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    let h = Harness::with_fallback(cache.clone());

    h.coordinator.start(Platform::Whatsapp).await.unwrap();
    let pending = cache.pending("session-1").unwrap().unwrap();
    assert_eq!(pending.platform, Platform::Whatsapp);
    assert_eq!(pending.mode, SessionMode::Create);

    h.coordinator.cancel().await;
    assert!(cache.pending("session-1").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn resume_ignores_entry_issued_for_another_platform() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    cache
        .write(&FallbackEntry::ready("session-9", pages(1), None))
        .unwrap();
    cache
        .record_pending(&PendingSession::new("session-9", Platform::Instagram, SessionMode::Create))
        .unwrap();
    let h = Harness::with_fallback(cache.clone());

    assert!(h.coordinator.resume_abandoned(Platform::Facebook).await.is_none());
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);
    assert!(cache.read("session-9").unwrap().is_some());

    let snapshot = h.coordinator.resume_abandoned(Platform::Instagram).await.unwrap();
    assert_eq!(snapshot.platform, Some(Platform::Instagram));
}

#[tokio::test(start_paused = true)]
async fn resume_ignores_entry_without_pending_record() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    cache
        .write(&FallbackEntry::ready("session-9", pages(1), None))
        .unwrap();
    let h = Harness::with_fallback(cache);

    assert!(h.coordinator.resume_abandoned(Platform::Facebook).await.is_none());
    assert_eq!(h.coordinator.snapshot().await.state, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn resumed_repair_session_updates_the_original_account() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    let mut h = Harness::with_fallback(cache.clone());
    let existing = h.backend.seed_account(NewWebhookAccount {
        tenant_id: TENANT.into(),
        platform: Platform::Instagram,
        external_resource_id: "page-1".into(),
        display_name: "Acme Page 1".into(),
        credential_token: None,
        is_active: true,
        verification_status: VerificationStatus::TokenExpired,
        ai_enabled: false,
        auto_reply: true,
    });

    let mode = SessionMode::Repair { account_id: existing.id };
    cache
        .write(&FallbackEntry::ready("session-9", pages(1), None))
        .unwrap();
    cache
        .record_pending(&PendingSession::new("session-9", Platform::Instagram, mode))
        .unwrap();

    let snapshot = h.coordinator.resume_abandoned(Platform::Instagram).await.unwrap();
    assert_eq!(snapshot.mode, mode);

    h.wait_for(SessionState::Configuring).await;
    let account = h.coordinator.finalize(None).await.unwrap();
    assert_eq!(account.id, existing.id);
    assert_eq!(account.verification_status, VerificationStatus::Verified);
    assert_eq!(h.backend.accounts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resume_or_start_prefers_an_abandoned_result() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    cache
        .write(&FallbackEntry::ready("session-9", pages(1), None))
        .unwrap();
    cache
        .record_pending(&PendingSession::new("session-9", Platform::Facebook, SessionMode::Create))
        .unwrap();
    let mut h = Harness::with_fallback(cache);

    let snapshot = h.coordinator.resume_or_start(Platform::Facebook).await.unwrap();
    assert_eq!(snapshot.session_id.as_deref(), Some("session-9"));
    assert!(snapshot.authorization_url.is_none());
    assert_eq!(h.backend.call_count(Operation::InitAuthorization), 0);
    assert_eq!(h.channel.open_count(), 0);

    h.wait_for(SessionState::Configuring).await;
    h.coordinator.finalize(None).await.unwrap();
    assert_eq!(h.backend.accounts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resume_or_start_starts_when_nothing_is_abandoned() {
    let dir = tempdir().unwrap();
    let cache = FallbackCache::open(dir.path()).unwrap();
    let h = Harness::with_fallback(cache);

    let snapshot = h.coordinator.resume_or_start(Platform::Facebook).await.unwrap();
    assert_eq!(snapshot.state, SessionState::AwaitingAuthorization);
    assert!(snapshot.authorization_url.is_some());
    assert_eq!(h.backend.call_count(Operation::InitAuthorization), 1);
    assert_eq!(h.channel.open_count(), 1);
}
