//! Idempotent replay and collision handling through the decision engine.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{spawn_app, spawn_app_with, unthrottled};
use quota_service::error::QuotaError;
use quota_service::models::{AuditReason, ConsumeRequest, Metric, MAX_IDEMPOTENCY_KEY_LEN};
use uuid::Uuid;

#[tokio::test]
async fn repeated_key_replays_without_consuming_again() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    let first = app.consume_with_key(user, Metric::Exports, 2, "export-42").await;
    let second = app.consume_with_key(user, Metric::Exports, 2, "export-42").await;

    assert!(first.allowed);
    assert!(!first.already_processed);
    assert!(second.allowed);
    assert!(second.already_processed);
    assert_eq!(second.reason, AuditReason::Success);
    assert_eq!(second.remaining, first.remaining);
    assert_eq!(app.usage(user, Metric::Exports).await, 2);

    let audit = app.quota.recent_audit(user, 1).await.unwrap();
    assert_eq!(audit[0].reason, AuditReason::IdempotentReplay);
    assert_eq!(audit[0].context["original_reason"], "success");
}

#[tokio::test]
async fn replay_is_honoured_outside_the_collision_window() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    app.consume_with_key(user, Metric::Exports, 1, "k-late").await;
    app.clock.advance(Duration::minutes(10));
    let replay = app.consume_with_key(user, Metric::Exports, 1, "k-late").await;

    assert!(replay.already_processed);
    assert_eq!(app.usage(user, Metric::Exports).await, 1);
}

#[tokio::test]
async fn key_reused_with_different_parameters_is_a_collision() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    app.consume_with_key(user, Metric::Exports, 1, "k-1").await;
    let decision = app.consume_with_key(user, Metric::Exports, 2, "k-1").await;

    assert!(!decision.allowed);
    assert!(!decision.already_processed);
    assert_eq!(decision.reason, AuditReason::Collision);
    assert_eq!(app.usage(user, Metric::Exports).await, 1);

    let record = app.store.idempotency_record(user, "k-1").await.unwrap();
    assert!(record.collision_flagged);
    assert_eq!(record.collision_count, 1);
    // The original decision stays stored for genuine retries.
    assert!(record.result.as_ref().is_some_and(|d| d.allowed));

    let audit = app.quota.recent_audit(user, 1).await.unwrap();
    assert_eq!(audit[0].reason, AuditReason::Collision);
    assert!(!audit[0].success);
    assert_eq!(audit[0].context["within_window"], true);
    assert_eq!(audit[0].context["original_amount"], 1);
}

#[tokio::test]
async fn collision_outside_the_window_is_flagged_as_such() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    app.consume_with_key(user, Metric::Exports, 1, "k-2").await;
    app.clock.advance(Duration::minutes(6));
    let decision = app.consume_with_key(user, Metric::AiGenerations, 1, "k-2").await;

    assert_eq!(decision.reason, AuditReason::Collision);
    assert_eq!(app.usage(user, Metric::AiGenerations).await, 0);

    let audit = app.quota.recent_audit(user, 1).await.unwrap();
    assert_eq!(audit[0].context["within_window"], false);
}

#[tokio::test]
async fn denials_are_replayed_too() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    app.consume(user, Metric::Projects, 3).await;
    let denied = app.consume_with_key(user, Metric::Projects, 1, "proj-4").await;
    assert!(!denied.allowed);

    // Freeing capacity does not change the answer for the same key.
    app.quota.refund(user, Metric::Projects, None).await.unwrap();
    let replay = app.consume_with_key(user, Metric::Projects, 1, "proj-4").await;

    assert!(!replay.allowed);
    assert!(replay.already_processed);
    assert_eq!(replay.reason, AuditReason::QuotaExceeded);
    assert_eq!(app.usage(user, Metric::Projects).await, 2);
}

#[tokio::test]
async fn keys_are_scoped_per_user() {
    let app = spawn_app();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    app.consume_with_key(alice, Metric::Exports, 1, "shared").await;
    let decision = app.consume_with_key(bob, Metric::Exports, 1, "shared").await;

    assert!(decision.allowed);
    assert!(!decision.already_processed);
    assert_eq!(app.usage(bob, Metric::Exports).await, 1);
}

#[tokio::test]
async fn blank_keys_are_ignored() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    let first = app.consume_with_key(user, Metric::Exports, 1, "   ").await;
    let second = app.consume_with_key(user, Metric::Exports, 1, "").await;

    assert!(!first.already_processed);
    assert!(!second.already_processed);
    assert_eq!(app.usage(user, Metric::Exports).await, 2);
}

#[tokio::test]
async fn overlong_keys_are_rejected_before_any_debit() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    let request = ConsumeRequest::new(user, Metric::Exports, 1)
        .with_idempotency_key("k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1));

    let result = app.quota.check_and_consume(&request).await;

    assert!(matches!(result, Err(QuotaError::InvalidRequest(_))));
    assert_eq!(app.usage(user, Metric::Exports).await, 0);

    let longest = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN);
    assert!(app.consume_with_key(user, Metric::Exports, 1, &longest).await.allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_consume_once() {
    let app = spawn_app_with(unthrottled());
    let user = Uuid::new_v4();

    let tasks = (0..8).map(|_| {
        let quota = Arc::clone(&app.quota);
        tokio::spawn(async move {
            quota
                .check_and_consume(
                    &ConsumeRequest::new(user, Metric::AiGenerations, 1)
                        .with_idempotency_key("burst"),
                )
                .await
                .unwrap()
        })
    });
    let decisions: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert!(decisions.iter().all(|d| d.allowed));
    assert_eq!(decisions.iter().filter(|d| !d.already_processed).count(), 1);
    assert_eq!(app.usage(user, Metric::AiGenerations).await, 1);
}
