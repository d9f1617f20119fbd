//! Audit trail and maintenance integration tests.

mod common;

use chrono::Duration;
use common::spawn_app;
use quota_service::models::{AuditReason, Metric};
use uuid::Uuid;

#[tokio::test]
async fn audit_outage_does_not_block_decisions() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    app.store.set_audit_failure(true);

    let decision = app.consume(user, Metric::Exports, 1).await;

    assert!(decision.allowed);
    assert_eq!(app.usage(user, Metric::Exports).await, 1);
    assert!(app.store.audit_entries().is_empty());
    assert_eq!(app.quota.audit_logger().deferred_len(), 1);
}

#[tokio::test]
async fn maintenance_flushes_deferred_entries() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    app.store.set_audit_failure(true);
    app.consume(user, Metric::Exports, 1).await;
    app.consume(user, Metric::Exports, 1).await;

    // Still failing: nothing is lost.
    app.quota.run_maintenance().await.unwrap();
    assert_eq!(app.quota.audit_logger().deferred_len(), 2);

    app.store.set_audit_failure(false);
    app.quota.run_maintenance().await.unwrap();

    assert_eq!(app.quota.audit_logger().deferred_len(), 0);
    let entries = app.store.audit_entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.reason == AuditReason::Success));
}

#[tokio::test]
async fn every_outcome_is_audited_once() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    app.consume(user, Metric::Projects, 3).await;
    app.consume(user, Metric::Projects, 1).await;
    app.consume_with_key(user, Metric::Exports, 1, "a").await;
    app.consume_with_key(user, Metric::Exports, 1, "a").await;
    app.consume_with_key(user, Metric::Exports, 2, "a").await;

    let reasons: Vec<_> = app
        .quota
        .recent_audit(user, 10)
        .await
        .unwrap()
        .into_iter()
        .rev()
        .map(|e| e.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            AuditReason::Success,
            AuditReason::QuotaExceeded,
            AuditReason::Success,
            AuditReason::IdempotentReplay,
            AuditReason::Collision,
        ]
    );
}

#[tokio::test]
async fn recent_audit_is_newest_first_and_limited() {
    let app = spawn_app();
    let user = Uuid::new_v4();

    for amount in 1..=3 {
        app.consume(user, Metric::ApiCalls, amount).await;
        app.clock.advance(Duration::seconds(1));
    }

    let audit = app.quota.recent_audit(user, 2).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].attempted_amount, 3);
    assert_eq!(audit[1].attempted_amount, 2);
    assert!(audit[0].created_at > audit[1].created_at);
}

#[tokio::test]
async fn maintenance_prunes_expired_records() {
    let app = spawn_app();
    let user = Uuid::new_v4();
    app.consume_with_key(user, Metric::Exports, 1, "old-key").await;

    let report = app.quota.run_maintenance().await.unwrap();
    assert_eq!(report.idempotency_records, 0);
    assert_eq!(report.audit_entries, 0);
    assert_eq!(report.rate_windows, 0);

    app.clock.advance(Duration::days(181));
    let report = app.quota.run_maintenance().await.unwrap();

    assert_eq!(report.idempotency_records, 1);
    assert_eq!(report.audit_entries, 1);
    assert_eq!(report.rate_windows, 1);
    assert!(app.store.idempotency_record(user, "old-key").await.is_none());
}
