//! Quota ledger tests against PostgreSQL.
//!
//! Run with `TEST_DATABASE_URL` pointing at a scratch database:
//! `cargo test -p quota-service --test postgres_test -- --ignored`

mod common;

use chrono::Duration;
use common::postgres::PgTestApp;
use common::unthrottled;
use futures::future::join_all;
use quota_service::config::QuotaSettings;
use quota_service::error::QuotaError;
use quota_service::models::{
    period_start, AuditReason, BucketSource, ConsumeRequest, Metric, SubscriptionChange,
};
use quota_service::services::{Clock, QuotaStore};
use uuid::Uuid;

fn contended() -> QuotaSettings {
    QuotaSettings {
        max_serialization_retries: 25,
        ..unthrottled()
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn health_check_reaches_the_database() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;

    app.db.health_check().await.unwrap();

    app.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn concurrent_consumers_never_overdraw() {
    let app = PgTestApp::spawn(contended()).await;
    let user = Uuid::new_v4();

    let calls = (0..12).map(|_| {
        let quota = app.quota.clone();
        async move {
            quota
                .check_and_consume(&ConsumeRequest::new(user, Metric::Projects, 1))
                .await
        }
    });
    let results = join_all(calls).await;

    let mut allowed = 0;
    for result in results {
        match result {
            Ok(decision) if decision.allowed => allowed += 1,
            Ok(decision) => assert_eq!(decision.reason, AuditReason::QuotaExceeded),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let usage = app.quota.get_usage(user, Metric::Projects).await.unwrap();
    assert_eq!(allowed, 3);
    assert_eq!(usage.current_usage, 3);

    app.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn concurrent_duplicate_keys_consume_once() {
    let app = PgTestApp::spawn(contended()).await;
    let user = Uuid::new_v4();

    let calls = (0..8).map(|_| {
        let quota = app.quota.clone();
        async move {
            quota
                .check_and_consume(
                    &ConsumeRequest::new(user, Metric::Exports, 1)
                        .with_idempotency_key("order-42"),
                )
                .await
        }
    });
    let decisions: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    assert!(decisions.iter().all(|d| d.allowed));
    assert_eq!(decisions.iter().filter(|d| !d.already_processed).count(), 1);
    assert_eq!(
        app.quota
            .get_usage(user, Metric::Exports)
            .await
            .unwrap()
            .current_usage,
        1
    );

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn collision_is_flagged_in_storage() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();
    let request = ConsumeRequest::new(user, Metric::Exports, 1).with_idempotency_key("k-1");

    app.quota.check_and_consume(&request).await.unwrap();
    let changed = ConsumeRequest {
        amount: 2,
        ..request.clone()
    };
    let decision = app.quota.check_and_consume(&changed).await.unwrap();

    assert!(!decision.allowed);
    assert_eq!(decision.reason, AuditReason::Collision);
    let (flagged, count): (bool, i32) = sqlx::query_as(
        "SELECT collision_flagged, collision_count FROM idempotency_records WHERE user_id = $1",
    )
    .bind(user)
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert!(flagged);
    assert_eq!(count, 1);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn bonus_grants_cover_overage() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();
    app.quota
        .add_bonus_grant(
            user,
            &quota_service::models::CreateBonusGrant {
                metric: Metric::Exports,
                amount: 4,
                expires_at: Some(app.clock.now() + Duration::days(7)),
            },
        )
        .await
        .unwrap();

    let decision = app
        .quota
        .check_and_consume(&ConsumeRequest::new(user, Metric::Exports, 7))
        .await
        .unwrap();

    assert!(decision.allowed);
    assert_eq!(decision.bonus_used, 2);
    assert_eq!(
        app.quota
            .get_usage(user, Metric::Exports)
            .await
            .unwrap()
            .current_usage,
        5
    );

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn balance_round_trips_through_storage() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();

    app.quota.open_balance(user).await.unwrap();
    app.quota
        .grant_bucket(
            user,
            BucketSource::Package,
            3600,
            Some(app.clock.now() + Duration::days(90)),
        )
        .await
        .unwrap();
    app.quota.grant_daily_gift(user).await.unwrap();
    let spent = app.quota.consume_time(user, 1000).await.unwrap();

    assert_eq!(spent.bonus_seconds, 900);
    assert_eq!(spent.paid_seconds, 100);

    let view = app.quota.get_balance(user).await.unwrap();
    assert_eq!(view.buckets.len(), 3);
    assert_eq!(view.total_bonus_seconds, 0);
    assert_eq!(view.total_paid_seconds, 1800 + 3600 - 100);
    assert_eq!(view.daily_gift_used_today, 900);

    // The welcome bucket, drained first by expiry, is gone after 30 days.
    app.clock.advance(Duration::days(31));
    let view = app.quota.get_balance(user).await.unwrap();
    assert_eq!(view.total_paid_seconds, 3600);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn overflowing_bucket_leaves_stored_balance_intact() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();
    app.quota.open_balance(user).await.unwrap();

    let result = app
        .quota
        .grant_bucket(user, BucketSource::Package, i64::MAX, None)
        .await;

    assert!(matches!(result, Err(QuotaError::InvalidBucketState(_))));
    let view = app.quota.get_balance(user).await.unwrap();
    assert_eq!(view.buckets.len(), 1);
    assert_eq!(view.total_paid_seconds, 1800);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn refund_and_plan_change_use_stored_usage() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();
    app.quota
        .check_and_consume(&ConsumeRequest::new(user, Metric::Projects, 3))
        .await
        .unwrap();

    let refund = app.quota.refund(user, Metric::Projects, Some("p-1")).await.unwrap();
    assert_eq!(refund.previous_usage, 3);
    assert_eq!(refund.new_usage, 2);

    let record = app
        .quota
        .on_subscription_change(&SubscriptionChange {
            user_id: user,
            old_plan: "free".to_string(),
            new_plan: "pro".to_string(),
            effective_at: app.clock.now(),
        })
        .await
        .unwrap();
    assert_eq!(record.usage_snapshot[&Metric::Projects], 2);
    assert_eq!(app.catalog.plan_of(user), "pro");

    let decision = app
        .quota
        .check_and_consume(&ConsumeRequest::new(user, Metric::Projects, 1))
        .await
        .unwrap();
    assert!(decision.plan_changed);

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn usage_timestamps_come_from_the_service_clock() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();
    app.quota
        .check_and_consume(&ConsumeRequest::new(user, Metric::Exports, 1))
        .await
        .unwrap();

    let updated: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
        "SELECT updated_utc FROM usage_periods WHERE user_id = $1 AND period_start = $2",
    )
    .bind(user)
    .bind(period_start(app.clock.now()))
    .fetch_one(app.db.pool())
    .await
    .unwrap();
    assert_eq!(updated, app.clock.now());

    app.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn audit_is_written_and_pruned() {
    let app = PgTestApp::spawn(QuotaSettings::default()).await;
    let user = Uuid::new_v4();
    app.quota
        .check_and_consume(
            &ConsumeRequest::new(user, Metric::Exports, 1).with_idempotency_key("a"),
        )
        .await
        .unwrap();

    let audit = app.quota.recent_audit(user, 10).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].reason, AuditReason::Success);
    assert_eq!(audit[0].context["idempotency_key"], "a");

    app.clock.advance(Duration::days(181));
    let report = app.quota.run_maintenance().await.unwrap();
    assert_eq!(report.audit_entries, 1);
    assert_eq!(report.idempotency_records, 1);
    assert!(app.quota.recent_audit(user, 10).await.unwrap().is_empty());

    app.cleanup().await;
}
