//! Common test utilities for quota-service integration tests.
//!
//! Most of the suite runs on the in-process store with a hand-driven clock.
//! [`postgres`] sets up an isolated schema for the database-backed tests.

#![allow(dead_code)]

pub mod postgres;

use chrono::{DateTime, TimeZone, Utc};
use quota_service::config::QuotaSettings;
use quota_service::models::{ConsumeRequest, CreateBonusGrant, Metric, QuotaDecision};
use quota_service::services::{
    Clock, ManualClock, MemoryStore, PlanLookup, QuotaService, QuotaStore, StaticPlanCatalog,
};
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,quota_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Mid-month, mid-day, so period and day boundaries are far away.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<StaticPlanCatalog>,
    pub clock: Arc<ManualClock>,
    pub quota: Arc<QuotaService>,
}

impl TestApp {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn consume(&self, user_id: Uuid, metric: Metric, amount: i64) -> QuotaDecision {
        self.quota
            .check_and_consume(&ConsumeRequest::new(user_id, metric, amount))
            .await
            .expect("check_and_consume failed")
    }

    pub async fn consume_with_key(
        &self,
        user_id: Uuid,
        metric: Metric,
        amount: i64,
        key: &str,
    ) -> QuotaDecision {
        self.quota
            .check_and_consume(&ConsumeRequest::new(user_id, metric, amount).with_idempotency_key(key))
            .await
            .expect("check_and_consume failed")
    }

    pub async fn usage(&self, user_id: Uuid, metric: Metric) -> i64 {
        self.quota
            .get_usage(user_id, metric)
            .await
            .expect("get_usage failed")
            .current_usage
    }

    pub async fn grant_bonus(
        &self,
        user_id: Uuid,
        metric: Metric,
        amount: i64,
        expires_in: Option<chrono::Duration>,
    ) -> Uuid {
        self.quota
            .add_bonus_grant(
                user_id,
                &CreateBonusGrant {
                    metric,
                    amount,
                    expires_at: expires_in.map(|d| self.now() + d),
                },
            )
            .await
            .expect("add_bonus_grant failed")
            .grant_id
    }
}

/// Test app with default settings.
pub fn spawn_app() -> TestApp {
    spawn_app_with(QuotaSettings::default())
}

pub fn spawn_app_with(settings: QuotaSettings) -> TestApp {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(StaticPlanCatalog::with_default_plans());
    let clock = Arc::new(ManualClock::new(start_time()));

    let quota = Arc::new(QuotaService::new(
        store.clone() as Arc<dyn QuotaStore>,
        catalog.clone() as Arc<dyn PlanLookup>,
        clock.clone() as Arc<dyn Clock>,
        settings,
    ));

    TestApp {
        store,
        catalog,
        clock,
        quota,
    }
}

/// Settings with throttling out of the way, for tests that issue many calls.
pub fn unthrottled() -> QuotaSettings {
    QuotaSettings {
        rate_limit_per_minute: 10_000,
        ..QuotaSettings::default()
    }
}
