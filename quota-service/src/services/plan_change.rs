//! Plan-change preserver.
//!
//! Usage counters are keyed by period, not by plan, so a mid-period plan
//! change never resets them. This records what they were at the moment of
//! the change and feeds the `plan_changed` annotation of later decisions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{
    period_start, AuditReason, Metric, PlanChangeRecord, QuotaAuditEntry, SubscriptionChange,
    MAX_PLAN_NAME_LEN,
};
use crate::services::audit::AuditLogger;
use crate::services::clock::Clock;
use crate::services::engine::retry_serializable;
use crate::services::plans::PlanLookup;
use crate::services::store::QuotaStore;

pub struct PlanChangePreserver {
    store: Arc<dyn QuotaStore>,
    plans: Arc<dyn PlanLookup>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
    max_serialization_retries: u32,
}

impl PlanChangePreserver {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        plans: Arc<dyn PlanLookup>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
        max_serialization_retries: u32,
    ) -> Self {
        Self {
            store,
            plans,
            clock,
            audit,
            max_serialization_retries,
        }
    }

    #[instrument(skip(self, change), fields(user_id = %change.user_id))]
    pub async fn on_subscription_change(
        &self,
        change: &SubscriptionChange,
    ) -> Result<PlanChangeRecord, QuotaError> {
        if change.old_plan.trim().is_empty() || change.new_plan.trim().is_empty() {
            return Err(QuotaError::InvalidRequest(
                "old_plan and new_plan are required".to_string(),
            ));
        }
        let too_long = |name: &str| name.chars().count() > MAX_PLAN_NAME_LEN;
        if too_long(&change.old_plan) || too_long(&change.new_plan) {
            return Err(QuotaError::InvalidRequest(format!(
                "plan names are limited to {} characters",
                MAX_PLAN_NAME_LEN
            )));
        }

        let now = self.clock.now();
        let period = period_start(now);

        let record = retry_serializable(
            "record_plan_change",
            self.max_serialization_retries,
            || async move {
                let mut tx = self.store.begin().await?;
                let record = PlanChangeRecord {
                    change_id: Uuid::new_v4(),
                    user_id: change.user_id,
                    old_plan: change.old_plan.clone(),
                    new_plan: change.new_plan.clone(),
                    effective_at: change.effective_at,
                    period_start: period,
                    usage_snapshot: snapshot(tx.period_usage(change.user_id, period).await?),
                    recorded_utc: now,
                };
                tx.insert_plan_change(&record).await?;
                tx.commit().await?;
                Ok::<_, QuotaError>(record)
            },
        )
        .await?;

        self.plans
            .plan_changed(change.user_id, &change.new_plan)
            .await;

        info!(
            old_plan = %record.old_plan,
            new_plan = %record.new_plan,
            "Plan change recorded"
        );

        self.audit
            .record(QuotaAuditEntry::new(
                change.user_id,
                None,
                0,
                true,
                AuditReason::PlanChanged,
                json!({
                    "change_id": record.change_id,
                    "old_plan": record.old_plan,
                    "new_plan": record.new_plan,
                    "effective_at": record.effective_at,
                    "period_start": record.period_start,
                    "usage_snapshot": record.usage_snapshot,
                }),
                now,
            ))
            .await;

        Ok(record)
    }
}

/// Every metric, zero where the period has no counter yet.
fn snapshot(usage: Vec<(Metric, i64)>) -> BTreeMap<Metric, i64> {
    let mut snapshot: BTreeMap<Metric, i64> =
        Metric::ALL.into_iter().map(|metric| (metric, 0)).collect();
    snapshot.extend(usage);
    snapshot
}
