//! Refund handler: gives back one unit of a usage counter.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{period_start, AuditReason, Metric, QuotaAuditEntry, RefundResult};
use crate::services::audit::AuditLogger;
use crate::services::clock::Clock;
use crate::services::engine::retry_serializable;
use crate::services::metrics::record_decision;
use crate::services::store::QuotaStore;

pub struct RefundHandler {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
    max_serialization_retries: u32,
}

impl RefundHandler {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
        max_serialization_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            max_serialization_retries,
        }
    }

    /// Decrement the current period's counter by one, never below zero.
    /// `reference` names what is being refunded, e.g. a deleted project.
    #[instrument(skip(self), fields(user_id = %user_id, metric = %metric))]
    pub async fn refund(
        &self,
        user_id: Uuid,
        metric: Metric,
        reference: Option<&str>,
    ) -> Result<RefundResult, QuotaError> {
        let now = self.clock.now();
        let period = period_start(now);

        let (previous_usage, new_usage) =
            retry_serializable("refund", self.max_serialization_retries, || async move {
                let mut tx = self.store.begin().await?;
                let previous = tx.lock_usage(user_id, metric, period, now).await?;
                let new = (previous - 1).max(0);
                if new != previous {
                    tx.set_usage(user_id, metric, period, new, now).await?;
                }
                tx.commit().await?;
                Ok::<_, QuotaError>((previous, new))
            })
            .await?;

        let message = if previous_usage == new_usage {
            "nothing to refund"
        } else {
            AuditReason::Refund.message()
        };
        info!(previous_usage, new_usage, "Usage refunded");

        record_decision(metric.as_str(), AuditReason::Refund.as_str());
        self.audit
            .record(QuotaAuditEntry::new(
                user_id,
                Some(metric),
                1,
                true,
                AuditReason::Refund,
                json!({
                    "previous_usage": previous_usage,
                    "new_usage": new_usage,
                    "period_start": period,
                    "reference": reference,
                }),
                now,
            ))
            .await;

        Ok(RefundResult {
            success: true,
            previous_usage,
            new_usage,
            message: message.to_string(),
        })
    }
}
