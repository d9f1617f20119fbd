//! Quota decision engine.
//!
//! `check_and_consume` answers allow/deny for one metered request and
//! performs the debit. Order of evaluation:
//!
//! 1. rate limiter admission
//! 2. idempotency claim (replays and collisions short-circuit)
//! 3. plan limit lookup, with per-metric fallbacks
//! 4. locked read of the period usage counter
//! 5. debit from plan quota, or
//! 6. cover the overage from bonus grants, all or nothing
//! 7. one audit entry, written after commit
//! 8. `plan_changed` annotation
//!
//! Steps 2 to 6 and 8 share one serializable transaction. A serialization
//! conflict restarts the whole call from step 1.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::error::QuotaError;
use crate::models::{
    period_start, period_start_utc, AuditReason, ClaimOutcome, ConsumeRequest, QuotaAuditEntry,
    QuotaDecision, RequestFingerprint, MAX_IDEMPOTENCY_KEY_LEN,
};
use crate::services::audit::AuditLogger;
use crate::services::bonus::BonusAllocator;
use crate::services::clock::Clock;
use crate::services::idempotency::IdempotencyGuard;
use crate::services::ledger::BucketLedger;
use crate::services::metrics::{record_decision, SERIALIZATION_RETRIES_TOTAL};
use crate::services::plans::{resolve_limits, PlanLookup};
use crate::services::rate_limiter::{Admission, RateLimiter};
use crate::services::store::QuotaStore;

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(10);
const RETRY_MAX_INTERVAL: Duration = Duration::from_millis(250);

/// Run `op` again from the top while it fails with a serialization
/// conflict, up to `max_retries` extra attempts with jittered exponential
/// backoff between them. Any other error is returned at once.
pub(crate) async fn retry_serializable<T, F, Fut>(
    operation: &str,
    max_retries: u32,
    mut op: F,
) -> Result<T, QuotaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QuotaError>>,
{
    let backoff = ExponentialBackoff {
        initial_interval: RETRY_INITIAL_INTERVAL,
        max_interval: RETRY_MAX_INTERVAL,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempt = 0;
    retry(backoff, || {
        let this_attempt = attempt;
        attempt += 1;
        let pending = op();
        async move {
            match pending.await {
                Err(QuotaError::SerializationConflict) if this_attempt < max_retries => {
                    SERIALIZATION_RETRIES_TOTAL.inc();
                    debug!(
                        operation,
                        attempt = this_attempt + 1,
                        "Serialization conflict, retrying"
                    );
                    Err(backoff::Error::transient(QuotaError::SerializationConflict))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
                Ok(value) => Ok(value),
            }
        }
    })
    .await
}

/// Why a request that reached the usage check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shortfall {
    BonusCap,
    BonusExhausted,
}

impl Shortfall {
    fn as_str(&self) -> &'static str {
        match self {
            Shortfall::BonusCap => "monthly_bonus_cap",
            Shortfall::BonusExhausted => "bonus_exhausted",
        }
    }
}

pub struct QuotaEngine {
    store: Arc<dyn QuotaStore>,
    plans: Arc<dyn PlanLookup>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
    rate_limiter: RateLimiter,
    idempotency: IdempotencyGuard,
    bonus: BonusAllocator,
    ledger: BucketLedger,
    max_serialization_retries: u32,
}

impl QuotaEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn QuotaStore>,
        plans: Arc<dyn PlanLookup>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
        rate_limiter: RateLimiter,
        idempotency: IdempotencyGuard,
        ledger: BucketLedger,
        max_serialization_retries: u32,
    ) -> Self {
        Self {
            store,
            plans,
            clock,
            audit,
            rate_limiter,
            idempotency,
            bonus: BonusAllocator,
            ledger,
            max_serialization_retries,
        }
    }

    #[instrument(
        skip(self, request),
        fields(user_id = %request.user_id, metric = %request.metric, amount = request.amount)
    )]
    pub async fn check_and_consume(
        &self,
        request: &ConsumeRequest,
    ) -> Result<QuotaDecision, QuotaError> {
        if request.amount <= 0 {
            return Err(QuotaError::InvalidRequest(
                "amount must be a positive integer".to_string(),
            ));
        }
        if request
            .effective_key()
            .is_some_and(|key| key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(QuotaError::InvalidRequest(format!(
                "idempotency key is limited to {} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }

        retry_serializable("check_and_consume", self.max_serialization_retries, || {
            self.attempt(request)
        })
        .await
    }

    async fn attempt(&self, request: &ConsumeRequest) -> Result<QuotaDecision, QuotaError> {
        let now = self.clock.now();
        let key = request.effective_key();

        let identifier = request.rate_limit_identifier();
        if let Admission::Deny {
            count,
            retry_after_secs,
        } = self.rate_limiter.admit(&identifier, now).await
        {
            warn!(identifier = %identifier, count, "Request rate limited");
            let decision = QuotaDecision::rate_limited(retry_after_secs);
            self.finish(
                request,
                &decision,
                decision.reason,
                json!({
                    "identifier": identifier,
                    "window_count": count,
                    "ceiling": self.rate_limiter.ceiling(),
                    "retry_after_secs": retry_after_secs,
                    "caller_ip": request.caller_ip,
                    "idempotency_key": key,
                }),
                now,
            )
            .await;
            return Ok(decision);
        }

        let mut tx = self.store.begin().await?;

        if let Some(key) = key {
            let fingerprint = RequestFingerprint {
                metric: request.metric,
                amount: request.amount,
                requested_at: now,
            };
            match self
                .idempotency
                .claim(tx.as_mut(), request.user_id, key, &fingerprint)
                .await?
            {
                ClaimOutcome::Proceed => {}
                ClaimOutcome::Replay(stored) => {
                    tx.commit().await?;
                    debug!(idempotency_key = %key, "Replaying stored decision");
                    self.finish(
                        request,
                        &stored,
                        AuditReason::IdempotentReplay,
                        json!({
                            "idempotency_key": key,
                            "original_reason": stored.reason,
                            "caller_ip": request.caller_ip,
                        }),
                        now,
                    )
                    .await;
                    return Ok(stored);
                }
                ClaimOutcome::Collision {
                    original,
                    within_window,
                } => {
                    tx.commit().await?;
                    let decision = QuotaDecision::collision();
                    self.finish(
                        request,
                        &decision,
                        decision.reason,
                        json!({
                            "idempotency_key": key,
                            "original_metric": original.metric,
                            "original_amount": original.amount,
                            "original_requested_at": original.requested_at,
                            "within_window": within_window,
                            "caller_ip": request.caller_ip,
                        }),
                        now,
                    )
                    .await;
                    return Ok(decision);
                }
            }
        }

        let limits = resolve_limits(self.plans.as_ref(), request.user_id, request.metric).await;
        let limit = limits.effective_limit();

        let period = period_start(now);
        let usage_before = tx
            .lock_usage(request.user_id, request.metric, period, now)
            .await?;
        let base_remaining = (limit - usage_before).max(0);

        let mut bonus_needed = 0;
        let mut shortfall = None;
        let mut decision = if request.amount <= base_remaining {
            tx.set_usage(
                request.user_id,
                request.metric,
                period,
                usage_before + request.amount,
                now,
            )
            .await?;
            QuotaDecision::allowed(base_remaining - request.amount, limit, 0)
        } else {
            bonus_needed = request.amount - base_remaining;
            let mut balance = match tx.lock_balance(request.user_id).await? {
                Some(balance) => balance,
                None => self.ledger.new_balance(request.user_id, now),
            };
            let headroom = self.ledger.bonus_headroom(&mut balance, now);

            if bonus_needed > headroom {
                shortfall = Some(Shortfall::BonusCap);
                QuotaDecision::quota_exceeded(base_remaining, limit)
            } else {
                let allocation = self
                    .bonus
                    .allocate(tx.as_mut(), request.user_id, request.metric, bonus_needed, now)
                    .await?;
                if allocation.covers(bonus_needed) {
                    tx.set_usage(
                        request.user_id,
                        request.metric,
                        period,
                        usage_before + base_remaining,
                        now,
                    )
                    .await?;
                    self.ledger
                        .record_bonus_use(&mut balance, bonus_needed, now)?;
                    tx.save_balance(&balance).await?;
                    QuotaDecision::allowed(0, limit, bonus_needed)
                } else {
                    shortfall = Some(Shortfall::BonusExhausted);
                    QuotaDecision::quota_exceeded(base_remaining, limit)
                }
            }
        };

        decision.plan_changed = tx
            .plan_changed_between(request.user_id, period_start_utc(period), now)
            .await?;

        if let Some(key) = key {
            tx.complete_idempotency(request.user_id, key, &decision)
                .await?;
        }
        tx.commit().await?;

        let usage_after = if decision.allowed {
            usage_before + request.amount - decision.bonus_used
        } else {
            usage_before
        };
        if decision.allowed {
            info!(usage_before, usage_after, limit, bonus_used = decision.bonus_used, "Quota consumed");
        } else {
            info!(usage_before, limit, bonus_needed, "Quota exceeded");
        }

        self.finish(
            request,
            &decision,
            decision.reason,
            json!({
                "usage_before": usage_before,
                "usage_after": usage_after,
                "limit": limit,
                "plan_name": limits.plan_name,
                "period_start": period,
                "bonus_needed": bonus_needed,
                "bonus_used": decision.bonus_used,
                "denial_cause": shortfall.map(|s| s.as_str()),
                "plan_changed": decision.plan_changed,
                "caller_ip": request.caller_ip,
                "idempotency_key": key,
            }),
            now,
        )
        .await;

        Ok(decision)
    }

    /// Audit and count a terminal decision. Never fails the call.
    async fn finish(
        &self,
        request: &ConsumeRequest,
        decision: &QuotaDecision,
        reason: AuditReason,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        record_decision(request.metric.as_str(), reason.as_str());
        let entry = QuotaAuditEntry::new(
            request.user_id,
            Some(request.metric),
            request.amount,
            decision.allowed,
            reason,
            context,
            now,
        );
        self.audit.record(entry).await;
    }
}
