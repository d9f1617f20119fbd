//! Quota service: the entry point handlers and background tasks call.
//!
//! Wires the decision engine, refund handler and plan-change preserver to
//! one store, and runs balance operations through the bucket ledger inside
//! store transactions.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::QuotaSettings;
use crate::error::QuotaError;
use crate::models::{
    period_start, BalanceView, BonusGrant, Bucket, BucketSource, ConsumeRequest,
    CreateBonusGrant, Metric, PlanChangeRecord, QuotaAuditEntry, QuotaDecision, RefundResult,
    SubscriptionChange, UsageView, UserBalance,
};
use crate::services::aggregator;
use crate::services::audit::AuditLogger;
use crate::services::clock::Clock;
use crate::services::engine::{retry_serializable, QuotaEngine};
use crate::services::idempotency::IdempotencyGuard;
use crate::services::ledger::{BucketLedger, LedgerSettings, TimeConsumption};
use crate::services::plan_change::PlanChangePreserver;
use crate::services::plans::{resolve_limits, PlanLookup};
use crate::services::rate_limiter::{window_start, RateLimiter};
use crate::services::refund::RefundHandler;
use crate::services::store::{PruneCutoffs, PruneReport, QuotaStore, QuotaTx};

/// Rate windows older than this are dropped by maintenance.
const RATE_WINDOW_RETENTION_MINUTES: i64 = 5;

pub struct QuotaService {
    store: Arc<dyn QuotaStore>,
    plans: Arc<dyn PlanLookup>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
    ledger: BucketLedger,
    engine: QuotaEngine,
    refunds: RefundHandler,
    plan_changes: PlanChangePreserver,
    settings: QuotaSettings,
}

impl QuotaService {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        plans: Arc<dyn PlanLookup>,
        clock: Arc<dyn Clock>,
        settings: QuotaSettings,
    ) -> Self {
        let audit = Arc::new(AuditLogger::new(store.clone()));
        let ledger = BucketLedger::new(LedgerSettings {
            daily_gift_seconds: settings.daily_gift_seconds,
            welcome_bonus_seconds: settings.welcome_bonus_seconds,
            welcome_bonus_ttl: Duration::days(settings.welcome_bonus_ttl_days),
            bonus_monthly_cap: settings.bonus_monthly_cap_seconds,
        });
        let retries = settings.max_serialization_retries;

        let engine = QuotaEngine::new(
            store.clone(),
            plans.clone(),
            clock.clone(),
            audit.clone(),
            RateLimiter::new(store.clone(), settings.rate_limit_per_minute),
            IdempotencyGuard::new(Duration::seconds(settings.collision_window_seconds)),
            ledger.clone(),
            retries,
        );
        let refunds = RefundHandler::new(store.clone(), clock.clone(), audit.clone(), retries);
        let plan_changes = PlanChangePreserver::new(
            store.clone(),
            plans.clone(),
            clock.clone(),
            audit.clone(),
            retries,
        );

        Self {
            store,
            plans,
            clock,
            audit,
            ledger,
            engine,
            refunds,
            plan_changes,
            settings,
        }
    }

    pub fn settings(&self) -> &QuotaSettings {
        &self.settings
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit
    }

    // =========================================================================
    // Usage quota
    // =========================================================================

    pub async fn check_and_consume(
        &self,
        request: &ConsumeRequest,
    ) -> Result<QuotaDecision, QuotaError> {
        self.engine.check_and_consume(request).await
    }

    pub async fn refund(
        &self,
        user_id: Uuid,
        metric: Metric,
        reference: Option<&str>,
    ) -> Result<RefundResult, QuotaError> {
        self.refunds.refund(user_id, metric, reference).await
    }

    pub async fn on_subscription_change(
        &self,
        change: &SubscriptionChange,
    ) -> Result<PlanChangeRecord, QuotaError> {
        self.plan_changes.on_subscription_change(change).await
    }

    /// Current-period usage against the plan limit. Read-only.
    #[instrument(skip(self), fields(user_id = %user_id, metric = %metric))]
    pub async fn get_usage(&self, user_id: Uuid, metric: Metric) -> Result<UsageView, QuotaError> {
        let now = self.clock.now();
        let period = period_start(now);
        let limits = resolve_limits(self.plans.as_ref(), user_id, metric).await;

        let mut tx = self.store.begin().await?;
        let current_usage = tx.lock_usage(user_id, metric, period, now).await?;
        drop(tx);

        let limit = limits.effective_limit();
        Ok(UsageView {
            user_id,
            metric,
            period_start: period,
            current_usage,
            limit,
            remaining: (limit - current_usage).max(0),
            plan_name: limits.plan_name,
        })
    }

    #[instrument(skip(self, input), fields(user_id = %user_id, metric = %input.metric))]
    pub async fn add_bonus_grant(
        &self,
        user_id: Uuid,
        input: &CreateBonusGrant,
    ) -> Result<BonusGrant, QuotaError> {
        let now = self.clock.now();
        if input.amount <= 0 {
            return Err(QuotaError::InvalidRequest(
                "bonus amount must be positive".to_string(),
            ));
        }
        if input.expires_at.is_some_and(|at| at <= now) {
            return Err(QuotaError::InvalidRequest(
                "bonus expiry must be in the future".to_string(),
            ));
        }

        let grant = BonusGrant {
            grant_id: Uuid::new_v4(),
            user_id,
            metric: input.metric,
            amount_granted: input.amount,
            amount_used: 0,
            expires_at: input.expires_at,
            created_utc: now,
        };
        let pending = &grant;
        retry_serializable(
            "add_bonus_grant",
            self.settings.max_serialization_retries,
            || async move {
                let mut tx = self.store.begin().await?;
                tx.insert_bonus_grant(pending).await?;
                tx.commit().await
            },
        )
        .await?;

        info!(grant_id = %grant.grant_id, amount = grant.amount_granted, "Bonus grant added");
        Ok(grant)
    }

    // =========================================================================
    // Time balance
    // =========================================================================

    /// Create the user's balance with its welcome bucket. Calling it again
    /// returns the existing balance.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn open_balance(&self, user_id: Uuid) -> Result<BalanceView, QuotaError> {
        self.mutate_balance("open_balance", user_id, true, |ledger, balance, now| {
            ledger.grant_welcome(balance, now)
        })
        .await
        .map(|(view, _)| view)
    }

    /// Append a bucket from a purchase, renewal, rollover or admin gift.
    #[instrument(skip(self), fields(user_id = %user_id, source = %source))]
    pub async fn grant_bucket(
        &self,
        user_id: Uuid,
        source: BucketSource,
        seconds: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Bucket, QuotaError> {
        if source == BucketSource::Daily {
            return Err(QuotaError::InvalidRequest(
                "daily buckets are granted through the daily gift".to_string(),
            ));
        }
        self.mutate_balance("grant_bucket", user_id, false, |ledger, balance, now| {
            ledger.add_bucket(balance, source, seconds, expires_at, now)
        })
        .await
        .map(|(_, bucket)| bucket)
    }

    /// Today's daily gift bucket; `None` if already granted today.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn grant_daily_gift(&self, user_id: Uuid) -> Result<Option<Bucket>, QuotaError> {
        self.mutate_balance("grant_daily_gift", user_id, false, |ledger, balance, now| {
            ledger.grant_daily_gift(balance, now)
        })
        .await
        .map(|(_, bucket)| bucket)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn consume_time(
        &self,
        user_id: Uuid,
        seconds: i64,
    ) -> Result<TimeConsumption, QuotaError> {
        self.mutate_balance("consume_time", user_id, false, |ledger, balance, now| {
            ledger.consume_time(balance, seconds, now)
        })
        .await
        .map(|(_, consumption)| consumption)
    }

    #[instrument(skip(self, package), fields(user_id = %user_id))]
    pub async fn configure_auto_top_up(
        &self,
        user_id: Uuid,
        enabled: bool,
        threshold_seconds: i64,
        package: Option<String>,
    ) -> Result<BalanceView, QuotaError> {
        self.mutate_balance("configure_auto_top_up", user_id, false, |ledger, balance, now| {
            ledger.configure_auto_top_up(balance, enabled, threshold_seconds, package.clone(), now)
        })
        .await
        .map(|(view, _)| view)
    }

    /// Balance with totals evaluated now, so buckets that expired since the
    /// last write no longer count.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_balance(&self, user_id: Uuid) -> Result<BalanceView, QuotaError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let balance = tx
            .lock_balance(user_id)
            .await?
            .ok_or(QuotaError::BalanceNotFound(user_id))?;
        drop(tx);
        let totals = aggregator::aggregate(balance.buckets(), now)?;
        Ok(BalanceView::new(&balance, totals))
    }

    pub async fn recent_audit(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<QuotaAuditEntry>, QuotaError> {
        self.store.recent_audit(user_id, limit).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Retry deferred audit writes and prune expired idempotency records,
    /// audit entries and rate windows.
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self) -> Result<PruneReport, QuotaError> {
        let now = self.clock.now();
        self.audit.flush_deferred().await;

        let cutoffs = PruneCutoffs {
            idempotency_before: now - Duration::days(self.settings.idempotency_retention_days),
            audit_before: now - Duration::days(self.settings.audit_retention_days),
            rate_windows_before: window_start(now)
                - Duration::minutes(RATE_WINDOW_RETENTION_MINUTES),
        };
        let report = self.store.prune(cutoffs).await?;
        info!(
            idempotency_records = report.idempotency_records,
            audit_entries = report.audit_entries,
            rate_windows = report.rate_windows,
            "Maintenance completed"
        );
        Ok(report)
    }

    pub async fn health_check(&self) -> Result<(), QuotaError> {
        self.store.health_check().await
    }

    /// Locked read-modify-write of one balance through the ledger. The ledger
    /// reseals the balance and the store re-verifies it before writing.
    async fn mutate_balance<T, F>(
        &self,
        operation: &str,
        user_id: Uuid,
        create: bool,
        mutate: F,
    ) -> Result<(BalanceView, T), QuotaError>
    where
        F: Fn(&BucketLedger, &mut UserBalance, DateTime<Utc>) -> Result<T, QuotaError>,
    {
        let mutate = &mutate;
        retry_serializable(operation, self.settings.max_serialization_retries, || async move {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let mut balance = load_balance(tx.as_mut(), &self.ledger, user_id, create, now).await?;
            let output = mutate(&self.ledger, &mut balance, now)?;
            tx.save_balance(&balance).await?;
            tx.commit().await?;
            let view = BalanceView::new(&balance, balance.totals());
            Ok::<_, QuotaError>((view, output))
        })
        .await
    }
}

async fn load_balance(
    tx: &mut dyn QuotaTx,
    ledger: &BucketLedger,
    user_id: Uuid,
    create: bool,
    now: DateTime<Utc>,
) -> Result<UserBalance, QuotaError> {
    match tx.lock_balance(user_id).await? {
        Some(balance) => Ok(balance),
        None if create => Ok(ledger.new_balance(user_id, now)),
        None => Err(QuotaError::BalanceNotFound(user_id)),
    }
}
