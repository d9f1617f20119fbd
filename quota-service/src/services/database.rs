//! Database service for quota-service.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{
    AuditReason, AutoTopUp, BalanceTotals, BonusGrant, IdempotencyRecord, Metric,
    PlanChangeRecord, QuotaAuditEntry, QuotaDecision, RequestFingerprint, StoredBalance,
    UserBalance,
};
use crate::services::integrity;
use crate::services::ledger::verify_sealed;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{PruneCutoffs, PruneReport, QuotaStore, QuotaTx};

/// Map a driver error, surfacing serialization failures and deadlocks as
/// retryable conflicts.
fn db_error(operation: &str, err: sqlx::Error) -> QuotaError {
    if let sqlx::Error::Database(ref db_err) = err {
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return QuotaError::SerializationConflict;
        }
    }
    QuotaError::storage(operation, err)
}

fn parse_metric(raw: &str) -> Result<Metric, QuotaError> {
    Metric::from_string(raw)
        .ok_or_else(|| QuotaError::storage("decode metric", format!("unknown metric '{}'", raw)))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "quota-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    entry_id: Uuid,
    user_id: Uuid,
    metric: Option<String>,
    attempted_amount: i64,
    success: bool,
    reason: String,
    context: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for QuotaAuditEntry {
    type Error = QuotaError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let reason = AuditReason::from_string(&row.reason).ok_or_else(|| {
            QuotaError::storage("decode audit entry", format!("unknown reason '{}'", row.reason))
        })?;
        Ok(Self {
            entry_id: row.entry_id,
            user_id: row.user_id,
            metric: row.metric.as_deref().map(parse_metric).transpose()?,
            attempted_amount: row.attempted_amount,
            success: row.success,
            reason,
            context: row.context,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    user_id: Uuid,
    idempotency_key: String,
    metric: String,
    amount: i64,
    requested_at: DateTime<Utc>,
    result: Option<serde_json::Value>,
    collision_flagged: bool,
    collision_count: i32,
    created_utc: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = QuotaError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        let result = row
            .result
            .map(serde_json::from_value::<QuotaDecision>)
            .transpose()
            .map_err(|e| QuotaError::storage("decode stored decision", e))?;
        Ok(Self {
            user_id: row.user_id,
            idempotency_key: row.idempotency_key,
            fingerprint: RequestFingerprint {
                metric: parse_metric(&row.metric)?,
                amount: row.amount,
                requested_at: row.requested_at,
            },
            result,
            collision_flagged: row.collision_flagged,
            collision_count: row.collision_count,
            created_utc: row.created_utc,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BonusGrantRow {
    grant_id: Uuid,
    user_id: Uuid,
    metric: String,
    amount_granted: i64,
    amount_used: i64,
    expires_at: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<BonusGrantRow> for BonusGrant {
    type Error = QuotaError;

    fn try_from(row: BonusGrantRow) -> Result<Self, Self::Error> {
        Ok(Self {
            grant_id: row.grant_id,
            user_id: row.user_id,
            metric: parse_metric(&row.metric)?,
            amount_granted: row.amount_granted,
            amount_used: row.amount_used,
            expires_at: row.expires_at,
            created_utc: row.created_utc,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    user_id: Uuid,
    buckets: serde_json::Value,
    daily_gift_used_today: i64,
    daily_gift_date: Option<NaiveDate>,
    bonus_month: String,
    bonus_used_this_month: i64,
    bonus_monthly_cap: i64,
    welcome_bonus_granted_at: Option<DateTime<Utc>>,
    auto_top_up: serde_json::Value,
    total_paid_seconds: i64,
    total_bonus_seconds: i64,
    next_expiry_at: Option<DateTime<Utc>>,
    totals_as_of: DateTime<Utc>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl BalanceRow {
    /// Decode, validate the bucket column and check the stored totals.
    fn into_balance(self) -> Result<UserBalance, QuotaError> {
        let buckets = integrity::parse_buckets(&self.buckets)?;
        let auto_top_up: AutoTopUp = serde_json::from_value(self.auto_top_up)
            .map_err(|e| QuotaError::storage("decode auto top-up", e))?;
        let stored = StoredBalance {
            user_id: self.user_id,
            buckets: self.buckets,
            daily_gift_used_today: self.daily_gift_used_today,
            daily_gift_date: self.daily_gift_date,
            bonus_month: self.bonus_month,
            bonus_used_this_month: self.bonus_used_this_month,
            bonus_monthly_cap: self.bonus_monthly_cap,
            welcome_bonus_granted_at: self.welcome_bonus_granted_at,
            auto_top_up,
            totals: BalanceTotals {
                total_paid_seconds: self.total_paid_seconds,
                total_bonus_seconds: self.total_bonus_seconds,
                next_expiry_at: self.next_expiry_at,
            },
            totals_as_of: self.totals_as_of,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
        };
        let balance = UserBalance::from_stored(stored, buckets);
        verify_sealed(&balance)?;
        Ok(balance)
    }
}

#[async_trait]
impl QuotaStore for Database {
    #[instrument(skip(self))]
    async fn begin(&self) -> Result<Box<dyn QuotaTx>, QuotaError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("set isolation level", e))?;

        Ok(Box::new(PgQuotaTx { tx }))
    }

    async fn hit_rate_window(
        &self,
        identifier: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64, QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["hit_rate_window"])
            .start_timer();

        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rate_limit_windows (identifier, window_start, request_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (identifier, window_start)
            DO UPDATE SET request_count = rate_limit_windows.request_count + 1
            RETURNING request_count
            "#,
        )
        .bind(identifier)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count rate window", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self, entry), fields(user_id = %entry.user_id, reason = %entry.reason))]
    async fn append_audit(&self, entry: &QuotaAuditEntry) -> Result<(), QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_audit"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO quota_audit_log (entry_id, user_id, metric, attempted_amount, success, reason, context, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.entry_id)
        .bind(entry.user_id)
        .bind(entry.metric.map(|m| m.as_str()))
        .bind(entry.attempted_amount)
        .bind(entry.success)
        .bind(entry.reason.as_str())
        .bind(&entry.context)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("append audit entry", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn recent_audit(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<QuotaAuditEntry>, QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recent_audit"])
            .start_timer();

        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT entry_id, user_id, metric, attempted_amount, success, reason, context, created_at
            FROM quota_audit_log
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list audit entries", e))?;

        timer.observe_duration();
        rows.into_iter().map(QuotaAuditEntry::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn prune(&self, cutoffs: PruneCutoffs) -> Result<PruneReport, QuotaError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["prune"]).start_timer();

        let idempotency_records =
            sqlx::query("DELETE FROM idempotency_records WHERE created_utc < $1")
                .bind(cutoffs.idempotency_before)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("prune idempotency records", e))?
                .rows_affected();

        let audit_entries = sqlx::query("DELETE FROM quota_audit_log WHERE created_at < $1")
            .bind(cutoffs.audit_before)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("prune audit log", e))?
            .rows_affected();

        let rate_windows = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
            .bind(cutoffs.rate_windows_before)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("prune rate windows", e))?
            .rows_affected();

        timer.observe_duration();
        Ok(PruneReport {
            idempotency_records,
            audit_entries,
            rate_windows,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("run health check", e))?;

        timer.observe_duration();
        Ok(())
    }
}

/// Serializable Postgres transaction. Dropping it rolls back.
pub struct PgQuotaTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl QuotaTx for PgQuotaTx {
    async fn claim_idempotency(
        &mut self,
        user_id: Uuid,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<IdempotencyRecord>, QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_idempotency"])
            .start_timer();

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (user_id, idempotency_key, metric, amount, requested_at, created_utc)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (user_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(fingerprint.metric.as_str())
        .bind(fingerprint.amount)
        .bind(fingerprint.requested_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("claim idempotency key", e))?
        .rows_affected();

        if inserted == 1 {
            timer.observe_duration();
            return Ok(None);
        }

        let row = sqlx::query_as::<_, IdempotencyRow>(
            r#"
            SELECT user_id, idempotency_key, metric, amount, requested_at, result, collision_flagged, collision_count, created_utc
            FROM idempotency_records
            WHERE user_id = $1 AND idempotency_key = $2
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(key)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("load idempotency record", e))?;

        timer.observe_duration();
        Ok(Some(row.try_into()?))
    }

    async fn complete_idempotency(
        &mut self,
        user_id: Uuid,
        key: &str,
        decision: &QuotaDecision,
    ) -> Result<(), QuotaError> {
        let result = serde_json::to_value(decision)
            .map_err(|e| QuotaError::storage("encode decision", e))?;

        sqlx::query(
            "UPDATE idempotency_records SET result = $3 WHERE user_id = $1 AND idempotency_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .bind(result)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("complete idempotency key", e))?;
        Ok(())
    }

    async fn flag_collision(&mut self, user_id: Uuid, key: &str) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET collision_flagged = TRUE, collision_count = collision_count + 1
            WHERE user_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(user_id)
        .bind(key)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("flag idempotency collision", e))?;
        Ok(())
    }

    async fn lock_usage(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<i64, QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_usage"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_periods (user_id, metric, period_start, current_usage, updated_utc)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (user_id, metric, period_start) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(period_start)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("open usage period", e))?;

        let usage = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT current_usage FROM usage_periods
            WHERE user_id = $1 AND metric = $2 AND period_start = $3
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(period_start)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock usage period", e))?;

        timer.observe_duration();
        Ok(usage)
    }

    async fn set_usage(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
        usage: i64,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            UPDATE usage_periods SET current_usage = $4, updated_utc = $5
            WHERE user_id = $1 AND metric = $2 AND period_start = $3
            "#,
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(period_start)
        .bind(usage)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("update usage period", e))?;
        Ok(())
    }

    async fn period_usage(
        &mut self,
        user_id: Uuid,
        period_start: NaiveDate,
    ) -> Result<Vec<(Metric, i64)>, QuotaError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT metric, current_usage FROM usage_periods
            WHERE user_id = $1 AND period_start = $2
            ORDER BY metric
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("read period usage", e))?;

        rows.into_iter()
            .map(|(metric, usage)| Ok((parse_metric(&metric)?, usage)))
            .collect()
    }

    async fn lock_bonus_grants(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Result<Vec<BonusGrant>, QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_bonus_grants"])
            .start_timer();

        let rows = sqlx::query_as::<_, BonusGrantRow>(
            r#"
            SELECT grant_id, user_id, metric, amount_granted, amount_used, expires_at, created_utc
            FROM bonus_grants
            WHERE user_id = $1 AND metric = $2
              AND amount_used < amount_granted
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY expires_at ASC NULLS LAST, created_utc ASC
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock bonus grants", e))?;

        timer.observe_duration();
        rows.into_iter().map(BonusGrant::try_from).collect()
    }

    async fn set_bonus_used(
        &mut self,
        grant_id: Uuid,
        amount_used: i64,
    ) -> Result<(), QuotaError> {
        sqlx::query("UPDATE bonus_grants SET amount_used = $2 WHERE grant_id = $1")
            .bind(grant_id)
            .bind(amount_used)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("debit bonus grant", e))?;
        Ok(())
    }

    async fn insert_bonus_grant(&mut self, grant: &BonusGrant) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO bonus_grants (grant_id, user_id, metric, amount_granted, amount_used, expires_at, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(grant.grant_id)
        .bind(grant.user_id)
        .bind(grant.metric.as_str())
        .bind(grant.amount_granted)
        .bind(grant.amount_used)
        .bind(grant.expires_at)
        .bind(grant.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("insert bonus grant", e))?;
        Ok(())
    }

    async fn lock_balance(&mut self, user_id: Uuid) -> Result<Option<UserBalance>, QuotaError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_balance"])
            .start_timer();

        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            SELECT user_id, buckets, daily_gift_used_today, daily_gift_date, bonus_month,
                   bonus_used_this_month, bonus_monthly_cap, welcome_bonus_granted_at, auto_top_up,
                   total_paid_seconds, total_bonus_seconds, next_expiry_at, totals_as_of,
                   created_utc, updated_utc
            FROM user_balances
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock balance", e))?;

        timer.observe_duration();
        row.map(BalanceRow::into_balance).transpose()
    }

    async fn save_balance(&mut self, balance: &UserBalance) -> Result<(), QuotaError> {
        verify_sealed(balance)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_balance"])
            .start_timer();

        let buckets = serde_json::to_value(balance.buckets())
            .map_err(|e| QuotaError::storage("encode buckets", e))?;
        let auto_top_up = serde_json::to_value(&balance.auto_top_up)
            .map_err(|e| QuotaError::storage("encode auto top-up", e))?;
        let totals = balance.totals();

        sqlx::query(
            r#"
            INSERT INTO user_balances (
                user_id, buckets, daily_gift_used_today, daily_gift_date, bonus_month,
                bonus_used_this_month, bonus_monthly_cap, welcome_bonus_granted_at, auto_top_up,
                total_paid_seconds, total_bonus_seconds, next_expiry_at, totals_as_of,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_id) DO UPDATE SET
                buckets = EXCLUDED.buckets,
                daily_gift_used_today = EXCLUDED.daily_gift_used_today,
                daily_gift_date = EXCLUDED.daily_gift_date,
                bonus_month = EXCLUDED.bonus_month,
                bonus_used_this_month = EXCLUDED.bonus_used_this_month,
                bonus_monthly_cap = EXCLUDED.bonus_monthly_cap,
                welcome_bonus_granted_at = EXCLUDED.welcome_bonus_granted_at,
                auto_top_up = EXCLUDED.auto_top_up,
                total_paid_seconds = EXCLUDED.total_paid_seconds,
                total_bonus_seconds = EXCLUDED.total_bonus_seconds,
                next_expiry_at = EXCLUDED.next_expiry_at,
                totals_as_of = EXCLUDED.totals_as_of,
                updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(balance.user_id)
        .bind(buckets)
        .bind(balance.daily_gift_used_today)
        .bind(balance.daily_gift_date)
        .bind(&balance.bonus_month)
        .bind(balance.bonus_used_this_month)
        .bind(balance.bonus_monthly_cap)
        .bind(balance.welcome_bonus_granted_at)
        .bind(auto_top_up)
        .bind(totals.total_paid_seconds)
        .bind(totals.total_bonus_seconds)
        .bind(totals.next_expiry_at)
        .bind(balance.totals_as_of())
        .bind(balance.created_utc)
        .bind(balance.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("save balance", e))?;

        timer.observe_duration();
        Ok(())
    }

    async fn insert_plan_change(&mut self, record: &PlanChangeRecord) -> Result<(), QuotaError> {
        let snapshot: BTreeMap<&str, i64> = record
            .usage_snapshot
            .iter()
            .map(|(metric, usage)| (metric.as_str(), *usage))
            .collect();
        let snapshot = serde_json::to_value(snapshot)
            .map_err(|e| QuotaError::storage("encode usage snapshot", e))?;

        sqlx::query(
            r#"
            INSERT INTO plan_change_log (change_id, user_id, old_plan, new_plan, effective_at, period_start, usage_snapshot, recorded_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.change_id)
        .bind(record.user_id)
        .bind(&record.old_plan)
        .bind(&record.new_plan)
        .bind(record.effective_at)
        .bind(record.period_start)
        .bind(snapshot)
        .bind(record.recorded_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("record plan change", e))?;
        Ok(())
    }

    async fn plan_changed_between(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM plan_change_log
                WHERE user_id = $1 AND effective_at >= $2 AND effective_at <= $3
            )
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(until)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("check plan changes", e))
    }

    async fn commit(self: Box<Self>) -> Result<(), QuotaError> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }
}
