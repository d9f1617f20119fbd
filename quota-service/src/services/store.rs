//! Repository contract for quota state.
//!
//! All reads and writes of usage counters, bonus grants, balances and
//! idempotency claims happen inside a [`QuotaTx`], which must behave as a
//! serializable transaction with row locks on what it touches. Dropping a
//! transaction without committing rolls it back.
//!
//! Rate-limit windows and the audit log sit outside transactions: the first
//! tolerates eventual consistency, the second must never roll back a decision.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{
    BonusGrant, IdempotencyRecord, Metric, PlanChangeRecord, QuotaAuditEntry, QuotaDecision,
    RequestFingerprint, UserBalance,
};

/// Retention cut-offs for maintenance.
#[derive(Debug, Clone, Copy)]
pub struct PruneCutoffs {
    pub idempotency_before: DateTime<Utc>,
    pub audit_before: DateTime<Utc>,
    pub rate_windows_before: DateTime<Utc>,
}

/// Rows removed by maintenance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub idempotency_records: u64,
    pub audit_entries: u64,
    pub rate_windows: u64,
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Open a serializable unit of work.
    async fn begin(&self) -> Result<Box<dyn QuotaTx>, QuotaError>;

    /// Increment and return the request count of a rate-limit window.
    async fn hit_rate_window(
        &self,
        identifier: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64, QuotaError>;

    async fn append_audit(&self, entry: &QuotaAuditEntry) -> Result<(), QuotaError>;

    /// Newest first.
    async fn recent_audit(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<QuotaAuditEntry>, QuotaError>;

    async fn prune(&self, cutoffs: PruneCutoffs) -> Result<PruneReport, QuotaError>;

    async fn health_check(&self) -> Result<(), QuotaError>;
}

#[async_trait]
pub trait QuotaTx: Send {
    /// Insert the claim if the key is new (`None`), otherwise return the
    /// existing record. Uniqueness of (user, key) decides concurrent races.
    async fn claim_idempotency(
        &mut self,
        user_id: Uuid,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<IdempotencyRecord>, QuotaError>;

    /// Store the decision reached under a claimed key.
    async fn complete_idempotency(
        &mut self,
        user_id: Uuid,
        key: &str,
        decision: &QuotaDecision,
    ) -> Result<(), QuotaError>;

    /// Mark a key as reused with different parameters.
    async fn flag_collision(&mut self, user_id: Uuid, key: &str) -> Result<(), QuotaError>;

    /// Lock the usage counter, creating it at zero on first use of a period.
    async fn lock_usage(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<i64, QuotaError>;

    async fn set_usage(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
        usage: i64,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError>;

    /// All counters a user has for a period.
    async fn period_usage(
        &mut self,
        user_id: Uuid,
        period_start: NaiveDate,
    ) -> Result<Vec<(Metric, i64)>, QuotaError>;

    /// Lock the user's unexpired grants for a metric that still have capacity.
    async fn lock_bonus_grants(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Result<Vec<BonusGrant>, QuotaError>;

    async fn set_bonus_used(&mut self, grant_id: Uuid, amount_used: i64)
        -> Result<(), QuotaError>;

    async fn insert_bonus_grant(&mut self, grant: &BonusGrant) -> Result<(), QuotaError>;

    async fn lock_balance(&mut self, user_id: Uuid) -> Result<Option<UserBalance>, QuotaError>;

    /// Persist a balance. Implementations verify the totals seal first and
    /// refuse to write an inconsistent balance.
    async fn save_balance(&mut self, balance: &UserBalance) -> Result<(), QuotaError>;

    async fn insert_plan_change(&mut self, record: &PlanChangeRecord) -> Result<(), QuotaError>;

    /// Whether a plan change took effect in `[since, until]`.
    async fn plan_changed_between(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, QuotaError>;

    async fn commit(self: Box<Self>) -> Result<(), QuotaError>;
}
