//! Domain models for quota-service.

mod audit;
mod balance;
mod bonus;
mod bucket;
mod decision;
mod idempotency;
mod plan;
mod usage;

pub use audit::{AuditReason, QuotaAuditEntry};
pub use balance::{month_key, AutoTopUp, BalanceTotals, BalanceView, StoredBalance, UserBalance};
pub use bonus::{BonusGrant, CreateBonusGrant};
pub use bucket::{Bucket, BucketSource};
pub use decision::{ConsumeRequest, QuotaDecision, RefundResult, MAX_IDEMPOTENCY_KEY_LEN};
pub use idempotency::{ClaimOutcome, IdempotencyRecord, RequestFingerprint};
pub use plan::{
    PlanChangeRecord, PlanLimits, SubscriptionChange, MAX_PLAN_NAME_LEN, UNLIMITED_QUOTA,
};
pub use usage::{period_start, period_start_utc, Metric, UsagePeriodRecord, UsageView};
