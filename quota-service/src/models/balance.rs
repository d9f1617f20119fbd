//! Per-user time balance model.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bucket::Bucket;

/// Derived totals. Only ever produced by the balance aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceTotals {
    pub total_paid_seconds: i64,
    pub total_bonus_seconds: i64,
    pub next_expiry_at: Option<DateTime<Utc>>,
}

impl BalanceTotals {
    pub fn total_seconds(&self) -> i64 {
        self.total_paid_seconds + self.total_bonus_seconds
    }
}

/// Auto top-up preferences. Charging itself happens in the payment service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoTopUp {
    pub enabled: bool,
    pub threshold_seconds: i64,
    pub package: Option<String>,
    pub consent_at: Option<DateTime<Utc>>,
}

/// One balance per user, owned by the bucket ledger.
///
/// `buckets` and the computed totals are private: they change only through
/// the ledger, which reseals the totals on every mutation.
#[derive(Debug, Clone, Serialize)]
pub struct UserBalance {
    pub user_id: Uuid,
    buckets: Vec<Bucket>,
    pub daily_gift_used_today: i64,
    pub daily_gift_date: Option<NaiveDate>,
    pub bonus_month: String,
    pub bonus_used_this_month: i64,
    pub bonus_monthly_cap: i64,
    pub welcome_bonus_granted_at: Option<DateTime<Utc>>,
    pub auto_top_up: AutoTopUp,
    totals: BalanceTotals,
    totals_as_of: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Flat persisted form of a balance, as read back from storage.
#[derive(Debug, Clone)]
pub struct StoredBalance {
    pub user_id: Uuid,
    pub buckets: serde_json::Value,
    pub daily_gift_used_today: i64,
    pub daily_gift_date: Option<NaiveDate>,
    pub bonus_month: String,
    pub bonus_used_this_month: i64,
    pub bonus_monthly_cap: i64,
    pub welcome_bonus_granted_at: Option<DateTime<Utc>>,
    pub auto_top_up: AutoTopUp,
    pub totals: BalanceTotals,
    pub totals_as_of: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Calendar-month key, `YYYY-MM`.
pub fn month_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

impl UserBalance {
    /// A balance with no buckets.
    pub fn empty(user_id: Uuid, bonus_monthly_cap: i64, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            buckets: Vec::new(),
            daily_gift_used_today: 0,
            daily_gift_date: Some(now.date_naive()),
            bonus_month: month_key(now),
            bonus_used_this_month: 0,
            bonus_monthly_cap,
            welcome_bonus_granted_at: None,
            auto_top_up: AutoTopUp::default(),
            totals: BalanceTotals::default(),
            totals_as_of: now,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Rebuild from storage. Buckets arrive already validated; the caller is
    /// expected to verify the totals seal before trusting them.
    pub(crate) fn from_stored(stored: StoredBalance, buckets: Vec<Bucket>) -> Self {
        Self {
            user_id: stored.user_id,
            buckets,
            daily_gift_used_today: stored.daily_gift_used_today,
            daily_gift_date: stored.daily_gift_date,
            bonus_month: stored.bonus_month,
            bonus_used_this_month: stored.bonus_used_this_month,
            bonus_monthly_cap: stored.bonus_monthly_cap,
            welcome_bonus_granted_at: stored.welcome_bonus_granted_at,
            auto_top_up: stored.auto_top_up,
            totals: stored.totals,
            totals_as_of: stored.totals_as_of,
            created_utc: stored.created_utc,
            updated_utc: stored.updated_utc,
        }
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Totals as sealed at the last mutation.
    pub fn totals(&self) -> BalanceTotals {
        self.totals
    }

    pub fn totals_as_of(&self) -> DateTime<Utc> {
        self.totals_as_of
    }

    pub(crate) fn buckets_mut(&mut self) -> &mut Vec<Bucket> {
        &mut self.buckets
    }

    pub(crate) fn set_totals(&mut self, totals: BalanceTotals, as_of: DateTime<Utc>) {
        self.totals = totals;
        self.totals_as_of = as_of;
        self.updated_utc = as_of;
    }

    /// Reset the daily gift and monthly bonus counters when their period
    /// has rolled over.
    pub fn roll_counters(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.daily_gift_date != Some(today) {
            self.daily_gift_date = Some(today);
            self.daily_gift_used_today = 0;
        }
        let month = month_key(now);
        if self.bonus_month != month {
            self.bonus_month = month;
            self.bonus_used_this_month = 0;
        }
    }

    /// Bonus still spendable this month, counters assumed rolled.
    pub fn bonus_headroom(&self) -> i64 {
        (self.bonus_monthly_cap - self.bonus_used_this_month).max(0)
    }
}

/// Read model returned by the balance API: totals are evaluated at read time
/// so expired buckets drop out without a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceView {
    pub user_id: Uuid,
    pub buckets: Vec<Bucket>,
    pub total_paid_seconds: i64,
    pub total_bonus_seconds: i64,
    pub next_expiry_at: Option<DateTime<Utc>>,
    pub daily_gift_used_today: i64,
    pub bonus_month: String,
    pub bonus_used_this_month: i64,
    pub bonus_monthly_cap: i64,
    pub welcome_bonus_granted_at: Option<DateTime<Utc>>,
    pub auto_top_up: AutoTopUp,
    pub auto_top_up_due: bool,
}

impl BalanceView {
    pub fn new(balance: &UserBalance, totals: BalanceTotals) -> Self {
        let auto_top_up_due = balance.auto_top_up.enabled
            && totals.total_paid_seconds < balance.auto_top_up.threshold_seconds;
        Self {
            user_id: balance.user_id,
            buckets: balance.buckets.clone(),
            total_paid_seconds: totals.total_paid_seconds,
            total_bonus_seconds: totals.total_bonus_seconds,
            next_expiry_at: totals.next_expiry_at,
            daily_gift_used_today: balance.daily_gift_used_today,
            bonus_month: balance.bonus_month.clone(),
            bonus_used_this_month: balance.bonus_used_this_month,
            bonus_monthly_cap: balance.bonus_monthly_cap,
            welcome_bonus_granted_at: balance.welcome_bonus_granted_at,
            auto_top_up: balance.auto_top_up.clone(),
            auto_top_up_due,
        }
    }
}
