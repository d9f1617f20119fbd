//! Bucket ledger: every change to a balance's buckets goes through here.
//!
//! Each mutation ends with [`seal`], which re-validates the collection and
//! recomputes the totals. Stores call [`verify_sealed`] before writing.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{BucketViolation, QuotaError};
use crate::models::{AutoTopUp, BalanceTotals, Bucket, BucketSource, UserBalance};
use crate::services::{aggregator, integrity};

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub daily_gift_seconds: i64,
    pub welcome_bonus_seconds: i64,
    pub welcome_bonus_ttl: Duration,
    pub bonus_monthly_cap: i64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            daily_gift_seconds: 900,
            welcome_bonus_seconds: 1800,
            welcome_bonus_ttl: Duration::days(30),
            bonus_monthly_cap: 18_000,
        }
    }
}

/// Seconds drained by one `consume_time` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeConsumption {
    pub bonus_seconds: i64,
    pub paid_seconds: i64,
    pub totals: BalanceTotals,
}

/// Validate the buckets and recompute the computed fields.
pub fn seal(balance: &mut UserBalance, now: DateTime<Utc>) -> Result<(), QuotaError> {
    integrity::validate(balance.buckets())?;
    let totals = aggregator::aggregate(balance.buckets(), now)?;
    balance.set_totals(totals, now);
    Ok(())
}

/// Reject a balance whose stored totals are not what the aggregator derives.
pub fn verify_sealed(balance: &UserBalance) -> Result<(), QuotaError> {
    integrity::validate(balance.buckets())?;
    if aggregator::aggregate(balance.buckets(), balance.totals_as_of())? != balance.totals() {
        return Err(BucketViolation::TotalsMismatch.into());
    }
    Ok(())
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now + Duration::days(1))
}

/// Indices of eligible buckets matching `pick`, soonest expiry first and
/// never-expiring last.
fn drain_order(
    buckets: &[Bucket],
    now: DateTime<Utc>,
    pick: impl Fn(&Bucket) -> bool,
) -> Vec<usize> {
    let mut order: Vec<usize> = buckets
        .iter()
        .enumerate()
        .filter(|(_, bucket)| bucket.is_eligible(now) && pick(bucket))
        .map(|(index, _)| index)
        .collect();
    order.sort_by_key(|&index| {
        let expires_at = buckets[index].expires_at;
        (expires_at.is_none(), expires_at)
    });
    order
}

/// Remaining seconds across `order`, or `TotalsOverflow` if they do not fit.
fn remaining_in(buckets: &[Bucket], order: &[usize]) -> Result<i64, BucketViolation> {
    order.iter().try_fold(0i64, |sum, &index| {
        sum.checked_add(buckets[index].remaining())
            .ok_or(BucketViolation::TotalsOverflow)
    })
}

fn drain(buckets: &mut [Bucket], order: &[usize], mut amount: i64) {
    for &index in order {
        if amount == 0 {
            break;
        }
        let bucket = &mut buckets[index];
        let take = bucket.remaining().min(amount);
        bucket.consumed += take;
        amount -= take;
    }
}

#[derive(Debug, Clone)]
pub struct BucketLedger {
    settings: LedgerSettings,
}

impl BucketLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// An empty, sealed balance.
    pub fn new_balance(&self, user_id: Uuid, now: DateTime<Utc>) -> UserBalance {
        UserBalance::empty(user_id, self.settings.bonus_monthly_cap, now)
    }

    /// Grant the one-time welcome bucket. Returns false if already granted.
    #[instrument(skip(self, balance), fields(user_id = %balance.user_id))]
    pub fn grant_welcome(
        &self,
        balance: &mut UserBalance,
        now: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        if balance.welcome_bonus_granted_at.is_some() {
            return Ok(false);
        }
        balance.buckets_mut().push(Bucket::new(
            BucketSource::Welcome,
            self.settings.welcome_bonus_seconds,
            Some(now + self.settings.welcome_bonus_ttl),
        ));
        balance.welcome_bonus_granted_at = Some(now);
        seal(balance, now)?;
        Ok(true)
    }

    /// Append a bucket from a purchase, renewal, rollover or admin gift.
    #[instrument(skip(self, balance), fields(user_id = %balance.user_id))]
    pub fn add_bucket(
        &self,
        balance: &mut UserBalance,
        source: BucketSource,
        seconds: i64,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Bucket, QuotaError> {
        if seconds <= 0 {
            return Err(QuotaError::InvalidRequest(
                "bucket seconds must be positive".to_string(),
            ));
        }
        if expires_at.is_some_and(|at| at <= now) {
            return Err(QuotaError::InvalidRequest(
                "bucket expiry must be in the future".to_string(),
            ));
        }
        let bucket = Bucket::new(source, seconds, expires_at);
        balance.buckets_mut().push(bucket.clone());
        if let Err(e) = seal(balance, now) {
            balance.buckets_mut().pop();
            return Err(e);
        }
        debug!(bucket_id = %bucket.id, source = %source, seconds, "Bucket added");
        Ok(bucket)
    }

    /// Today's daily bucket, expiring at the next UTC midnight. `None` if it
    /// was already granted today.
    #[instrument(skip(self, balance), fields(user_id = %balance.user_id))]
    pub fn grant_daily_gift(
        &self,
        balance: &mut UserBalance,
        now: DateTime<Utc>,
    ) -> Result<Option<Bucket>, QuotaError> {
        let expires_at = next_utc_midnight(now);
        let already_granted = balance
            .buckets()
            .iter()
            .any(|b| b.source == BucketSource::Daily && b.expires_at == Some(expires_at));
        if already_granted {
            return Ok(None);
        }
        balance.roll_counters(now);
        let bucket = Bucket::new(
            BucketSource::Daily,
            self.settings.daily_gift_seconds,
            Some(expires_at),
        );
        balance.buckets_mut().push(bucket.clone());
        seal(balance, now)?;
        Ok(Some(bucket))
    }

    /// Spend time: bonus (daily) capacity first, within today's gift
    /// allowance and the monthly bonus cap, then paid buckets by expiry.
    /// All or nothing.
    #[instrument(skip(self, balance), fields(user_id = %balance.user_id))]
    pub fn consume_time(
        &self,
        balance: &mut UserBalance,
        seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<TimeConsumption, QuotaError> {
        if seconds <= 0 {
            return Err(QuotaError::InvalidRequest(
                "seconds must be positive".to_string(),
            ));
        }
        balance.roll_counters(now);

        let bonus_order = drain_order(balance.buckets(), now, |b| b.source.is_bonus());
        let paid_order = drain_order(balance.buckets(), now, |b| b.source.is_paid());

        let allowance = (self.settings.daily_gift_seconds - balance.daily_gift_used_today)
            .min(balance.bonus_headroom())
            .max(0);
        let bonus_available = remaining_in(balance.buckets(), &bonus_order)?.min(allowance);
        let paid_available = remaining_in(balance.buckets(), &paid_order)?;
        let available = bonus_available
            .checked_add(paid_available)
            .ok_or(BucketViolation::TotalsOverflow)?;

        if available < seconds {
            return Err(QuotaError::InsufficientBalance {
                requested: seconds,
                available,
            });
        }

        let bonus_seconds = bonus_available.min(seconds);
        let paid_seconds = seconds - bonus_seconds;
        drain(balance.buckets_mut(), &bonus_order, bonus_seconds);
        drain(balance.buckets_mut(), &paid_order, paid_seconds);

        balance.daily_gift_used_today += bonus_seconds;
        balance.bonus_used_this_month += bonus_seconds;
        seal(balance, now)?;

        Ok(TimeConsumption {
            bonus_seconds,
            paid_seconds,
            totals: balance.totals(),
        })
    }

    /// Bonus units still spendable this month.
    pub fn bonus_headroom(&self, balance: &mut UserBalance, now: DateTime<Utc>) -> i64 {
        balance.roll_counters(now);
        balance.bonus_headroom()
    }

    /// Count bonus spent outside buckets (bonus grants) against the cap.
    pub fn record_bonus_use(
        &self,
        balance: &mut UserBalance,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        balance.roll_counters(now);
        if amount > balance.bonus_headroom() {
            return Err(QuotaError::InvalidRequest(format!(
                "bonus use of {} exceeds monthly headroom {}",
                amount,
                balance.bonus_headroom()
            )));
        }
        balance.bonus_used_this_month += amount;
        seal(balance, now)
    }

    /// Enabling needs a package and records consent; disabling withdraws it.
    pub fn configure_auto_top_up(
        &self,
        balance: &mut UserBalance,
        enabled: bool,
        threshold_seconds: i64,
        package: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        if threshold_seconds < 0 {
            return Err(QuotaError::InvalidRequest(
                "threshold_seconds must not be negative".to_string(),
            ));
        }
        balance.auto_top_up = if enabled {
            let package = package.filter(|p| !p.is_empty()).ok_or_else(|| {
                QuotaError::InvalidRequest("auto top-up needs a package".to_string())
            })?;
            AutoTopUp {
                enabled: true,
                threshold_seconds,
                package: Some(package),
                consent_at: Some(now),
            }
        } else {
            AutoTopUp {
                enabled: false,
                threshold_seconds,
                package: None,
                consent_at: None,
            }
        };
        seal(balance, now)
    }
}
