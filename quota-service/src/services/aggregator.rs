//! Balance aggregation: the only producer of a balance's computed totals.

use chrono::{DateTime, Utc};

use crate::error::BucketViolation;
use crate::models::{BalanceTotals, Bucket};

/// Sum remaining time of eligible buckets into paid/bonus totals and find the
/// soonest expiry among them.
///
/// Fails with [`BucketViolation::TotalsOverflow`] when either total, or their
/// sum, would not fit in an `i64`.
pub fn aggregate(
    buckets: &[Bucket],
    now: DateTime<Utc>,
) -> Result<BalanceTotals, BucketViolation> {
    let totals = buckets
        .iter()
        .filter(|bucket| bucket.is_eligible(now))
        .try_fold(BalanceTotals::default(), |mut totals, bucket| {
            let total = if bucket.source.is_paid() {
                &mut totals.total_paid_seconds
            } else {
                &mut totals.total_bonus_seconds
            };
            *total = total
                .checked_add(bucket.remaining())
                .ok_or(BucketViolation::TotalsOverflow)?;
            if let Some(expires_at) = bucket.expires_at {
                totals.next_expiry_at = Some(match totals.next_expiry_at {
                    Some(current) => current.min(expires_at),
                    None => expires_at,
                });
            }
            Ok::<_, BucketViolation>(totals)
        })?;
    totals
        .total_paid_seconds
        .checked_add(totals.total_bonus_seconds)
        .ok_or(BucketViolation::TotalsOverflow)?;
    Ok(totals)
}
