//! Bonus allocator: covers usage beyond the plan limit from bonus grants.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{BonusGrant, Metric};
use crate::services::store::QuotaTx;

/// One debit against one grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BonusDebit {
    pub grant_id: Uuid,
    pub amount: i64,
    /// `amount_used` after the debit.
    pub new_used: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BonusAllocation {
    pub debits: Vec<BonusDebit>,
    pub applied: i64,
}

impl BonusAllocation {
    pub fn covers(&self, needed: i64) -> bool {
        self.applied >= needed
    }
}

/// Walk grants soonest-expiring first (never-expiring last, then oldest
/// first) and take what each one has left until `needed` is covered.
pub fn plan(grants: &[BonusGrant], needed: i64, now: DateTime<Utc>) -> BonusAllocation {
    let mut ordered: Vec<&BonusGrant> = grants.iter().filter(|g| g.available(now) > 0).collect();
    ordered.sort_by_key(|g| (g.expires_at.is_none(), g.expires_at, g.created_utc));

    let mut allocation = BonusAllocation::default();
    let mut outstanding = needed.max(0);
    for grant in ordered {
        if outstanding == 0 {
            break;
        }
        let take = grant.available(now).min(outstanding);
        allocation.debits.push(BonusDebit {
            grant_id: grant.grant_id,
            amount: take,
            new_used: grant.amount_used + take,
        });
        allocation.applied += take;
        outstanding -= take;
    }
    allocation
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BonusAllocator;

impl BonusAllocator {
    /// Plan against the user's locked grants and write the debits, but only
    /// when they cover `needed` in full. A short allocation is returned
    /// without touching storage.
    #[instrument(skip(self, tx), fields(user_id = %user_id, metric = %metric))]
    pub async fn allocate(
        &self,
        tx: &mut dyn QuotaTx,
        user_id: Uuid,
        metric: Metric,
        needed: i64,
        now: DateTime<Utc>,
    ) -> Result<BonusAllocation, QuotaError> {
        if needed <= 0 {
            return Ok(BonusAllocation::default());
        }

        let grants = tx.lock_bonus_grants(user_id, metric, now).await?;
        let allocation = plan(&grants, needed, now);

        if !allocation.covers(needed) {
            debug!(needed, available = allocation.applied, "Bonus grants cannot cover overage");
            return Ok(allocation);
        }

        for debit in &allocation.debits {
            tx.set_bonus_used(debit.grant_id, debit.new_used).await?;
        }
        Ok(allocation)
    }
}
