//! Bonus grant model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::usage::Metric;

/// Promotional capacity for one metric, spent after the plan quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusGrant {
    pub grant_id: Uuid,
    pub user_id: Uuid,
    pub metric: Metric,
    pub amount_granted: i64,
    pub amount_used: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl BonusGrant {
    pub fn available(&self, now: DateTime<Utc>) -> i64 {
        if self.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return 0;
        }
        (self.amount_granted - self.amount_used).max(0)
    }
}

/// Input for creating a bonus grant.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateBonusGrant {
    pub metric: Metric,
    #[validate(range(min = 1, message = "amount must be positive"))]
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
}
