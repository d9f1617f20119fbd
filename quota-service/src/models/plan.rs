//! Plan limits and plan-change records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use validator::Validate;

use super::usage::Metric;

/// Effective stand-in for "unlimited".
pub const UNLIMITED_QUOTA: i64 = 1_000_000_000;

/// Limit reported by the plan lookup. Negative limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub limit: i64,
    pub plan_name: String,
}

impl PlanLimits {
    pub fn new(limit: i64, plan_name: impl Into<String>) -> Self {
        Self {
            limit,
            plan_name: plan_name.into(),
        }
    }

    pub fn fallback(metric: Metric) -> Self {
        Self::new(metric.fallback_limit(), "fallback")
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit < 0 || self.limit >= UNLIMITED_QUOTA
    }

    pub fn effective_limit(&self) -> i64 {
        if self.is_unlimited() {
            UNLIMITED_QUOTA
        } else {
            self.limit
        }
    }
}

/// Longest plan name a plan-change record will hold.
pub const MAX_PLAN_NAME_LEN: usize = 255;

/// Subscription-change event from the billing side.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubscriptionChange {
    pub user_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "old_plan must be 1 to 255 characters"))]
    pub old_plan: String,
    #[validate(length(min = 1, max = 255, message = "new_plan must be 1 to 255 characters"))]
    pub new_plan: String,
    pub effective_at: DateTime<Utc>,
}

/// Usage snapshot taken at a plan transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChangeRecord {
    pub change_id: Uuid,
    pub user_id: Uuid,
    pub old_plan: String,
    pub new_plan: String,
    pub effective_at: DateTime<Utc>,
    pub period_start: NaiveDate,
    pub usage_snapshot: BTreeMap<Metric, i64>,
    pub recorded_utc: DateTime<Utc>,
}
