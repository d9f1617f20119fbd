//! Quota audit entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::usage::Metric;

/// Why a call ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    Success,
    QuotaExceeded,
    RateLimited,
    IdempotentReplay,
    Collision,
    PlanChanged,
    Refund,
}

impl AuditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::IdempotentReplay => "idempotent_replay",
            Self::Collision => "collision",
            Self::PlanChanged => "plan_changed",
            Self::Refund => "refund",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            "rate_limited" => Some(Self::RateLimited),
            "idempotent_replay" => Some(Self::IdempotentReplay),
            "collision" => Some(Self::Collision),
            "plan_changed" => Some(Self::PlanChanged),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }

    /// Message a client can render.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::QuotaExceeded => "quota exceeded",
            Self::RateLimited => "too many requests",
            Self::IdempotentReplay => "already processed",
            Self::Collision => "idempotency key reused with different parameters",
            Self::PlanChanged => "plan changed",
            Self::Refund => "usage refunded",
        }
    }
}

impl std::fmt::Display for AuditReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable, append-only record of one decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaAuditEntry {
    pub entry_id: Uuid,
    pub user_id: Uuid,
    pub metric: Option<Metric>,
    pub attempted_amount: i64,
    pub success: bool,
    pub reason: AuditReason,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl QuotaAuditEntry {
    pub fn new(
        user_id: Uuid,
        metric: Option<Metric>,
        attempted_amount: i64,
        success: bool,
        reason: AuditReason,
        context: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            user_id,
            metric,
            attempted_amount,
            success,
            reason,
            context,
            created_at,
        }
    }
}
