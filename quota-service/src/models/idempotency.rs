//! Idempotency record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::QuotaDecision;
use super::usage::Metric;

/// What a request asked for, remembered under its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub metric: Metric,
    pub amount: i64,
    pub requested_at: DateTime<Utc>,
}

impl RequestFingerprint {
    /// Same parameters; timing is not part of the match.
    pub fn matches(&self, other: &RequestFingerprint) -> bool {
        self.metric == other.metric && self.amount == other.amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub fingerprint: RequestFingerprint,
    pub result: Option<QuotaDecision>,
    pub collision_flagged: bool,
    pub collision_count: i32,
    pub created_utc: DateTime<Utc>,
}

/// Outcome of claiming a key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// First sight of the key; the caller owns the execution.
    Proceed,
    /// Exact repeat; the stored result is returned untouched.
    Replay(QuotaDecision),
    /// Key reused with different parameters.
    Collision {
        original: RequestFingerprint,
        within_window: bool,
    },
}
