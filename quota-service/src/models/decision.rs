//! Request and result shapes of the quota decision engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::AuditReason;
use super::usage::Metric;

/// Longest idempotency key a store will hold.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Input of `check_and_consume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
    pub metric: Metric,
    pub amount: i64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub caller_ip: Option<String>,
}

impl ConsumeRequest {
    pub fn new(user_id: Uuid, metric: Metric, amount: i64) -> Self {
        Self {
            user_id,
            metric,
            amount,
            idempotency_key: None,
            caller_ip: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_caller_ip(mut self, ip: impl Into<String>) -> Self {
        self.caller_ip = Some(ip.into());
        self
    }

    /// Identity the rate limiter keys on: caller IP, else the user.
    pub fn rate_limit_identifier(&self) -> String {
        match self.caller_ip.as_deref().filter(|ip| !ip.is_empty()) {
            Some(ip) => format!("ip:{}", ip),
            None => format!("user:{}", self.user_id),
        }
    }

    /// Blank keys count as absent.
    pub fn effective_key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Result of `check_and_consume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub bonus_used: i64,
    pub already_processed: bool,
    pub rate_limited: bool,
    pub plan_changed: bool,
    pub reason: AuditReason,
    pub message: String,
    /// Seconds until the rate-limit window resets, on rate-limited denials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl QuotaDecision {
    pub fn allowed(remaining: i64, limit: i64, bonus_used: i64) -> Self {
        Self::build(true, remaining, limit, bonus_used, AuditReason::Success)
    }

    pub fn quota_exceeded(remaining: i64, limit: i64) -> Self {
        Self::build(false, remaining, limit, 0, AuditReason::QuotaExceeded)
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            rate_limited: true,
            retry_after_secs: Some(retry_after_secs),
            ..Self::build(false, 0, 0, 0, AuditReason::RateLimited)
        }
    }

    pub fn collision() -> Self {
        Self::build(false, 0, 0, 0, AuditReason::Collision)
    }

    /// The stored result, marked as a replay.
    pub fn replayed(self) -> Self {
        Self {
            already_processed: true,
            ..self
        }
    }

    fn build(allowed: bool, remaining: i64, limit: i64, bonus_used: i64, reason: AuditReason) -> Self {
        Self {
            allowed,
            remaining,
            limit,
            bonus_used,
            already_processed: false,
            rate_limited: false,
            plan_changed: false,
            reason,
            message: reason.message().to_string(),
            retry_after_secs: None,
        }
    }
}

/// Result of a refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResult {
    pub success: bool,
    pub previous_usage: i64,
    pub new_usage: i64,
    pub message: String,
}
