//! Time bucket model.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Funding source of a bucket. Doubles as the variant tag of the persisted
/// JSON shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketSource {
    Daily,
    Subscription,
    Rollover,
    Package,
    Welcome,
    Gift,
}

impl BucketSource {
    pub const ALL: [BucketSource; 6] = [
        BucketSource::Daily,
        BucketSource::Subscription,
        BucketSource::Rollover,
        BucketSource::Package,
        BucketSource::Welcome,
        BucketSource::Gift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Subscription => "subscription",
            Self::Rollover => "rollover",
            Self::Package => "package",
            Self::Welcome => "welcome",
            Self::Gift => "gift",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|source| source.as_str() == s)
    }

    /// Billing-significant capacity.
    pub fn is_paid(&self) -> bool {
        !self.is_bonus()
    }

    /// Abuse-limited free capacity.
    pub fn is_bonus(&self) -> bool {
        matches!(self, Self::Daily)
    }
}

impl std::fmt::Display for BucketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A discrete grant of consumable time.
///
/// Field names are the persisted shape consumed downstream:
/// `{ id, source, seconds, consumed, expires_at }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub source: BucketSource,
    pub seconds: i64,
    pub consumed: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Bucket {
    /// Expiry is kept at microsecond precision, the resolution it is stored at.
    pub fn new(
        source: BucketSource,
        seconds: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            seconds,
            consumed: 0,
            expires_at: expires_at.map(|at| at.trunc_subsecs(6)),
        }
    }

    pub fn remaining(&self) -> i64 {
        (self.seconds - self.consumed).max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Contributes to totals: time left and not expired.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.remaining() > 0 && !self.is_expired(now)
    }
}
