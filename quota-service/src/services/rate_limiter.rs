//! Fixed-window request limiter, one window per identifier per UTC minute.

use std::sync::Arc;

use chrono::{DateTime, DurationRound, Timelike, Utc};
use tracing::{debug, warn};

use crate::services::metrics::RATE_LIMITED_TOTAL;
use crate::services::store::QuotaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow { count: i64 },
    Deny { count: i64, retry_after_secs: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }
}

/// Start of the minute containing `now`.
pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(now)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    ceiling: i64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, ceiling: i64) -> Self {
        Self { store, ceiling }
    }

    pub fn ceiling(&self) -> i64 {
        self.ceiling
    }

    /// Count this request against the identifier's current window.
    ///
    /// Storage failures admit the request: throttling is not worth an outage.
    pub async fn admit(&self, identifier: &str, now: DateTime<Utc>) -> Admission {
        let window = window_start(now);
        let count = match self.store.hit_rate_window(identifier, window).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, identifier = %identifier, "Rate limit check failed, allowing request");
                return Admission::Allow { count: 0 };
            }
        };

        if count > self.ceiling {
            RATE_LIMITED_TOTAL.inc();
            let retry_after_secs = 60 - u64::from(now.second()).min(59);
            debug!(identifier = %identifier, count, "Rate limit exceeded");
            return Admission::Deny {
                count,
                retry_after_secs,
            };
        }

        Admission::Allow { count }
    }
}
