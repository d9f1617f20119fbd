//! Idempotency guard.
//!
//! Claims a (user, key) pair inside the caller's transaction. The storage
//! uniqueness constraint settles concurrent first requests: exactly one
//! insert wins, the rest see the winner's record.

use chrono::{DateTime, Duration, Utc};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{ClaimOutcome, RequestFingerprint};
use crate::services::store::QuotaTx;

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyGuard {
    collision_window: Duration,
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

impl IdempotencyGuard {
    pub fn new(collision_window: Duration) -> Self {
        Self { collision_window }
    }

    pub fn collision_window(&self) -> Duration {
        self.collision_window
    }

    /// Claim `key` for `fingerprint`.
    ///
    /// A claimed key with no stored decision belongs to a transaction that
    /// has not committed; under serializable isolation that only shows up as
    /// a conflict, so it is reported as one.
    #[instrument(skip(self, tx, fingerprint), fields(user_id = %user_id))]
    pub async fn claim(
        &self,
        tx: &mut dyn QuotaTx,
        user_id: Uuid,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<ClaimOutcome, QuotaError> {
        let Some(existing) = tx.claim_idempotency(user_id, key, fingerprint).await? else {
            return Ok(ClaimOutcome::Proceed);
        };

        // Matching parameters replay regardless of the collision window.
        if existing.fingerprint.matches(fingerprint) {
            return match existing.result {
                Some(decision) => Ok(ClaimOutcome::Replay(decision.replayed())),
                None => Err(QuotaError::SerializationConflict),
            };
        }

        // A mismatch is a collision whatever the elapsed time. The window
        // only sets the `within_window` flag on the audit entry.
        let within_window =
            self.within_window(existing.fingerprint.requested_at, fingerprint.requested_at);
        warn!(
            idempotency_key = %key,
            original_metric = %existing.fingerprint.metric,
            original_amount = existing.fingerprint.amount,
            metric = %fingerprint.metric,
            amount = fingerprint.amount,
            within_window,
            "Idempotency key reused with different parameters"
        );
        tx.flag_collision(user_id, key).await?;

        Ok(ClaimOutcome::Collision {
            original: existing.fingerprint,
            within_window,
        })
    }

    fn within_window(&self, original: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(original) <= self.collision_window
    }
}
