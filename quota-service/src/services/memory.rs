//! In-process quota store.
//!
//! Transactions take one process-wide lock and work on a copy of the state,
//! so every unit of work is serialized and an uncommitted one leaves no trace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::QuotaError;
use crate::models::{
    BonusGrant, IdempotencyRecord, Metric, PlanChangeRecord, QuotaAuditEntry, QuotaDecision,
    RequestFingerprint, UsagePeriodRecord, UserBalance,
};
use crate::services::ledger::verify_sealed;
use crate::services::store::{PruneCutoffs, PruneReport, QuotaStore, QuotaTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    balances: HashMap<Uuid, UserBalance>,
    usage: HashMap<(Uuid, Metric, NaiveDate), UsagePeriodRecord>,
    bonus_grants: HashMap<Uuid, BonusGrant>,
    idempotency: HashMap<(Uuid, String), IdempotencyRecord>,
    plan_changes: Vec<PlanChangeRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<MemoryState>>,
    rate_windows: DashMap<(String, DateTime<Utc>), i64>,
    audit: Mutex<Vec<QuotaAuditEntry>>,
    fail_audit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make audit appends fail, to exercise the best-effort path.
    pub fn set_audit_failure(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Current usage counter, outside any transaction.
    pub async fn usage(&self, user_id: Uuid, metric: Metric, period_start: NaiveDate) -> i64 {
        self.state
            .lock()
            .await
            .usage
            .get(&(user_id, metric, period_start))
            .map(|record| record.current_usage)
            .unwrap_or(0)
    }

    pub async fn usage_record(
        &self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
    ) -> Option<UsagePeriodRecord> {
        self.state
            .lock()
            .await
            .usage
            .get(&(user_id, metric, period_start))
            .cloned()
    }

    pub async fn idempotency_record(&self, user_id: Uuid, key: &str) -> Option<IdempotencyRecord> {
        self.state
            .lock()
            .await
            .idempotency
            .get(&(user_id, key.to_string()))
            .cloned()
    }

    pub async fn bonus_grant(&self, grant_id: Uuid) -> Option<BonusGrant> {
        self.state.lock().await.bonus_grants.get(&grant_id).cloned()
    }

    pub async fn plan_changes(&self, user_id: Uuid) -> Vec<PlanChangeRecord> {
        self.state
            .lock()
            .await
            .plan_changes
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn audit_entries(&self) -> Vec<QuotaAuditEntry> {
        self.audit.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn QuotaTx>, QuotaError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn hit_rate_window(
        &self,
        identifier: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64, QuotaError> {
        let mut count = self
            .rate_windows
            .entry((identifier.to_string(), window_start))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn append_audit(&self, entry: &QuotaAuditEntry) -> Result<(), QuotaError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(QuotaError::Storage(anyhow::anyhow!(
                "audit log unavailable"
            )));
        }
        self.audit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }

    async fn recent_audit(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<QuotaAuditEntry>, QuotaError> {
        let audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        Ok(audit
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn prune(&self, cutoffs: PruneCutoffs) -> Result<PruneReport, QuotaError> {
        let mut report = PruneReport::default();

        {
            let mut state = self.state.lock().await;
            let before = state.idempotency.len();
            state
                .idempotency
                .retain(|_, record| record.created_utc >= cutoffs.idempotency_before);
            report.idempotency_records = (before - state.idempotency.len()) as u64;
        }

        {
            let mut audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
            let before = audit.len();
            audit.retain(|entry| entry.created_at >= cutoffs.audit_before);
            report.audit_entries = (before - audit.len()) as u64;
        }

        let before = self.rate_windows.len();
        self.rate_windows
            .retain(|(_, window_start), _| *window_start >= cutoffs.rate_windows_before);
        report.rate_windows = (before - self.rate_windows.len()) as u64;

        Ok(report)
    }

    async fn health_check(&self) -> Result<(), QuotaError> {
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl QuotaTx for MemoryTx {
    async fn claim_idempotency(
        &mut self,
        user_id: Uuid,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<Option<IdempotencyRecord>, QuotaError> {
        let map_key = (user_id, key.to_string());
        if let Some(existing) = self.working.idempotency.get(&map_key) {
            return Ok(Some(existing.clone()));
        }
        self.working.idempotency.insert(
            map_key,
            IdempotencyRecord {
                user_id,
                idempotency_key: key.to_string(),
                fingerprint: fingerprint.clone(),
                result: None,
                collision_flagged: false,
                collision_count: 0,
                created_utc: fingerprint.requested_at,
            },
        );
        Ok(None)
    }

    async fn complete_idempotency(
        &mut self,
        user_id: Uuid,
        key: &str,
        decision: &QuotaDecision,
    ) -> Result<(), QuotaError> {
        let record = self
            .working
            .idempotency
            .get_mut(&(user_id, key.to_string()))
            .ok_or_else(|| QuotaError::storage("complete idempotency", "claim not found"))?;
        record.result = Some(decision.clone());
        Ok(())
    }

    async fn flag_collision(&mut self, user_id: Uuid, key: &str) -> Result<(), QuotaError> {
        if let Some(record) = self.working.idempotency.get_mut(&(user_id, key.to_string())) {
            record.collision_flagged = true;
            record.collision_count += 1;
        }
        Ok(())
    }

    async fn lock_usage(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<i64, QuotaError> {
        let record = self
            .working
            .usage
            .entry((user_id, metric, period_start))
            .or_insert_with(|| UsagePeriodRecord {
                user_id,
                metric,
                period_start,
                current_usage: 0,
                updated_utc: now,
            });
        Ok(record.current_usage)
    }

    async fn set_usage(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        period_start: NaiveDate,
        usage: i64,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let record = self
            .working
            .usage
            .get_mut(&(user_id, metric, period_start))
            .ok_or_else(|| QuotaError::storage("set usage", "counter not locked"))?;
        record.current_usage = usage;
        record.updated_utc = now;
        Ok(())
    }

    async fn period_usage(
        &mut self,
        user_id: Uuid,
        period_start: NaiveDate,
    ) -> Result<Vec<(Metric, i64)>, QuotaError> {
        let mut usage: Vec<(Metric, i64)> = self
            .working
            .usage
            .values()
            .filter(|record| record.user_id == user_id && record.period_start == period_start)
            .map(|record| (record.metric, record.current_usage))
            .collect();
        usage.sort();
        Ok(usage)
    }

    async fn lock_bonus_grants(
        &mut self,
        user_id: Uuid,
        metric: Metric,
        now: DateTime<Utc>,
    ) -> Result<Vec<BonusGrant>, QuotaError> {
        Ok(self
            .working
            .bonus_grants
            .values()
            .filter(|grant| {
                grant.user_id == user_id && grant.metric == metric && grant.available(now) > 0
            })
            .cloned()
            .collect())
    }

    async fn set_bonus_used(
        &mut self,
        grant_id: Uuid,
        amount_used: i64,
    ) -> Result<(), QuotaError> {
        let grant = self
            .working
            .bonus_grants
            .get_mut(&grant_id)
            .ok_or_else(|| QuotaError::storage("debit bonus grant", "grant not found"))?;
        if amount_used < 0 || amount_used > grant.amount_granted {
            return Err(QuotaError::storage(
                "debit bonus grant",
                format!("amount_used {} out of range", amount_used),
            ));
        }
        grant.amount_used = amount_used;
        Ok(())
    }

    async fn insert_bonus_grant(&mut self, grant: &BonusGrant) -> Result<(), QuotaError> {
        self.working
            .bonus_grants
            .insert(grant.grant_id, grant.clone());
        Ok(())
    }

    async fn lock_balance(&mut self, user_id: Uuid) -> Result<Option<UserBalance>, QuotaError> {
        Ok(self.working.balances.get(&user_id).cloned())
    }

    async fn save_balance(&mut self, balance: &UserBalance) -> Result<(), QuotaError> {
        verify_sealed(balance)?;
        self.working
            .balances
            .insert(balance.user_id, balance.clone());
        Ok(())
    }

    async fn insert_plan_change(&mut self, record: &PlanChangeRecord) -> Result<(), QuotaError> {
        self.working.plan_changes.push(record.clone());
        Ok(())
    }

    async fn plan_changed_between(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, QuotaError> {
        Ok(self.working.plan_changes.iter().any(|record| {
            record.user_id == user_id
                && record.effective_at >= since
                && record.effective_at <= until
        }))
    }

    async fn commit(self: Box<Self>) -> Result<(), QuotaError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
