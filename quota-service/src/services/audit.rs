//! Append-only audit trail of quota decisions.
//!
//! Writes happen after the decision's transaction commits and never undo it.
//! Entries that fail to persist are kept in a bounded in-memory buffer and
//! retried by [`AuditLogger::flush_deferred`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::models::QuotaAuditEntry;
use crate::services::metrics::AUDIT_FAILURES_TOTAL;
use crate::services::store::QuotaStore;

const MAX_DEFERRED: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditWrite {
    Recorded,
    Deferred,
}

pub struct AuditLogger {
    store: Arc<dyn QuotaStore>,
    deferred: Mutex<VecDeque<QuotaAuditEntry>>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, entry: QuotaAuditEntry) -> AuditWrite {
        match self.store.append_audit(&entry).await {
            Ok(()) => AuditWrite::Recorded,
            Err(e) => {
                AUDIT_FAILURES_TOTAL.inc();
                warn!(
                    error = %e,
                    user_id = %entry.user_id,
                    reason = %entry.reason,
                    "Audit write failed, deferring entry"
                );
                self.defer(entry);
                AuditWrite::Deferred
            }
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.lock_deferred().len()
    }

    /// Retry deferred entries in order, stopping at the first failure.
    /// Returns how many were written.
    pub async fn flush_deferred(&self) -> usize {
        let mut written = 0;
        loop {
            let next = self.lock_deferred().pop_front();
            let Some(entry) = next else {
                break;
            };
            if let Err(e) = self.store.append_audit(&entry).await {
                warn!(error = %e, remaining = self.deferred_len() + 1, "Audit flush failed");
                self.lock_deferred().push_front(entry);
                break;
            }
            written += 1;
        }
        if written > 0 {
            info!(written, "Flushed deferred audit entries");
        }
        written
    }

    fn defer(&self, entry: QuotaAuditEntry) {
        let mut deferred = self.lock_deferred();
        if deferred.len() >= MAX_DEFERRED {
            if let Some(dropped) = deferred.pop_front() {
                error!(entry_id = %dropped.entry_id, "Audit buffer full, dropping oldest entry");
            }
        }
        deferred.push_back(entry);
    }

    fn lock_deferred(&self) -> std::sync::MutexGuard<'_, VecDeque<QuotaAuditEntry>> {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }
}
