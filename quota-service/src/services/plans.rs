//! Plan limit lookup.
//!
//! The billing side owns plans. The engine only needs "what is this user's
//! limit for this metric", behind [`PlanLookup`]. [`StaticPlanCatalog`] is the
//! in-process implementation used when no billing integration is wired in.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Metric, PlanLimits};

#[async_trait]
pub trait PlanLookup: Send + Sync {
    /// `Ok(None)` when the user has no plan for this metric.
    async fn get_plan_limits(
        &self,
        user_id: Uuid,
        metric: Metric,
    ) -> anyhow::Result<Option<PlanLimits>>;

    /// Told about subscription changes after they are recorded.
    async fn plan_changed(&self, _user_id: Uuid, _new_plan: &str) {}
}

/// Limits for a user, falling back to the built-in defaults when the lookup
/// fails or has nothing.
pub async fn resolve_limits(lookup: &dyn PlanLookup, user_id: Uuid, metric: Metric) -> PlanLimits {
    match lookup.get_plan_limits(user_id, metric).await {
        Ok(Some(limits)) => limits,
        Ok(None) => {
            debug!(user_id = %user_id, metric = %metric, "No plan limits, using fallback");
            PlanLimits::fallback(metric)
        }
        Err(e) => {
            warn!(user_id = %user_id, metric = %metric, error = %e, "Plan lookup failed, using fallback");
            PlanLimits::fallback(metric)
        }
    }
}

/// Named plans with per-metric limits, plus which plan each user is on.
pub struct StaticPlanCatalog {
    plans: HashMap<String, HashMap<Metric, i64>>,
    default_plan: String,
    assignments: DashMap<Uuid, String>,
}

impl StaticPlanCatalog {
    pub fn new(default_plan: impl Into<String>) -> Self {
        Self {
            plans: HashMap::new(),
            default_plan: default_plan.into(),
            assignments: DashMap::new(),
        }
    }

    /// `free`, `pro` and `enterprise`, with `free` as the default.
    pub fn with_default_plans() -> Self {
        Self::new("free")
            .with_plan(
                "free",
                [
                    (Metric::AiGenerations, 10),
                    (Metric::Exports, 5),
                    (Metric::Projects, 3),
                    (Metric::ApiCalls, 100),
                ],
            )
            .with_plan(
                "pro",
                [
                    (Metric::AiGenerations, 100),
                    (Metric::Exports, 50),
                    (Metric::Projects, 25),
                    (Metric::ApiCalls, 5_000),
                ],
            )
            .with_plan("enterprise", Metric::ALL.map(|metric| (metric, -1)))
    }

    pub fn with_plan(
        mut self,
        name: impl Into<String>,
        limits: impl IntoIterator<Item = (Metric, i64)>,
    ) -> Self {
        self.plans.insert(name.into(), limits.into_iter().collect());
        self
    }

    pub fn assign(&self, user_id: Uuid, plan: impl Into<String>) {
        self.assignments.insert(user_id, plan.into());
    }

    pub fn plan_of(&self, user_id: Uuid) -> String {
        self.assignments
            .get(&user_id)
            .map(|plan| plan.value().clone())
            .unwrap_or_else(|| self.default_plan.clone())
    }
}

#[async_trait]
impl PlanLookup for StaticPlanCatalog {
    async fn get_plan_limits(
        &self,
        user_id: Uuid,
        metric: Metric,
    ) -> anyhow::Result<Option<PlanLimits>> {
        let plan = self.plan_of(user_id);
        let limits = self
            .plans
            .get(&plan)
            .ok_or_else(|| anyhow::anyhow!("plan '{}' is not in the catalog", plan))?;
        Ok(limits.get(&metric).map(|&limit| PlanLimits::new(limit, plan)))
    }

    async fn plan_changed(&self, user_id: Uuid, new_plan: &str) {
        self.assign(user_id, new_plan);
    }
}
