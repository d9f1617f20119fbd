//! Services module for quota-service.

pub mod aggregator;
pub mod audit;
pub mod bonus;
pub mod clock;
pub mod database;
pub mod engine;
pub mod idempotency;
pub mod integrity;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod plan_change;
pub mod plans;
pub mod quota;
pub mod rate_limiter;
pub mod refund;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use plans::{PlanLookup, StaticPlanCatalog};
pub use quota::QuotaService;
pub use store::{QuotaStore, QuotaTx};
