//! Allocation - Budget split orchestration and scheduling
//!
//! The per-cycle flow:
//!
//! ```text
//! schedule entry fires
//!     ↓
//! BudgetAllocationOrchestrator::run_reallocation_cycle()
//!     ↓
//! prior active allocation + refreshed CampaignDeliveryMetrics
//!     ↓
//! AllocationEngine (valuation → node budget split)
//!     ↓
//! export slices → history index + export schedule
//!     ↓
//! ReallocationScheduler (next slot, or cleanup at campaign end)
//! ```
//!
//! Module organization:
//! - `types` - MeasureSet, BudgetAllocation, campaign records
//! - `store` - collaborator traits and the error taxonomy
//! - `engine` - allocation-engine contract
//! - `scheduler` - daily-offset reallocation scheduling
//! - `orchestrator` - the cycle itself
//! - `sqlite_store` - SQLite-backed store/registry implementation
//! - `config` - environment-driven configuration

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod scheduler;
pub mod sqlite_store;
pub mod store;
pub mod types;

pub use config::AllocationConfig;
pub use engine::{AllocationEngine, EngineError, ValuationProportionalEngine};
pub use orchestrator::{mint_allocation_id, BudgetAllocationOrchestrator, CycleError};
pub use scheduler::{ReallocationKind, ReallocationScheduler};
pub use sqlite_store::SqliteCampaignStore;
pub use store::{
    CampaignStore, ScheduleEntry, ScheduleRegistry, StoreError, CLEANUP_REGISTRY, EXPORT_REGISTRY,
    REALLOCATION_REGISTRY,
};
pub use types::{
    AllocationInputs, BudgetAllocation, CampaignRecord, CampaignSettings, HistoryElement,
    MeasureSet, NodeAllocation, NodeInputs, SchedulePhase,
};
