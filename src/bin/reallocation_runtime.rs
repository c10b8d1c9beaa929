//! Reallocation Runtime - schedule-driven allocation cycles
//!
//! This binary polls the SQLite-backed schedule and runs the due work:
//! - reallocation entries → one full budget allocation cycle each
//! - cleanup entries → post-campaign cleanup
//!
//! Usage:
//!   cargo run --release --bin reallocation_runtime
//!
//! Environment variables:
//!   BUDGETFLOW_DB_PATH - SQLite database path
//!   BUDGETFLOW_POLL_INTERVAL_MS - schedule poll interval (default: 60000)
//!   (see AllocationConfig for the full list)

use budgetflow::allocation::{
    AllocationConfig, BudgetAllocationOrchestrator, CampaignStore, ScheduleRegistry,
    SqliteCampaignStore, ValuationProportionalEngine, CLEANUP_REGISTRY, REALLOCATION_REGISTRY,
};
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::{interval, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = AllocationConfig::from_env();

    info!("🚀 Reallocation Runtime");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Poll interval: {}ms", config.poll_interval_ms);
    info!("   ├─ Daily offsets: {:?} (minutes)", config.daily_offset_minutes);
    info!("   └─ Lookback: {}h", config.look_back_hours);

    let store = Arc::new(SqliteCampaignStore::new(&config.db_path)?);
    let registry: Arc<dyn ScheduleRegistry> = store.clone();
    let campaign_store: Arc<dyn CampaignStore> = store.clone();
    let orchestrator = BudgetAllocationOrchestrator::new(
        campaign_store,
        registry.clone(),
        Arc::new(ValuationProportionalEngine),
        config.clone(),
    );

    let mut timer = interval(Duration::from_millis(config.poll_interval_ms));
    loop {
        timer.tick().await;
        let now = chrono::Utc::now();

        let due = match registry.due_entries(REALLOCATION_REGISTRY, now).await {
            Ok(due) => due,
            Err(e) => {
                error!("❌ failed to read reallocation schedule: {}", e);
                continue;
            }
        };
        for (fired_at, entry) in due {
            info!(
                "⏰ reallocation due for campaign {} (scheduled {})",
                entry.campaign_id, fired_at
            );
            match orchestrator
                .run_reallocation_cycle(&entry.campaign_id, fired_at, false, now)
                .await
            {
                Ok(allocation) => info!(
                    "✅ campaign {} reallocated across {} nodes",
                    entry.campaign_id,
                    allocation.node_results.len()
                ),
                // The entry was cleared by the cycle; the next scheduler
                // tick retries the campaign wholesale.
                Err(e) => error!("❌ cycle failed for {}: {}", entry.campaign_id, e),
            }
        }

        let due = match registry.due_entries(CLEANUP_REGISTRY, now).await {
            Ok(due) => due,
            Err(e) => {
                error!("❌ failed to read cleanup schedule: {}", e);
                continue;
            }
        };
        for (_, entry) in due {
            if let Err(e) = orchestrator.run_cleanup(&entry.campaign_id).await {
                warn!("⚠️  cleanup failed for {}: {}", entry.campaign_id, e);
            }
        }
    }
}
