//! Budget allocation cycle orchestration
//!
//! One reallocation cycle: load prior state, refresh delivery metrics,
//! invoke the allocation engine, persist snapshots and the history index,
//! derive export slices, and advance the schedule. Cycles are idempotent
//! with respect to scheduling state (every cycle clears the campaign's
//! pending entries before writing new ones), while history writes are
//! append-only and never retracted.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::config::AllocationConfig;
use super::engine::{AllocationEngine, EngineError};
use super::scheduler::{ReallocationKind, ReallocationScheduler};
use super::store::{
    CampaignStore, ScheduleEntry, ScheduleRegistry, StoreError, CLEANUP_REGISTRY, EXPORT_REGISTRY,
    REALLOCATION_REGISTRY,
};
use super::types::{
    AllocationInputs, BudgetAllocation, CampaignRecord, HistoryElement, NodeInputs, SchedulePhase,
};
use crate::delivery_core::canonical::CanonicalDeliveryData;
use crate::delivery_core::eligibility::{filter_index, EligibilityHistory};
use crate::delivery_core::metrics::DeliveryMetricsEngine;

#[derive(Debug)]
pub enum CycleError {
    Store(StoreError),
    Engine(EngineError),
    /// Unrecoverable logic failure: unresolvable remaining budget, a
    /// rejected report batch, exhausted save retries.
    Logic(String),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Store(e) => write!(f, "store error: {}", e),
            CycleError::Engine(e) => write!(f, "engine error: {}", e),
            CycleError::Logic(what) => write!(f, "cycle error: {}", what),
        }
    }
}

impl std::error::Error for CycleError {}

impl From<StoreError> for CycleError {
    fn from(err: StoreError) -> Self {
        CycleError::Store(err)
    }
}

impl From<EngineError> for CycleError {
    fn from(err: EngineError) -> Self {
        CycleError::Engine(err)
    }
}

/// Mint a fresh 32-hex identifier for allocation blobs and node ids.
pub fn mint_allocation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct BudgetAllocationOrchestrator {
    store: Arc<dyn CampaignStore>,
    registry: Arc<dyn ScheduleRegistry>,
    engine: Arc<dyn AllocationEngine>,
    scheduler: ReallocationScheduler,
    metrics_engine: DeliveryMetricsEngine,
    config: AllocationConfig,
}

impl BudgetAllocationOrchestrator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        registry: Arc<dyn ScheduleRegistry>,
        engine: Arc<dyn AllocationEngine>,
        config: AllocationConfig,
    ) -> Self {
        let scheduler = ReallocationScheduler::new(registry.clone(), config.clone());
        let metrics_engine =
            DeliveryMetricsEngine::new(config.report_dead_zone_hours, config.look_back_hours);
        Self {
            store,
            registry,
            engine,
            scheduler,
            metrics_engine,
            config,
        }
    }

    /// Run one reallocation cycle for a campaign.
    ///
    /// `period_start` opens the allocation period; its duration is fixed by
    /// the next scheduled reallocation. `is_initial` marks the very first
    /// allocation at campaign setup; an active allocation in which no node
    /// was ever exported counts as initial too.
    pub async fn run_reallocation_cycle(
        &self,
        campaign_id: &str,
        period_start: DateTime<Utc>,
        is_initial: bool,
        now: DateTime<Utc>,
    ) -> Result<BudgetAllocation, CycleError> {
        let mut record = self.store.fetch_campaign(campaign_id).await?;
        log::info!(
            "🔄 reallocation cycle for campaign {} (period start {})",
            campaign_id,
            period_start
        );

        // At most one pending schedule entry per campaign per kind; a
        // retried cycle starts from a clean slate.
        self.registry
            .remove_entries(REALLOCATION_REGISTRY, campaign_id)
            .await?;
        self.registry
            .remove_entries(EXPORT_REGISTRY, campaign_id)
            .await?;

        // Best effort only; the cycle proceeds on the cached valuations.
        if let Err(e) = self.store.refresh_valuations(campaign_id).await {
            log::warn!("⚠️  valuation cache refresh failed for {}: {}", campaign_id, e);
        }
        let valuations = match self.store.load_approved_valuations(campaign_id).await {
            Ok(valuations) => valuations,
            Err(StoreError::NotFound(_)) => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut active = match &record.active_allocation_id {
            Some(blob_id) => match self.store.load_allocation_blob(blob_id).await {
                Ok(active) => active,
                // First cycle: the association exists but nothing behind it.
                Err(StoreError::NotFound(_)) => BudgetAllocation::default(),
                Err(e) => return Err(e.into()),
            },
            None => BudgetAllocation::default(),
        };

        let metrics = self.refresh_metrics(&record, &mut active).await?;
        let initial = is_initial || active.is_initial();

        // Period duration falls out of the schedule: it runs until the next
        // reallocation fires.
        let kind = if initial {
            ReallocationKind::First
        } else {
            ReallocationKind::Regular
        };
        let next_start = self
            .scheduler
            .schedule_next_reallocation(&record, false, kind, now)
            .await?;
        let period_duration_hours = (next_start - period_start).num_hours();

        let remaining_budget = if initial {
            Some(record.settings.total_budget)
        } else {
            // Open question upstream whether this should retry; current
            // behavior is fatal.
            let resolved = metrics
                .remaining_budget
                .or(active.remaining_budget)
                .ok_or_else(|| {
                    CycleError::Logic(format!(
                        "remaining budget unresolvable for campaign {}",
                        campaign_id
                    ))
                })?;
            Some(resolved)
        };
        let value_volume_score = if initial {
            0.0
        } else {
            active
                .node_results
                .values()
                .map(|n| n.valuation * n.effective_impressions / 1000.0)
                .sum()
        };

        let mut node_inputs: HashMap<_, NodeInputs> = HashMap::new();
        for (node, result) in &active.node_results {
            node_inputs.insert(
                node.clone(),
                NodeInputs {
                    valuation: 0.0,
                    export_count: result.export_count,
                    effective_impressions: metrics
                        .nodes
                        .get(node)
                        .map(|m| m.total_impressions)
                        .unwrap_or(0.0),
                },
            );
        }
        for (node, valuation) in &valuations {
            let entry = node_inputs.entry(node.clone()).or_default();
            entry.valuation = *valuation;
            entry.effective_impressions = metrics
                .nodes
                .get(node)
                .map(|m| m.total_impressions)
                .unwrap_or(entry.effective_impressions);
        }

        let inputs = AllocationInputs {
            campaign_id: campaign_id.to_string(),
            period_start,
            period_duration_hours,
            remaining_budget,
            value_volume_score,
            nodes: node_inputs,
        };

        let mut allocation = self.engine.get_budget_allocations(&inputs, initial)?;
        allocation.period_start = Some(period_start);
        allocation.period_duration_hours = period_duration_hours;

        // Stabilize allocation ids: a node keeps the id the delivery
        // networks already know it by.
        for (node, result) in allocation.node_results.iter_mut() {
            match record.allocation_id_for(node).cloned() {
                Some(existing) => result.allocation_id = existing,
                None => {
                    let minted = mint_allocation_id();
                    record.node_map.insert(minted.clone(), node.clone());
                    result.allocation_id = minted;
                }
            }
        }

        self.persist_and_schedule_exports(&mut record, &allocation, initial, now)
            .await?;

        allocation.metrics = Some(metrics);
        let active_blob_id = mint_allocation_id();
        self.store
            .save_allocation_blob(&active_blob_id, &allocation)
            .await?;
        record.active_allocation_id = Some(active_blob_id);
        record.phase = if initial {
            SchedulePhase::AwaitingFirstReallocation
        } else {
            SchedulePhase::RegularReallocation
        };

        self.save_campaign_associations(&record).await?;

        log::info!(
            "✅ campaign {} allocated {} nodes for {}h from {}",
            campaign_id,
            allocation.node_results.len(),
            period_duration_hours,
            period_start
        );
        Ok(allocation)
    }

    /// Replay eligibility from the bounded history index and fold the
    /// stored canonical delivery data into the campaign metrics.
    async fn refresh_metrics(
        &self,
        record: &CampaignRecord,
        active: &mut BudgetAllocation,
    ) -> Result<crate::delivery_core::metrics::CampaignDeliveryMetrics, CycleError> {
        let canonical = match self
            .store
            .load_delivery_data(&record.campaign_id, record.settings.delivery_network)
            .await
        {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => {
                CanonicalDeliveryData::new(record.settings.delivery_network)
            }
            Err(e) => return Err(e.into()),
        };

        let filtered = filter_index(
            &record.history_index,
            self.config.look_back_hours,
            canonical.latest_delivery_data_date,
        );
        let mut eligibility = EligibilityHistory::new();
        for element in &filtered {
            let snapshot = self
                .store
                .load_allocation_blob(&element.allocation_outputs_id)
                .await?;
            eligibility.add_allocation(&snapshot);
        }

        let mut metrics = active.metrics.take().unwrap_or_default();
        self.metrics_engine.calculate_node_metrics(
            &mut metrics,
            &canonical,
            &eligibility,
            &record.node_map,
            &record.settings,
        );
        Ok(metrics)
    }

    /// Persist each export slice, index it, and register it on the export
    /// schedule. A slice with no export budget, or one for an ended
    /// campaign, still gets its history entry; only the schedule entry is
    /// skipped.
    async fn persist_and_schedule_exports(
        &self,
        record: &mut CampaignRecord,
        allocation: &BudgetAllocation,
        initial: bool,
        now: DateTime<Utc>,
    ) -> Result<(), CycleError> {
        let slices = self.build_export_slices(allocation, initial);

        for slice in &slices {
            let blob_id = mint_allocation_id();
            self.store.save_allocation_blob(&blob_id, slice).await?;
            record.history_index.insert(
                0,
                HistoryElement {
                    allocation_start_time: slice.period_start.unwrap_or(now),
                    allocation_outputs_id: blob_id.clone(),
                },
            );

            let slice_start = slice.period_start.unwrap_or(now);
            if !slice.has_export_budget() || slice_start >= record.settings.campaign_end {
                log::debug!(
                    "export slice at {} for {} indexed but not scheduled",
                    slice_start,
                    record.campaign_id
                );
                continue;
            }
            let entry = ScheduleEntry {
                campaign_id: record.campaign_id.clone(),
                company_id: record.company_id.clone(),
                allocation_blob_id: Some(blob_id),
                delivery_network: Some(record.settings.delivery_network),
            };
            self.registry
                .add_entry(EXPORT_REGISTRY, slice_start, entry.clone())
                .await?;
            if initial {
                let reexport_at = slice_start + Duration::hours(self.config.reexport_delay_hours);
                if reexport_at < record.settings.campaign_end {
                    self.registry
                        .add_entry(EXPORT_REGISTRY, reexport_at, entry)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Initial allocations export as N equal time slices; a reallocation
    /// exports exactly once at period start. Delivery metrics never ride in
    /// an export slice.
    fn build_export_slices(
        &self,
        allocation: &BudgetAllocation,
        initial: bool,
    ) -> Vec<BudgetAllocation> {
        let mut stripped = allocation.clone();
        stripped.metrics = None;

        if !initial {
            return vec![stripped];
        }

        let slices = self.config.initial_export_slices.max(1) as i64;
        let total_hours = stripped.period_duration_hours.max(slices);
        let slice_hours = total_hours / slices;
        let period_start = match stripped.period_start {
            Some(start) => start,
            None => return vec![stripped],
        };

        (0..slices)
            .map(|i| {
                let mut slice = stripped.clone();
                slice.period_start = Some(period_start + Duration::hours(i * slice_hours));
                slice.period_duration_hours = if i == slices - 1 {
                    total_hours - slice_hours * (slices - 1)
                } else {
                    slice_hours
                };
                for node in slice.node_results.values_mut() {
                    node.export_budget /= slices as f64;
                }
                slice
            })
            .collect()
    }

    /// Transfer only the associations this cycle owns onto a freshly
    /// fetched campaign version, bounded-retry on conflict.
    async fn save_campaign_associations(&self, record: &CampaignRecord) -> Result<(), CycleError> {
        let limit = self.config.save_retry_limit.max(1);
        for attempt in 1..=limit {
            let mut fresh = self.store.fetch_campaign(&record.campaign_id).await?;
            fresh.node_map = record.node_map.clone();
            fresh.history_index = record.history_index.clone();
            fresh.active_allocation_id = record.active_allocation_id.clone();
            fresh.phase = record.phase;

            match self.store.try_save_campaign(&fresh).await {
                Ok(()) => return Ok(()),
                Err(StoreError::StaleVersion(msg)) if attempt < limit => {
                    log::warn!(
                        "⚠️  stale campaign version for {} (attempt {}/{}): {}",
                        record.campaign_id,
                        attempt,
                        limit,
                        msg
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CycleError::Logic(format!(
            "campaign {} save retries exhausted",
            record.campaign_id
        )))
    }

    /// Bump export counts for the nodes actually delivered downstream and
    /// re-persist the active allocation. Only the active-allocation
    /// association is touched.
    pub async fn increment_export_counts(
        &self,
        campaign_id: &str,
        allocation_ids: &[String],
    ) -> Result<BudgetAllocation, CycleError> {
        let record = self.store.fetch_campaign(campaign_id).await?;
        let blob_id = record
            .active_allocation_id
            .as_deref()
            .ok_or_else(|| StoreError::NotFound(format!("active allocation of {}", campaign_id)))?;
        let active = self.store.load_allocation_blob(blob_id).await?;

        let updated = self.engine.increment_export_counts(&active, allocation_ids);

        let new_blob_id = mint_allocation_id();
        self.store
            .save_allocation_blob(&new_blob_id, &updated)
            .await?;
        self.store
            .force_update_active_allocation(campaign_id, &new_blob_id)
            .await?;

        log::info!(
            "📤 campaign {}: export counts bumped for {} allocation ids",
            campaign_id,
            allocation_ids.len()
        );
        Ok(updated)
    }

    /// Merge one raw report batch into the campaign's canonical delivery
    /// data. Rejected batches change nothing and surface as an error.
    pub async fn ingest_delivery_report(
        &self,
        campaign_id: &str,
        raw_text: &str,
        pulled_at: DateTime<Utc>,
    ) -> Result<(), CycleError> {
        let record = self.store.fetch_campaign(campaign_id).await?;
        let network = record.settings.delivery_network;
        let mut data = match self.store.load_delivery_data(campaign_id, network).await {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => CanonicalDeliveryData::new(network),
            Err(e) => return Err(e.into()),
        };

        if !data.add_raw_data(raw_text, pulled_at) {
            return Err(CycleError::Logic(format!(
                "{} report batch rejected for campaign {}",
                network, campaign_id
            )));
        }
        self.store.save_delivery_data(campaign_id, &data).await?;
        Ok(())
    }

    /// Post-campaign cleanup: drop every pending schedule entry and park
    /// the campaign in the cleanup phase.
    pub async fn run_cleanup(&self, campaign_id: &str) -> Result<(), CycleError> {
        for registry in [REALLOCATION_REGISTRY, EXPORT_REGISTRY, CLEANUP_REGISTRY] {
            self.registry.remove_entries(registry, campaign_id).await?;
        }

        let limit = self.config.save_retry_limit.max(1);
        for attempt in 1..=limit {
            let mut fresh = self.store.fetch_campaign(campaign_id).await?;
            fresh.phase = SchedulePhase::Cleanup;
            match self.store.try_save_campaign(&fresh).await {
                Ok(()) => {
                    log::info!("🧹 campaign {} cleaned up", campaign_id);
                    return Ok(());
                }
                Err(StoreError::StaleVersion(_)) if attempt < limit => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CycleError::Logic(format!(
            "campaign {} cleanup save retries exhausted",
            campaign_id
        )))
    }
}
