//! Collaborator contracts for persistence and scheduling
//!
//! The orchestration layer talks to storage through these traits only. The
//! store must distinguish "missing" from "broken": a NotFound on the active
//! allocation or node map simply means the campaign is on its first cycle,
//! while InvalidData is a fatal configuration problem and StaleVersion
//! drives the bounded retry on campaign saves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::types::{BudgetAllocation, CampaignRecord, MeasureSet};
use crate::delivery_core::canonical::CanonicalDeliveryData;
use crate::delivery_core::report::DeliveryNetwork;

/// Schedule registry names. At most one pending reallocation or cleanup
/// entry exists per campaign; exports may hold several.
pub const REALLOCATION_REGISTRY: &str = "reallocation";
pub const EXPORT_REGISTRY: &str = "export";
pub const CLEANUP_REGISTRY: &str = "cleanup";

#[derive(Debug)]
pub enum StoreError {
    /// Entity or association does not exist. Often expected.
    NotFound(String),
    /// Optimistic version conflict on save; re-fetch and retry.
    StaleVersion(String),
    /// Malformed persisted payload. Not retryable.
    InvalidData(String),
    /// Transient backend failure.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::StaleVersion(what) => write!(f, "stale version: {}", what),
            StoreError::InvalidData(what) => write!(f, "invalid data: {}", what),
            StoreError::Backend(what) => write!(f, "storage error: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidData(err.to_string())
    }
}

/// A campaign-scoped, time-stamped schedule entry handed to downstream
/// consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub campaign_id: String,
    pub company_id: String,
    pub allocation_blob_id: Option<String>,
    pub delivery_network: Option<DeliveryNetwork>,
}

/// Entity/property data access for campaigns, allocation blobs, delivery
/// data and valuations.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn fetch_campaign(&self, campaign_id: &str) -> Result<CampaignRecord, StoreError>;

    /// Optimistic save: fails with [`StoreError::StaleVersion`] when the
    /// stored version no longer matches `record.version`.
    async fn try_save_campaign(&self, record: &CampaignRecord) -> Result<(), StoreError>;

    /// Narrow update of the active-allocation association, bypassing the
    /// full-record version check.
    async fn force_update_active_allocation(
        &self,
        campaign_id: &str,
        blob_id: &str,
    ) -> Result<(), StoreError>;

    /// Persist an immutable allocation snapshot; returns its blob id.
    async fn save_allocation_blob(
        &self,
        blob_id: &str,
        allocation: &BudgetAllocation,
    ) -> Result<(), StoreError>;

    async fn load_allocation_blob(&self, blob_id: &str) -> Result<BudgetAllocation, StoreError>;

    async fn load_delivery_data(
        &self,
        campaign_id: &str,
        network: DeliveryNetwork,
    ) -> Result<CanonicalDeliveryData, StoreError>;

    async fn save_delivery_data(
        &self,
        campaign_id: &str,
        data: &CanonicalDeliveryData,
    ) -> Result<(), StoreError>;

    /// Approved valuations from the cache. Does not refresh it.
    async fn load_approved_valuations(
        &self,
        campaign_id: &str,
    ) -> Result<HashMap<MeasureSet, f64>, StoreError>;

    /// Refresh the valuation cache from the source of record. Best-effort:
    /// callers log failures and continue with the stale cache.
    async fn refresh_valuations(&self, campaign_id: &str) -> Result<(), StoreError>;
}

/// Generic time-keyed schedule shared with other subsystems.
#[async_trait]
pub trait ScheduleRegistry: Send + Sync {
    async fn add_entry(
        &self,
        registry: &str,
        at: DateTime<Utc>,
        entry: ScheduleEntry,
    ) -> Result<(), StoreError>;

    /// Remove every pending entry for the campaign in the given registry.
    /// Removing nothing is not an error.
    async fn remove_entries(&self, registry: &str, campaign_id: &str) -> Result<(), StoreError>;

    /// Entries due at or before `now`, oldest first.
    async fn due_entries(
        &self,
        registry: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, ScheduleEntry)>, StoreError>;

    /// String-comparable bucket key for schedule futurity tests. The
    /// bucketing granularity belongs to the registry, not the caller;
    /// two timestamps compare by key, never by raw value.
    fn time_slot_key(&self, at: DateTime<Utc>) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::StaleVersion("campaign camp-1 v3".into());
        assert_eq!(err.to_string(), "stale version: campaign camp-1 v3");

        let err = StoreError::NotFound("active allocation".into());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_serde_error_maps_to_invalid_data() {
        let parse_err = serde_json::from_str::<ScheduleEntry>("{broken").unwrap_err();
        let err: StoreError = parse_err.into();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }
}
