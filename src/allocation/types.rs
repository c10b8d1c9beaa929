//! Core data structures for budget allocation state
//!
//! Everything here is persisted as JSON blobs through the campaign store, so
//! all types carry serde derives. MeasureSet serializes as a single sorted
//! string so it can key JSON maps directly.

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::delivery_core::metrics::CampaignDeliveryMetrics;
use crate::delivery_core::report::DeliveryNetwork;

/// Separator used in the serialized form of a MeasureSet.
const MEASURE_SEPARATOR: char = '|';

/// An order-independent set of targeting-attribute identifiers.
///
/// A MeasureSet is the identity key for a "node": one combination of
/// targeting attributes that budget can be allocated to. Two sets with the
/// same members are the same node regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MeasureSet {
    measures: BTreeSet<String>,
}

impl MeasureSet {
    pub fn new<I, S>(measures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            measures: measures.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.measures.len()
    }

    pub fn contains(&self, measure: &str) -> bool {
        self.measures.contains(measure)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.measures.iter()
    }
}

impl fmt::Display for MeasureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for measure in &self.measures {
            if !first {
                write!(f, "{}", MEASURE_SEPARATOR)?;
            }
            write!(f, "{}", measure)?;
            first = false;
        }
        Ok(())
    }
}

impl std::str::FromStr for MeasureSet {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(
            s.split(MEASURE_SEPARATOR)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
        ))
    }
}

// String-keyed serialization so HashMap<MeasureSet, _> works as a JSON map.
impl Serialize for MeasureSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MeasureSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Per-node output of one allocation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAllocation {
    /// Stable 32-hex id carried across cycles and echoed back by delivery
    /// reports.
    pub allocation_id: String,

    /// Approved valuation attached to this node for the run.
    pub valuation: f64,

    /// Budget exported to the delivery network for the period. Zero means
    /// the node is not eligible during the period.
    pub export_budget: f64,

    /// Number of times this node's allocation has been exported.
    pub export_count: u32,

    /// Impressions credited to the node over its prior eligible hours.
    pub effective_impressions: f64,
}

impl NodeAllocation {
    pub fn new(allocation_id: String) -> Self {
        Self {
            allocation_id,
            valuation: 0.0,
            export_budget: 0.0,
            export_count: 0,
            effective_impressions: 0.0,
        }
    }
}

/// One allocation snapshot: the budget split for a single period.
///
/// Built fresh each reallocation cycle from the prior active allocation plus
/// updated metrics. Persisted immutably in history, and separately (a
/// distinct copy) as the campaign's active allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub period_start: Option<DateTime<Utc>>,
    pub period_duration_hours: i64,
    pub remaining_budget: Option<f64>,
    pub node_results: HashMap<MeasureSet, NodeAllocation>,
    /// Delivery metrics ride along inside the active snapshot only; export
    /// slices have them stripped.
    pub metrics: Option<CampaignDeliveryMetrics>,
}

impl BudgetAllocation {
    /// True when no node has ever been exported, the defining property of
    /// an initial allocation.
    pub fn is_initial(&self) -> bool {
        self.node_results.values().all(|n| n.export_count == 0)
    }

    /// True when at least one node carries positive export budget.
    pub fn has_export_budget(&self) -> bool {
        self.node_results.values().any(|n| n.export_budget > 0.0)
    }
}

/// One entry in the append-only, most-recent-first allocation history index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryElement {
    pub allocation_start_time: DateTime<Utc>,
    pub allocation_outputs_id: String,
}

/// Per-node inputs handed to the allocation engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInputs {
    pub valuation: f64,
    pub export_count: u32,
    pub effective_impressions: f64,
}

/// Everything the allocation engine needs for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationInputs {
    pub campaign_id: String,
    pub period_start: DateTime<Utc>,
    pub period_duration_hours: i64,
    /// Budget left to allocate. Required for non-initial runs; an initial
    /// run falls back to the campaign's total budget.
    pub remaining_budget: Option<f64>,
    /// Σ previous valuation × previous effective impressions / 1000 across
    /// nodes; summarizes prior-period delivery quality.
    pub value_volume_score: f64,
    pub nodes: HashMap<MeasureSet, NodeInputs>,
}

/// Campaign-level settings consumed by the scheduling and metrics logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSettings {
    pub campaign_start: DateTime<Utc>,
    pub campaign_end: DateTime<Utc>,
    pub total_budget: f64,
    /// Platform fee charged as a fraction of media spend.
    pub platform_fee_rate: f64,
    /// Data fee charged per 1000 impressions.
    pub data_fee_cpm: f64,
    pub delivery_network: DeliveryNetwork,
}

/// Scheduling phase of a campaign's reallocation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePhase {
    Initializing,
    AwaitingFirstReallocation,
    RegularReallocation,
    Cleanup,
}

/// The campaign associations this subsystem owns, plus the optimistic
/// version used to detect concurrent writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub campaign_id: String,
    pub company_id: String,
    pub version: i64,
    pub settings: CampaignSettings,
    /// allocation_id → node. Reverse lookups stabilize allocation ids
    /// across cycles.
    pub node_map: HashMap<String, MeasureSet>,
    /// Most-recent-first index of persisted allocation snapshots.
    pub history_index: Vec<HistoryElement>,
    pub active_allocation_id: Option<String>,
    pub phase: SchedulePhase,
}

impl CampaignRecord {
    /// Find the allocation id previously minted for a node, if any.
    pub fn allocation_id_for(&self, node: &MeasureSet) -> Option<&String> {
        self.node_map
            .iter()
            .find(|(_, n)| *n == node)
            .map(|(id, _)| id)
    }
}
