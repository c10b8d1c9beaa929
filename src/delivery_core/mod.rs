//! Delivery Core - Canonical delivery data and node metrics
//!
//! This module turns heterogeneous per-network delivery reports into
//! incrementally-updated per-node historical metrics.
//!
//! ```text
//! raw report text → DeliveryNetwork::parse_report → CanonicalDeliveryData
//!     ↓
//! EligibilityHistory (replayed from allocation snapshots)
//!     ↓
//! DeliveryMetricsEngine (168-slot hour-of-week profile, node totals)
//!     ↓
//! CampaignDeliveryMetrics → allocation inputs
//! ```

pub mod canonical;
pub mod eligibility;
pub mod metrics;
pub mod report;

pub use canonical::{CanonicalDeliveryData, DeliveryRecord};
pub use eligibility::{filter_index, EligibilityHistory, EligibilityPeriod};
pub use metrics::{
    CampaignDeliveryMetrics, DeliveryMetricsEngine, NodeDeliveryMetrics, NodeHourMetrics,
};
pub use report::{DeliveryNetwork, ReportParseError};
