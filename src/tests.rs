//! Cross-module flow tests: raw report text through canonical data and
//! eligibility into node metrics.

use chrono::{DateTime, TimeZone, Utc};

use crate::allocation::types::{BudgetAllocation, CampaignSettings, MeasureSet, NodeAllocation};
use crate::delivery_core::canonical::CanonicalDeliveryData;
use crate::delivery_core::eligibility::EligibilityHistory;
use crate::delivery_core::metrics::{CampaignDeliveryMetrics, DeliveryMetricsEngine};
use crate::delivery_core::report::DeliveryNetwork;
use std::collections::HashMap;

const ALLOC_US: &str = "0123456789abcdef0123456789abcdef";
const ALLOC_UK: &str = "fedcba9876543210fedcba9876543210";

fn hour(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap()
}

fn settings() -> CampaignSettings {
    CampaignSettings {
        campaign_start: hour(1, 0),
        campaign_end: hour(20, 0),
        total_budget: 2000.0,
        platform_fee_rate: 0.0,
        data_fee_cpm: 0.0,
        delivery_network: DeliveryNetwork::Atlas,
    }
}

fn snapshot(start: DateTime<Utc>, hours: i64, budgets: &[(&str, MeasureSet, f64)]) -> BudgetAllocation {
    let mut allocation = BudgetAllocation {
        period_start: Some(start),
        period_duration_hours: hours,
        ..Default::default()
    };
    for (alloc_id, node, budget) in budgets {
        let mut result = NodeAllocation::new(alloc_id.to_string());
        result.export_budget = *budget;
        allocation.node_results.insert(node.clone(), result);
    }
    allocation
}

#[test]
fn test_report_to_metrics_flow() {
    let us = MeasureSet::new(["geo:us"]);
    let uk = MeasureSet::new(["geo:uk"]);
    let node_map = HashMap::from([
        (ALLOC_US.to_string(), us.clone()),
        (ALLOC_UK.to_string(), uk.clone()),
    ]);

    // Both nodes eligible 08:00–11:00 on March 2nd via a past snapshot.
    let mut eligibility = EligibilityHistory::new();
    eligibility.add_allocation(&snapshot(
        hour(2, 8),
        4,
        &[(ALLOC_US, us.clone(), 50.0), (ALLOC_UK, uk.clone(), 30.0)],
    ));

    // Atlas reports two batches appended together, US delivering three
    // hours, UK only one.
    let raw = format!(
        "campaign_id,hour,campaign_code,imps,ecpm,spend,clicks\n\
         camp-1,2026-03-02 08:00:00 +00:00,AX-{us}-001,1000,2.0,2.0,10\n\
         camp-1,2026-03-02 09:00:00 +00:00,AX-{us}-001,1200,2.0,2.4,12\n\
         campaign_id,hour,campaign_code,imps,ecpm,spend,clicks\n\
         camp-1,2026-03-02 10:00:00 +00:00,AX-{us}-001,800,2.0,1.6,8\n\
         camp-1,2026-03-02 08:00:00 +00:00,AX-{uk}-001,400,1.5,0.6,2\n",
        us = ALLOC_US,
        uk = ALLOC_UK
    );
    let mut canonical = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);
    assert!(canonical.add_raw_data(&raw, hour(2, 13)));
    assert_eq!(canonical.records.len(), 4);

    let engine = DeliveryMetricsEngine::new(0, 24 * 14);
    let mut metrics = CampaignDeliveryMetrics::default();
    engine.calculate_node_metrics(&mut metrics, &canonical, &eligibility, &node_map, &settings());

    let us_metrics = &metrics.nodes[&us];
    assert_eq!(us_metrics.total_impressions, 3000.0);
    assert_eq!(us_metrics.total_eligible_hours, 3);

    // UK delivered one hour; 09:00 and 10:00 are explicit zero-delivery
    // eligible hours.
    let uk_metrics = &metrics.nodes[&uk];
    assert_eq!(uk_metrics.total_impressions, 400.0);
    assert_eq!(uk_metrics.total_eligible_hours, 3);

    // Campaign spend: 2.0 + 2.4 + 1.6 + 0.6 = 6.6 with no fees.
    assert_eq!(metrics.remaining_budget, Some(1993.4));
}

#[test]
fn test_replayed_snapshots_fold_each_hour_once() {
    let us = MeasureSet::new(["geo:us"]);
    let node_map = HashMap::from([(ALLOC_US.to_string(), us.clone())]);

    // Two overlapping snapshots replayed out of order; the split keeps
    // hours 06:00–13:00 each eligible exactly once.
    let mut eligibility = EligibilityHistory::new();
    eligibility.add_allocation(&snapshot(hour(2, 10), 4, &[(ALLOC_US, us.clone(), 10.0)]));
    eligibility.add_allocation(&snapshot(hour(2, 6), 6, &[(ALLOC_US, us.clone(), 10.0)]));

    let raw = format!(
        "campaign_id,hour,campaign_code,imps\n\
         camp-1,2026-03-02 13:00:00 +00:00,AX-{}-001,100\n",
        ALLOC_US
    );
    let mut canonical = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);
    assert!(canonical.add_raw_data(&raw, hour(2, 18)));

    let engine = DeliveryMetricsEngine::new(0, 24 * 14);
    let mut metrics = CampaignDeliveryMetrics::default();
    engine.calculate_node_metrics(&mut metrics, &canonical, &eligibility, &node_map, &settings());

    let m = &metrics.nodes[&us];
    // 06:00 through 13:00 inclusive: 8 hours, one delivered.
    assert_eq!(m.total_eligible_hours, 8);
    assert_eq!(m.total_impressions, 100.0);

    // A second pass over identical data changes nothing.
    let snapshot_totals = (m.total_eligible_hours, m.total_impressions);
    engine.calculate_node_metrics(&mut metrics, &canonical, &eligibility, &node_map, &settings());
    let m = &metrics.nodes[&us];
    assert_eq!((m.total_eligible_hours, m.total_impressions), snapshot_totals);
}
