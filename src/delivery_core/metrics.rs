//! Incremental per-node historical delivery metrics
//!
//! Combines canonical delivery records with eligibility history into
//! per-node totals and a 168-slot hour-of-week delivery profile. The engine
//! is incremental: each node carries high-water marks for the last processed
//! delivery and eligibility hours, so re-running over a superset of data
//! never folds an hour twice. An eligible hour with no delivery record is
//! folded with zeros: explicit non-delivery is a signal, not a gap.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::canonical::{truncate_to_hour, CanonicalDeliveryData, DeliveryRecord};
use super::eligibility::EligibilityHistory;
use crate::allocation::types::{CampaignSettings, MeasureSet};

/// Hour-of-week buckets in a delivery profile.
pub const HOURS_PER_WEEK: usize = 168;

/// Bounded history of recent raw samples kept per bucket.
pub const RECENT_SAMPLE_LIMIT: usize = 24;

/// Bucket index for an hour: Monday 00:00 is slot 0.
pub fn hour_of_week(hour: DateTime<Utc>) -> usize {
    hour.weekday().num_days_from_monday() as usize * 24 + hour.hour() as usize
}

/// One raw observation folded into a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourSample {
    pub hour: DateTime<Utc>,
    pub impressions: f64,
    pub media_spend: f64,
}

/// Running averages for one hour-of-week bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeHourMetrics {
    pub avg_impressions: f64,
    pub avg_media_spend: f64,
    /// Number of eligible hours folded into the averages.
    pub eligibility_count: u32,
    pub last_added_hour: Option<DateTime<Utc>>,
    /// Most recent raw samples, oldest first, bounded to
    /// [`RECENT_SAMPLE_LIMIT`].
    pub recent_samples: Vec<HourSample>,
}

impl NodeHourMetrics {
    /// Fold one observation into the bucket.
    ///
    /// A sample for the hour already folded last is a delayed-report
    /// correction: it replaces the previous sample and leaves the
    /// eligibility count untouched. Anything else enters the running
    /// average as a new observation.
    ///
    /// Returns the (impressions, media spend) delta this call contributed,
    /// so callers can keep node totals consistent through corrections.
    pub fn update(&mut self, hour: DateTime<Utc>, impressions: f64, media_spend: f64) -> (f64, f64) {
        if self.last_added_hour == Some(hour) {
            let previous = match self.recent_samples.last().copied() {
                Some(sample) => sample,
                None => HourSample {
                    hour,
                    impressions: 0.0,
                    media_spend: 0.0,
                },
            };
            let count = self.eligibility_count.max(1) as f64;
            self.avg_impressions += (impressions - previous.impressions) / count;
            self.avg_media_spend += (media_spend - previous.media_spend) / count;
            if let Some(last) = self.recent_samples.last_mut() {
                last.impressions = impressions;
                last.media_spend = media_spend;
            }
            return (
                impressions - previous.impressions,
                media_spend - previous.media_spend,
            );
        }

        let count = self.eligibility_count as f64;
        self.avg_impressions = (self.avg_impressions * count + impressions) / (count + 1.0);
        self.avg_media_spend = (self.avg_media_spend * count + media_spend) / (count + 1.0);
        self.eligibility_count += 1;
        self.last_added_hour = Some(hour);
        self.recent_samples.push(HourSample {
            hour,
            impressions,
            media_spend,
        });
        if self.recent_samples.len() > RECENT_SAMPLE_LIMIT {
            self.recent_samples.remove(0);
        }
        (impressions, media_spend)
    }
}

/// Lifetime delivery metrics for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeliveryMetrics {
    /// High-water mark of folded delivery hours. Never decreases.
    pub last_processed_delivery_hour: Option<DateTime<Utc>>,
    /// High-water mark of folded eligibility hours. Never decreases.
    pub last_processed_eligibility_hour: Option<DateTime<Utc>>,
    pub total_impressions: f64,
    pub total_media_spend: f64,
    /// Media spend plus data/platform fees.
    pub total_spend: f64,
    pub total_eligible_hours: u32,
    pub delivery_profile: Vec<NodeHourMetrics>,
}

impl Default for NodeDeliveryMetrics {
    fn default() -> Self {
        Self {
            last_processed_delivery_hour: None,
            last_processed_eligibility_hour: None,
            total_impressions: 0.0,
            total_media_spend: 0.0,
            total_spend: 0.0,
            total_eligible_hours: 0,
            delivery_profile: (0..HOURS_PER_WEEK).map(|_| NodeHourMetrics::default()).collect(),
        }
    }
}

/// Per-campaign metrics: every node plus the campaign-wide aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignDeliveryMetrics {
    pub nodes: HashMap<MeasureSet, NodeDeliveryMetrics>,
    /// Total budget projected onto media spend:
    /// `total_budget × media_spend / total_spend`.
    pub lifetime_media_budget_cap: f64,
    pub remaining_budget: Option<f64>,
}

/// Folds canonical delivery data and eligibility history into node metrics.
pub struct DeliveryMetricsEngine {
    /// Trailing hours of the newest report presumed unstable and excluded.
    pub report_dead_zone_hours: i64,
    /// Bounded history depth replayed per cycle.
    pub look_back_hours: i64,
}

impl DeliveryMetricsEngine {
    pub fn new(report_dead_zone_hours: i64, look_back_hours: i64) -> Self {
        Self {
            report_dead_zone_hours,
            look_back_hours,
        }
    }

    /// Update `metrics` in place from the current canonical data and
    /// eligibility history.
    pub fn calculate_node_metrics(
        &self,
        metrics: &mut CampaignDeliveryMetrics,
        canonical: &CanonicalDeliveryData,
        eligibility: &EligibilityHistory,
        node_map: &HashMap<String, MeasureSet>,
        settings: &CampaignSettings,
    ) {
        let last_valid_report_hour = canonical.latest_delivery_report_date.and_then(|pulled| {
            truncate_to_hour(pulled)
                .checked_sub_signed(Duration::hours(1 + self.report_dead_zone_hours))
        });

        // Pivot delivery records by node. An allocation id the node map no
        // longer knows belongs to a retired node; its delivery is ignored.
        let mut records_by_node: HashMap<&MeasureSet, Vec<&DeliveryRecord>> = HashMap::new();
        for (allocation_id, records) in canonical.records_by_allocation() {
            match node_map.get(allocation_id) {
                Some(node) => records_by_node.entry(node).or_default().extend(records),
                None => log::debug!("delivery for unmapped allocation id {}", allocation_id),
            }
        }
        for records in records_by_node.values_mut() {
            records.sort_by_key(|r| r.hour);
        }

        let mut touched: BTreeSet<MeasureSet> = eligibility.nodes().cloned().collect();
        touched.extend(records_by_node.keys().map(|n| (*n).clone()));

        for node in touched {
            let node_metrics = metrics.nodes.entry(node.clone()).or_default();
            let records = records_by_node.get(&node).map(Vec::as_slice).unwrap_or(&[]);

            let last_valid_eligibility_hour = max_option(
                canonical.latest_delivery_data_date,
                last_valid_report_hour
                    .and_then(|h| h.checked_sub_signed(Duration::hours(self.look_back_hours))),
            );

            // Delivered hours, ascending, bounded by the dead zone and the
            // node's high-water mark.
            let mut max_folded_delivery: Option<DateTime<Utc>> = None;
            for record in records {
                if let Some(limit) = last_valid_report_hour {
                    if record.hour > limit {
                        continue;
                    }
                }
                if let Some(mark) = node_metrics.last_processed_delivery_hour {
                    if record.hour < mark {
                        continue;
                    }
                }
                let bucket = &mut node_metrics.delivery_profile[hour_of_week(record.hour)];
                let (d_impressions, d_spend) = bucket.update(
                    record.hour,
                    record.impressions as f64,
                    record.media_spend,
                );
                node_metrics.total_impressions += d_impressions;
                node_metrics.total_media_spend += d_spend;
                node_metrics.total_spend += d_spend * (1.0 + settings.platform_fee_rate)
                    + d_impressions / 1000.0 * settings.data_fee_cpm;
                max_folded_delivery = max_option(max_folded_delivery, Some(record.hour));
            }

            // Zero-delivery eligible hours, ascending.
            let delivered_hours: BTreeSet<DateTime<Utc>> =
                records.iter().map(|r| r.hour).collect();
            let mut max_period_end: Option<DateTime<Utc>> = None;
            if let Some(limit) = last_valid_eligibility_hour {
                let mut eligible_hours: BTreeSet<DateTime<Utc>> = BTreeSet::new();
                for period in eligibility.periods_for(&node) {
                    if let Some(mark) = node_metrics.last_processed_eligibility_hour {
                        if period.end() <= mark {
                            continue;
                        }
                    }
                    if period.start > limit {
                        continue;
                    }
                    let from = match node_metrics.last_processed_eligibility_hour {
                        Some(mark) => period.start.max(mark + Duration::hours(1)),
                        None => period.start,
                    };
                    let mut hour = from;
                    while hour <= period.end() && hour <= limit {
                        eligible_hours.insert(hour);
                        hour += Duration::hours(1);
                    }
                    max_period_end = max_option(max_period_end, Some(period.end()));
                }
                for hour in eligible_hours {
                    if delivered_hours.contains(&hour) {
                        continue;
                    }
                    let bucket = &mut node_metrics.delivery_profile[hour_of_week(hour)];
                    bucket.update(hour, 0.0, 0.0);
                }
                if let Some(end) = max_period_end {
                    let advanced = end.min(limit);
                    node_metrics.last_processed_eligibility_hour = max_option(
                        node_metrics.last_processed_eligibility_hour,
                        Some(advanced),
                    );
                }
            }

            node_metrics.total_eligible_hours = node_metrics
                .delivery_profile
                .iter()
                .map(|b| b.eligibility_count)
                .sum();
            node_metrics.last_processed_delivery_hour = max_option(
                node_metrics.last_processed_delivery_hour,
                max_folded_delivery,
            );
        }

        self.aggregate_campaign(metrics, settings.total_budget);
    }

    fn aggregate_campaign(&self, metrics: &mut CampaignDeliveryMetrics, total_budget: f64) {
        let total_media_spend: f64 = metrics.nodes.values().map(|n| n.total_media_spend).sum();
        let total_spend: f64 = metrics.nodes.values().map(|n| n.total_spend).sum();

        metrics.lifetime_media_budget_cap = if total_spend > 0.0 {
            total_budget * total_media_spend / total_spend
        } else {
            total_budget
        };
        metrics.remaining_budget = Some(round2(total_budget - total_spend).max(0.0));
    }
}

fn max_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
