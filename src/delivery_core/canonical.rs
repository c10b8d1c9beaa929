//! Canonical, network-agnostic delivery data
//!
//! Raw per-network reports are parsed and merged into one deduplicated
//! record set keyed by (allocation id, hour). Reports arrive repeatedly and
//! overlap; later records for the same key are corrected or delayed data and
//! overwrite the earlier ones.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::report::DeliveryNetwork;

/// Truncate a timestamp down to its whole hour.
pub fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        0,
        0,
    )
    .single()
    .unwrap_or(dt)
}

/// One hour of delivery for one allocation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub campaign_id: String,
    pub hour: DateTime<Utc>,
    pub allocation_id: String,
    pub impressions: u64,
    pub ecpm: f64,
    pub media_spend: f64,
    pub clicks: u64,
}

/// Deduplicated, time-bounded delivery records for one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalDeliveryData {
    pub network: DeliveryNetwork,
    /// (allocation id, hour) → record. Later merges overwrite.
    pub records: HashMap<String, DeliveryRecord>,
    pub earliest_delivery_data_date: Option<DateTime<Utc>>,
    pub latest_delivery_data_date: Option<DateTime<Utc>>,
    pub earliest_delivery_report_date: Option<DateTime<Utc>>,
    pub latest_delivery_report_date: Option<DateTime<Utc>>,
}

impl CanonicalDeliveryData {
    pub fn new(network: DeliveryNetwork) -> Self {
        Self {
            network,
            records: HashMap::new(),
            earliest_delivery_data_date: None,
            latest_delivery_data_date: None,
            earliest_delivery_report_date: None,
            latest_delivery_report_date: None,
        }
    }

    fn record_key(allocation_id: &str, hour: DateTime<Utc>) -> String {
        format!("{}@{}", allocation_id, hour.timestamp())
    }

    /// Parse and merge one raw report batch.
    ///
    /// Returns false, and merges nothing, when any row fails to parse.
    /// Malformed rows the parser tolerates (repeated headers, truncated
    /// rows) are dropped upstream and do not fail the batch.
    pub fn add_raw_data(&mut self, raw_text: &str, report_pulled_at: DateTime<Utc>) -> bool {
        let records = match self.network.parse_report(raw_text) {
            Ok(records) => records,
            Err(e) => {
                log::warn!(
                    "❌ rejecting {} report batch pulled at {}: {}",
                    self.network,
                    report_pulled_at,
                    e
                );
                return false;
            }
        };

        for record in records {
            let key = Self::record_key(&record.allocation_id, record.hour);
            self.records.insert(key, record);
        }

        self.merge_report_date(report_pulled_at);
        self.recompute_data_bounds();
        true
    }

    fn merge_report_date(&mut self, pulled_at: DateTime<Utc>) {
        self.earliest_delivery_report_date = Some(match self.earliest_delivery_report_date {
            Some(existing) => existing.min(pulled_at),
            None => pulled_at,
        });
        self.latest_delivery_report_date = Some(match self.latest_delivery_report_date {
            Some(existing) => existing.max(pulled_at),
            None => pulled_at,
        });
    }

    fn recompute_data_bounds(&mut self) {
        self.earliest_delivery_data_date = self.records.values().map(|r| r.hour).min();
        self.latest_delivery_data_date = self.records.values().map(|r| r.hour).max();
    }

    /// Records grouped by allocation id, each group sorted by hour.
    pub fn records_by_allocation(&self) -> HashMap<&str, Vec<&DeliveryRecord>> {
        let mut grouped: HashMap<&str, Vec<&DeliveryRecord>> = HashMap::new();
        for record in self.records.values() {
            grouped
                .entry(record.allocation_id.as_str())
                .or_default()
                .push(record);
        }
        for records in grouped.values_mut() {
            records.sort_by_key(|r| r.hour);
        }
        grouped
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ALLOC_A: &str = "0123456789abcdef0123456789abcdef";
    const ALLOC_B: &str = "fedcba9876543210fedcba9876543210";

    fn atlas_report(rows: &[(&str, &str, u64, f64)]) -> String {
        let mut raw = String::from("campaign_id,hour,campaign_code,imps,ecpm,spend,clicks\n");
        for (alloc, hour, imps, spend) in rows {
            raw.push_str(&format!(
                "camp-1,{},AX-{}-001,{},1.0,{},0\n",
                hour, alloc, imps, spend
            ));
        }
        raw
    }

    fn pulled(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 30, 0).unwrap()
    }

    #[test]
    fn test_merge_overwrites_same_key() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);

        let first = atlas_report(&[(ALLOC_A, "2026-03-01 10:00:00 +00:00", 100, 1.0)]);
        assert!(data.add_raw_data(&first, pulled(1)));
        // Corrected figures for the same allocation/hour arrive later.
        let second = atlas_report(&[(ALLOC_A, "2026-03-01 10:00:00 +00:00", 150, 2.0)]);
        assert!(data.add_raw_data(&second, pulled(2)));

        assert_eq!(data.records.len(), 1);
        let record = data.records.values().next().unwrap();
        assert_eq!(record.impressions, 150);
        assert_eq!(record.media_spend, 2.0);
    }

    #[test]
    fn test_merge_same_report_twice_is_idempotent() {
        let raw = atlas_report(&[
            (ALLOC_A, "2026-03-01 10:00:00 +00:00", 100, 1.0),
            (ALLOC_B, "2026-03-01 11:00:00 +00:00", 200, 2.0),
        ]);

        let mut once = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);
        assert!(once.add_raw_data(&raw, pulled(1)));

        let mut twice = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);
        assert!(twice.add_raw_data(&raw, pulled(1)));
        assert!(twice.add_raw_data(&raw, pulled(1)));

        assert_eq!(once.records, twice.records);
        assert_eq!(
            once.earliest_delivery_data_date,
            twice.earliest_delivery_data_date
        );
        assert_eq!(
            once.latest_delivery_data_date,
            twice.latest_delivery_data_date
        );
        assert_eq!(
            once.earliest_delivery_report_date,
            twice.earliest_delivery_report_date
        );
        assert_eq!(
            once.latest_delivery_report_date,
            twice.latest_delivery_report_date
        );
    }

    #[test]
    fn test_date_bounds_track_min_max() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);

        data.add_raw_data(
            &atlas_report(&[(ALLOC_A, "2026-03-01 10:00:00 +00:00", 100, 1.0)]),
            pulled(3),
        );
        data.add_raw_data(
            &atlas_report(&[
                (ALLOC_A, "2026-03-01 08:00:00 +00:00", 50, 0.5),
                (ALLOC_B, "2026-03-01 14:00:00 +00:00", 80, 0.8),
            ]),
            pulled(1),
        );

        assert_eq!(
            data.earliest_delivery_data_date,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(
            data.latest_delivery_data_date,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap())
        );
        assert_eq!(data.earliest_delivery_report_date, Some(pulled(1)));
        assert_eq!(data.latest_delivery_report_date, Some(pulled(3)));
    }

    #[test]
    fn test_failed_batch_leaves_data_unchanged() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);
        data.add_raw_data(
            &atlas_report(&[(ALLOC_A, "2026-03-01 10:00:00 +00:00", 100, 1.0)]),
            pulled(1),
        );
        let before = data.clone();

        // Short campaign_code: required allocation id canonicalizes empty.
        let bad = "campaign_id,hour,campaign_code,imps\n\
                   camp-1,2026-03-01 11:00:00 +00:00,AX-beef-001,50\n";
        assert!(!data.add_raw_data(bad, pulled(2)));

        assert_eq!(before.records, data.records);
        assert_eq!(
            before.latest_delivery_report_date,
            data.latest_delivery_report_date
        );
    }

    #[test]
    fn test_records_by_allocation_sorted() {
        let mut data = CanonicalDeliveryData::new(DeliveryNetwork::Atlas);
        data.add_raw_data(
            &atlas_report(&[
                (ALLOC_A, "2026-03-01 12:00:00 +00:00", 1, 0.1),
                (ALLOC_A, "2026-03-01 10:00:00 +00:00", 2, 0.2),
                (ALLOC_B, "2026-03-01 11:00:00 +00:00", 3, 0.3),
            ]),
            pulled(1),
        );

        let grouped = data.records_by_allocation();
        let hours: Vec<u32> = grouped[ALLOC_A].iter().map(|r| r.hour.hour()).collect();
        assert_eq!(hours, vec![10, 12]);
        assert_eq!(grouped[ALLOC_B].len(), 1);
    }
}
