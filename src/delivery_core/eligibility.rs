//! Eligibility history reconstruction from allocation snapshots
//!
//! A node is eligible during the hours it held positive export budget in
//! some past allocation. Replaying persisted snapshots produces overlapping
//! periods; insertion splits them so the stored periods for a node are
//! always mutually exclusive, whatever order snapshots are replayed in.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::allocation::types::{BudgetAllocation, HistoryElement, MeasureSet};

/// A contiguous span of whole hours during which a node was eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityPeriod {
    pub start: DateTime<Utc>,
    pub duration_hours: i64,
}

impl EligibilityPeriod {
    pub fn new(start: DateTime<Utc>, duration_hours: i64) -> Self {
        Self {
            start,
            duration_hours,
        }
    }

    /// Last hour covered by the period (duration is inclusive of whole
    /// hours: a 4h period starting 10:00 ends at 13:00).
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::hours(self.duration_hours - 1)
    }

    /// First hour past the period.
    fn exclusive_end(&self) -> DateTime<Utc> {
        self.start + Duration::hours(self.duration_hours)
    }

    fn overlaps(&self, other: &EligibilityPeriod) -> bool {
        self.start < other.exclusive_end() && other.start < self.exclusive_end()
    }

    /// Every whole hour in the period, ascending.
    pub fn hours(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let start = self.start;
        (0..self.duration_hours).map(move |h| start + Duration::hours(h))
    }
}

/// Mutually-exclusive eligibility periods per node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibilityHistory {
    periods: HashMap<MeasureSet, Vec<EligibilityPeriod>>,
}

impl EligibilityHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one allocation snapshot into the history: every node with
    /// positive export budget becomes eligible for the snapshot's period.
    pub fn add_allocation(&mut self, allocation: &BudgetAllocation) {
        let start = match allocation.period_start {
            Some(start) => start,
            None => return,
        };
        if allocation.period_duration_hours <= 0 {
            return;
        }
        let period = EligibilityPeriod::new(start, allocation.period_duration_hours);

        for (node, result) in &allocation.node_results {
            if result.export_budget > 0.0 {
                self.add_period(node.clone(), period);
            }
        }
    }

    /// Insert a period, splitting stored periods so none overlap.
    ///
    /// The incoming period is kept whole; each stored period it overlaps is
    /// cut down to the portions strictly before and strictly after it
    /// (zero, one or two survivors per comparison). The incoming period
    /// therefore supersedes older eligibility over the overlapping range,
    /// and replaying snapshots in any order leaves the set exclusive.
    pub fn add_period(&mut self, node: MeasureSet, period: EligibilityPeriod) {
        if period.duration_hours <= 0 {
            return;
        }
        let periods = self.periods.entry(node).or_default();

        let mut split: Vec<EligibilityPeriod> = Vec::with_capacity(periods.len() + 1);
        for existing in periods.drain(..) {
            if !existing.overlaps(&period) {
                split.push(existing);
                continue;
            }
            let before_hours = (period.start - existing.start).num_hours();
            if before_hours > 0 {
                split.push(EligibilityPeriod::new(existing.start, before_hours));
            }
            let after_hours = (existing.exclusive_end() - period.exclusive_end()).num_hours();
            if after_hours > 0 {
                split.push(EligibilityPeriod::new(period.exclusive_end(), after_hours));
            }
        }
        split.push(period);
        split.sort_by_key(|p| p.start);
        *periods = split;
    }

    pub fn periods_for(&self, node: &MeasureSet) -> &[EligibilityPeriod] {
        self.periods.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MeasureSet> {
        self.periods.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }
}

/// Bound how much history gets replayed into eligibility each cycle.
///
/// Cutoff is the lookback subtracted from the earlier of the last delivery
/// hour and the newest index entry, clamped so it cannot underflow the
/// minimum representable timestamp. Entries starting before the cutoff are
/// dropped.
pub fn filter_index(
    index: &[HistoryElement],
    look_back_hours: i64,
    last_delivery_data_date: Option<DateTime<Utc>>,
) -> Vec<HistoryElement> {
    let latest_entry = match index.iter().map(|e| e.allocation_start_time).max() {
        Some(latest) => latest,
        None => return Vec::new(),
    };
    let basis = match last_delivery_data_date {
        Some(last) => last.min(latest_entry),
        None => latest_entry,
    };
    let lookback = Duration::try_hours(look_back_hours).unwrap_or(Duration::MAX);
    let cutoff = basis
        .checked_sub_signed(lookback)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    index
        .iter()
        .filter(|e| e.allocation_start_time >= cutoff)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::types::NodeAllocation;
    use chrono::TimeZone;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    fn node() -> MeasureSet {
        MeasureSet::new(["geo:us", "device:mobile"])
    }

    fn assert_exclusive(periods: &[EligibilityPeriod]) {
        for (i, a) in periods.iter().enumerate() {
            for b in periods.iter().skip(i + 1) {
                assert!(
                    a.end() < b.start || b.end() < a.start,
                    "periods overlap: {:?} and {:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_overlapping_insert_splits_without_gap() {
        // [10:00,+4h) then [12:00,+4h) must store exactly [10:00,12:00)
        // and [12:00,16:00).
        let mut history = EligibilityHistory::new();
        history.add_period(node(), EligibilityPeriod::new(hour(10), 4));
        history.add_period(node(), EligibilityPeriod::new(hour(12), 4));

        let periods = history.periods_for(&node());
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0], EligibilityPeriod::new(hour(10), 2));
        assert_eq!(periods[1], EligibilityPeriod::new(hour(12), 4));
        assert_exclusive(periods);
    }

    #[test]
    fn test_contained_insert_splits_existing_in_two() {
        let mut history = EligibilityHistory::new();
        history.add_period(node(), EligibilityPeriod::new(hour(8), 10));
        history.add_period(node(), EligibilityPeriod::new(hour(12), 2));

        let periods = history.periods_for(&node());
        assert_eq!(
            periods,
            &[
                EligibilityPeriod::new(hour(8), 4),
                EligibilityPeriod::new(hour(12), 2),
                EligibilityPeriod::new(hour(14), 4),
            ]
        );
        assert_exclusive(periods);
    }

    #[test]
    fn test_identical_insert_replaces() {
        let mut history = EligibilityHistory::new();
        history.add_period(node(), EligibilityPeriod::new(hour(10), 4));
        history.add_period(node(), EligibilityPeriod::new(hour(10), 4));

        assert_eq!(history.periods_for(&node()).len(), 1);
    }

    #[test]
    fn test_disjoint_periods_kept_whole() {
        let mut history = EligibilityHistory::new();
        history.add_period(node(), EligibilityPeriod::new(hour(2), 2));
        history.add_period(node(), EligibilityPeriod::new(hour(10), 2));

        let periods = history.periods_for(&node());
        assert_eq!(periods.len(), 2);
        assert_exclusive(periods);
    }

    #[test]
    fn test_replay_order_independence_of_coverage() {
        let inserts = [
            EligibilityPeriod::new(hour(0), 6),
            EligibilityPeriod::new(hour(4), 6),
            EligibilityPeriod::new(hour(2), 3),
        ];

        let mut forward = EligibilityHistory::new();
        for p in inserts {
            forward.add_period(node(), p);
        }
        let mut reverse = EligibilityHistory::new();
        for p in inserts.iter().rev() {
            reverse.add_period(node(), *p);
        }

        // Stored boundaries may differ, covered hours may not.
        let cover = |h: &EligibilityHistory| {
            let mut hours: Vec<_> = h
                .periods_for(&node())
                .iter()
                .flat_map(|p| p.hours())
                .collect();
            hours.sort();
            hours
        };
        assert_eq!(cover(&forward), cover(&reverse));
        assert_exclusive(forward.periods_for(&node()));
        assert_exclusive(reverse.periods_for(&node()));
    }

    #[test]
    fn test_add_allocation_skips_zero_budget_nodes() {
        let mut allocation = BudgetAllocation {
            period_start: Some(hour(10)),
            period_duration_hours: 4,
            ..Default::default()
        };
        let mut funded = NodeAllocation::new("a".repeat(32));
        funded.export_budget = 25.0;
        allocation.node_results.insert(node(), funded);
        let starved = NodeAllocation::new("b".repeat(32));
        allocation
            .node_results
            .insert(MeasureSet::new(["geo:uk"]), starved);

        let mut history = EligibilityHistory::new();
        history.add_allocation(&allocation);

        assert_eq!(history.periods_for(&node()).len(), 1);
        assert!(history
            .periods_for(&MeasureSet::new(["geo:uk"]))
            .is_empty());
    }

    #[test]
    fn test_period_end_is_inclusive_hours() {
        let period = EligibilityPeriod::new(hour(10), 4);
        assert_eq!(period.end(), hour(13));
        let hours: Vec<_> = period.hours().collect();
        assert_eq!(hours, vec![hour(10), hour(11), hour(12), hour(13)]);
    }

    #[test]
    fn test_filter_index_cutoff() {
        let index = vec![
            HistoryElement {
                allocation_start_time: hour(20),
                allocation_outputs_id: "new".into(),
            },
            HistoryElement {
                allocation_start_time: hour(10),
                allocation_outputs_id: "mid".into(),
            },
            HistoryElement {
                allocation_start_time: hour(1),
                allocation_outputs_id: "old".into(),
            },
        ];

        // Basis is min(last delivery = 15:00, latest entry = 20:00);
        // lookback 6h → cutoff 09:00.
        let filtered = filter_index(&index, 6, Some(hour(15)));
        let ids: Vec<_> = filtered
            .iter()
            .map(|e| e.allocation_outputs_id.as_str())
            .collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn test_filter_index_clamps_huge_lookback() {
        let index = vec![HistoryElement {
            allocation_start_time: hour(5),
            allocation_outputs_id: "only".into(),
        }];

        let filtered = filter_index(&index, i64::MAX / 2, None);
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_filter_index_empty() {
        assert!(filter_index(&[], 24, Some(hour(1))).is_empty());
    }
}
