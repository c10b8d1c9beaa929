//! Reallocation and cleanup scheduling
//!
//! Each campaign keeps at most one pending reallocation entry; scheduling
//! always clears the previous entry first, so a crashed or repeated cycle
//! reschedules idempotently. Once the computed next reallocation reaches
//! campaign end the chain terminates: a cleanup entry is scheduled instead
//! and no further reallocations occur.

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use std::sync::Arc;

use super::config::AllocationConfig;
use super::store::{
    ScheduleEntry, ScheduleRegistry, StoreError, CLEANUP_REGISTRY, REALLOCATION_REGISTRY,
};
use super::types::CampaignRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocationKind {
    First,
    Regular,
}

pub struct ReallocationScheduler {
    registry: Arc<dyn ScheduleRegistry>,
    config: AllocationConfig,
}

impl ReallocationScheduler {
    pub fn new(registry: Arc<dyn ScheduleRegistry>, config: AllocationConfig) -> Self {
        Self { registry, config }
    }

    /// Schedule the campaign's next reallocation and return the start of
    /// the allocation period it opens.
    ///
    /// When the computed time reaches campaign end, no reallocation is
    /// scheduled; cleanup is scheduled at `campaign_end + cleanup_delay`
    /// and campaign end is returned.
    pub async fn schedule_next_reallocation(
        &self,
        record: &CampaignRecord,
        immediate: bool,
        kind: ReallocationKind,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.registry
            .remove_entries(REALLOCATION_REGISTRY, &record.campaign_id)
            .await?;

        let settings = &record.settings;
        let next = if immediate {
            now
        } else {
            match kind {
                ReallocationKind::First => {
                    now.max(settings.campaign_start)
                        + Duration::hours(self.config.initial_allocation_period_hours)
                }
                ReallocationKind::Regular => self.find_next_reallocation(record, now),
            }
        };

        let entry = ScheduleEntry {
            campaign_id: record.campaign_id.clone(),
            company_id: record.company_id.clone(),
            allocation_blob_id: None,
            delivery_network: None,
        };

        if next >= settings.campaign_end {
            let cleanup_at =
                settings.campaign_end + Duration::hours(self.config.cleanup_delay_hours);
            log::info!(
                "🏁 campaign {} reached its end; cleanup at {}",
                record.campaign_id,
                cleanup_at
            );
            self.registry
                .add_entry(CLEANUP_REGISTRY, cleanup_at, entry)
                .await?;
            return Ok(settings.campaign_end);
        }

        log::info!(
            "⏰ campaign {} next reallocation at {}",
            record.campaign_id,
            next
        );
        self.registry
            .add_entry(REALLOCATION_REGISTRY, next, entry)
            .await?;
        Ok(next.max(settings.campaign_start))
    }

    /// Next slot in the configured daily schedule, strictly after `now`.
    ///
    /// Offsets are relative to the campaign start's time-of-day. Futurity
    /// is tested on the registry's time-slot key, not raw timestamps, so
    /// the slot containing "now" is never reprocessed.
    pub fn find_next_reallocation(
        &self,
        record: &CampaignRecord,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let start = record.settings.campaign_start;
        let now_key = self.registry.time_slot_key(now);

        if self.registry.time_slot_key(start) > now_key {
            return start;
        }

        let anchor = NaiveTime::from_hms_opt(start.hour(), start.minute(), 0)
            .unwrap_or(NaiveTime::MIN);
        // Walk from the day before now's date so an anchor later in the day
        // cannot hide earlier candidates, rolling day by day once a day's
        // offsets are exhausted.
        let first_day = now.date_naive().pred_opt().unwrap_or(now.date_naive());
        for day in 0..4 {
            let day_base = first_day
                .and_time(anchor)
                .and_utc()
                + Duration::days(day);
            for &offset_minutes in &self.config.daily_offset_minutes {
                let candidate = day_base + Duration::minutes(offset_minutes);
                if self.registry.time_slot_key(candidate) > now_key {
                    return candidate;
                }
            }
        }

        // Only reachable with an empty offset list; fall back to the next
        // day's anchor rather than stalling the chain.
        log::warn!(
            "campaign {} has no usable daily offsets; deferring one day",
            record.campaign_id
        );
        now.date_naive()
            .succ_opt()
            .unwrap_or(now.date_naive())
            .and_time(anchor)
            .and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::store::EXPORT_REGISTRY;
    use crate::allocation::types::{CampaignSettings, SchedulePhase};
    use crate::delivery_core::report::DeliveryNetwork;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minute-bucketed in-memory registry for scheduler tests.
    struct MemoryRegistry {
        entries: Mutex<Vec<(String, DateTime<Utc>, ScheduleEntry)>>,
    }

    impl MemoryRegistry {
        fn new() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
            }
        }

        fn entries_in(&self, registry: &str) -> Vec<(DateTime<Utc>, ScheduleEntry)> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _, _)| r == registry)
                .map(|(_, at, e)| (*at, e.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl ScheduleRegistry for MemoryRegistry {
        async fn add_entry(
            &self,
            registry: &str,
            at: DateTime<Utc>,
            entry: ScheduleEntry,
        ) -> Result<(), StoreError> {
            self.entries
                .lock()
                .unwrap()
                .push((registry.to_string(), at, entry));
            Ok(())
        }

        async fn remove_entries(
            &self,
            registry: &str,
            campaign_id: &str,
        ) -> Result<(), StoreError> {
            self.entries
                .lock()
                .unwrap()
                .retain(|(r, _, e)| !(r == registry && e.campaign_id == campaign_id));
            Ok(())
        }

        async fn due_entries(
            &self,
            registry: &str,
            now: DateTime<Utc>,
        ) -> Result<Vec<(DateTime<Utc>, ScheduleEntry)>, StoreError> {
            let mut due: Vec<_> = self
                .entries_in(registry)
                .into_iter()
                .filter(|(at, _)| *at <= now)
                .collect();
            due.sort_by_key(|(at, _)| *at);
            Ok(due)
        }

        fn time_slot_key(&self, at: DateTime<Utc>) -> String {
            at.format("%Y%m%d%H%M").to_string()
        }
    }

    fn record(start: DateTime<Utc>, end: DateTime<Utc>) -> CampaignRecord {
        CampaignRecord {
            campaign_id: "camp-1".into(),
            company_id: "co-1".into(),
            version: 1,
            settings: CampaignSettings {
                campaign_start: start,
                campaign_end: end,
                total_budget: 1000.0,
                platform_fee_rate: 0.0,
                data_fee_cpm: 0.0,
                delivery_network: DeliveryNetwork::Atlas,
            },
            node_map: HashMap::new(),
            history_index: Vec::new(),
            active_allocation_id: None,
            phase: SchedulePhase::RegularReallocation,
        }
    }

    fn scheduler(registry: Arc<MemoryRegistry>) -> ReallocationScheduler {
        let mut config = AllocationConfig::from_env();
        config.daily_offset_minutes = vec![0, 6 * 60, 12 * 60, 18 * 60];
        config.initial_allocation_period_hours = 24;
        config.cleanup_delay_hours = 72;
        ReallocationScheduler::new(registry, config)
    }

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_find_next_snaps_to_future_campaign_start() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry);
        let record = record(ts(10, 9, 0), ts(20, 0, 0));

        assert_eq!(s.find_next_reallocation(&record, ts(5, 14, 0)), ts(10, 9, 0));
    }

    #[test]
    fn test_find_next_walks_daily_offsets() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry);
        // Campaign started 09:30, so slots fall at 09:30, 15:30, 21:30,
        // 03:30 each day.
        let record = record(ts(1, 9, 30), ts(20, 0, 0));

        assert_eq!(s.find_next_reallocation(&record, ts(5, 10, 0)), ts(5, 15, 30));
        assert_eq!(s.find_next_reallocation(&record, ts(5, 16, 0)), ts(5, 21, 30));
        // Day's offsets exhausted: rolls to the next day's first slot.
        assert_eq!(s.find_next_reallocation(&record, ts(5, 22, 0)), ts(6, 3, 30));
    }

    #[test]
    fn test_find_next_is_strictly_future_by_slot_key() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry);
        let record = record(ts(1, 9, 30), ts(20, 0, 0));

        // Sitting exactly on a slot: same minute bucket, so the slot
        // containing "now" is skipped.
        let next = s.find_next_reallocation(&record, ts(5, 15, 30));
        assert_eq!(next, ts(5, 21, 30));
        assert!(s.registry.time_slot_key(next) > s.registry.time_slot_key(ts(5, 15, 30)));
    }

    #[tokio::test]
    async fn test_schedule_replaces_pending_entry() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry.clone());
        let record = record(ts(1, 0, 0), ts(20, 0, 0));

        s.schedule_next_reallocation(&record, false, ReallocationKind::Regular, ts(5, 1, 0))
            .await
            .unwrap();
        s.schedule_next_reallocation(&record, false, ReallocationKind::Regular, ts(5, 7, 0))
            .await
            .unwrap();

        let entries = registry.entries_in(REALLOCATION_REGISTRY);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, ts(5, 12, 0));
    }

    #[tokio::test]
    async fn test_first_reallocation_after_initial_period() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry.clone());
        let record = record(ts(3, 8, 0), ts(20, 0, 0));

        // Campaign already started: period counts from now.
        let period_start = s
            .schedule_next_reallocation(&record, false, ReallocationKind::First, ts(4, 10, 0))
            .await
            .unwrap();
        assert_eq!(period_start, ts(5, 10, 0));

        // Campaign not started yet: period counts from campaign start.
        let period_start = s
            .schedule_next_reallocation(&record, false, ReallocationKind::First, ts(1, 0, 0))
            .await
            .unwrap();
        assert_eq!(period_start, ts(4, 8, 0));
    }

    #[tokio::test]
    async fn test_immediate_uses_now() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry.clone());
        let record = record(ts(1, 0, 0), ts(20, 0, 0));

        let period_start = s
            .schedule_next_reallocation(&record, true, ReallocationKind::Regular, ts(5, 13, 45))
            .await
            .unwrap();
        assert_eq!(period_start, ts(5, 13, 45));
        assert_eq!(registry.entries_in(REALLOCATION_REGISTRY)[0].0, ts(5, 13, 45));
    }

    #[tokio::test]
    async fn test_campaign_end_schedules_cleanup_not_reallocation() {
        let registry = Arc::new(MemoryRegistry::new());
        let s = scheduler(registry.clone());
        let end = ts(6, 0, 0);
        let record = record(ts(1, 0, 0), end);

        // Next regular slot lands past campaign end.
        let returned = s
            .schedule_next_reallocation(&record, false, ReallocationKind::Regular, ts(5, 19, 0))
            .await
            .unwrap();

        assert_eq!(returned, end);
        assert!(registry.entries_in(REALLOCATION_REGISTRY).is_empty());
        let cleanup = registry.entries_in(CLEANUP_REGISTRY);
        assert_eq!(cleanup.len(), 1);
        assert_eq!(cleanup[0].0, end + Duration::hours(72));
        assert!(registry.entries_in(EXPORT_REGISTRY).is_empty());
    }
}
