//! Allocation runtime configuration from environment variables

use std::env;

/// Configuration for the reallocation/export cycle.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    /// Path to the SQLite store backing campaigns, blobs and schedules.
    pub db_path: String,

    /// Bounded history depth replayed into eligibility/metrics per cycle
    /// (hours).
    pub look_back_hours: i64,

    /// Trailing hours of the newest report treated as unstable.
    pub report_dead_zone_hours: i64,

    /// Daily reallocation offsets in minutes, relative to the campaign
    /// start's time-of-day. Sorted ascending.
    pub daily_offset_minutes: Vec<i64>,

    /// Total duration of the initial allocation period (hours).
    pub initial_allocation_period_hours: i64,

    /// Number of equal time slices the initial allocation exports as.
    pub initial_export_slices: u32,

    /// Gap between the two schedule entries of each initial export slice
    /// (hours).
    pub reexport_delay_hours: i64,

    /// Delay after campaign end before cleanup runs (hours).
    pub cleanup_delay_hours: i64,

    /// Attempts for the optimistic campaign save before giving up.
    pub save_retry_limit: u32,

    /// Runtime poll interval for due schedule entries (milliseconds).
    pub poll_interval_ms: u64,
}

impl AllocationConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BUDGETFLOW_DB_PATH` (default: /var/lib/budgetflow/budgetflow.db)
    /// - `BUDGETFLOW_LOOK_BACK_HOURS` (default: 336)
    /// - `BUDGETFLOW_REPORT_DEAD_ZONE_HOURS` (default: 4)
    /// - `BUDGETFLOW_DAILY_OFFSETS` (default: 00:00,06:00,12:00,18:00)
    /// - `BUDGETFLOW_INITIAL_PERIOD_HOURS` (default: 24)
    /// - `BUDGETFLOW_INITIAL_EXPORT_SLICES` (default: 2)
    /// - `BUDGETFLOW_REEXPORT_DELAY_HOURS` (default: 12)
    /// - `BUDGETFLOW_CLEANUP_DELAY_HOURS` (default: 72)
    /// - `BUDGETFLOW_SAVE_RETRY_LIMIT` (default: 3)
    /// - `BUDGETFLOW_POLL_INTERVAL_MS` (default: 60000)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("BUDGETFLOW_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/budgetflow/budgetflow.db".to_string()),

            look_back_hours: env::var("BUDGETFLOW_LOOK_BACK_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(336),

            report_dead_zone_hours: env::var("BUDGETFLOW_REPORT_DEAD_ZONE_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),

            daily_offset_minutes: env::var("BUDGETFLOW_DAILY_OFFSETS")
                .ok()
                .map(|s| parse_daily_offsets(&s))
                .filter(|offsets| !offsets.is_empty())
                .unwrap_or_else(default_daily_offsets),

            initial_allocation_period_hours: env::var("BUDGETFLOW_INITIAL_PERIOD_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(24),

            initial_export_slices: env::var("BUDGETFLOW_INITIAL_EXPORT_SLICES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),

            reexport_delay_hours: env::var("BUDGETFLOW_REEXPORT_DELAY_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(12),

            cleanup_delay_hours: env::var("BUDGETFLOW_CLEANUP_DELAY_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(72),

            save_retry_limit: env::var("BUDGETFLOW_SAVE_RETRY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),

            poll_interval_ms: env::var("BUDGETFLOW_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60_000),
        }
    }
}

fn default_daily_offsets() -> Vec<i64> {
    vec![0, 6 * 60, 12 * 60, 18 * 60]
}

/// Parse a comma-separated list of `HH:MM` offsets into minutes. Entries
/// that do not parse are skipped.
fn parse_daily_offsets(raw: &str) -> Vec<i64> {
    let mut offsets: Vec<i64> = raw
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (hours, minutes) = entry.split_once(':')?;
            let hours: i64 = hours.parse().ok()?;
            let minutes: i64 = minutes.parse().ok()?;
            if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
                return None;
            }
            Some(hours * 60 + minutes)
        })
        .collect();
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daily_offsets() {
        assert_eq!(parse_daily_offsets("00:00,06:30,18:00"), vec![0, 390, 1080]);
        assert_eq!(parse_daily_offsets("03:15,15:45"), vec![195, 945]);
        // Out-of-range and garbage entries are skipped; order normalized.
        assert_eq!(parse_daily_offsets("18:00,25:00,junk,06:00"), vec![360, 1080]);
        assert!(parse_daily_offsets("").is_empty());
    }

    #[test]
    fn test_default_offsets() {
        assert_eq!(default_daily_offsets(), vec![0, 360, 720, 1080]);
    }

    #[test]
    fn test_default_config() {
        env::remove_var("BUDGETFLOW_DB_PATH");
        env::remove_var("BUDGETFLOW_LOOK_BACK_HOURS");

        let config = AllocationConfig::from_env();

        assert_eq!(config.db_path, "/var/lib/budgetflow/budgetflow.db");
        assert_eq!(config.look_back_hours, 336);
        assert_eq!(config.report_dead_zone_hours, 4);
        assert_eq!(config.initial_export_slices, 2);
        assert_eq!(config.save_retry_limit, 3);
    }
}
