//! SQLite implementation of the campaign store and schedule registry
//!
//! Campaigns, allocation blobs, canonical delivery data and valuation
//! caches persist as JSON bodies; the campaign row carries the optimistic
//! version used by `try_save_campaign`. Schema creation is idempotent.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::store::{CampaignStore, ScheduleEntry, ScheduleRegistry, StoreError};
use super::types::{BudgetAllocation, CampaignRecord, MeasureSet};
use crate::delivery_core::canonical::CanonicalDeliveryData;
use crate::delivery_core::report::DeliveryNetwork;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    campaign_id     TEXT PRIMARY KEY,
    version         INTEGER NOT NULL,
    body_json       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS allocation_blobs (
    blob_id         TEXT PRIMARY KEY,
    body_json       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_data (
    campaign_id     TEXT NOT NULL,
    network         TEXT NOT NULL,
    body_json       TEXT NOT NULL,
    PRIMARY KEY (campaign_id, network)
);

CREATE TABLE IF NOT EXISTS valuations (
    campaign_id     TEXT PRIMARY KEY,
    body_json       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule (
    registry        TEXT NOT NULL,
    campaign_id     TEXT NOT NULL,
    fire_at         INTEGER NOT NULL,
    payload_json    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_schedule_due ON schedule (registry, fire_at);
"#;

pub struct SqliteCampaignStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCampaignStore {
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).map_err(backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Register a new campaign at version 1. Setup-time helper; cycles
    /// themselves only ever update.
    pub fn insert_campaign(&self, record: &CampaignRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO campaigns (campaign_id, version, body_json) VALUES (?, 1, ?)",
            params![record.campaign_id, body],
        )
        .map_err(backend)?;
        Ok(())
    }

    /// Replace the campaign's cached approved valuations.
    pub fn save_valuations(
        &self,
        campaign_id: &str,
        valuations: &HashMap<MeasureSet, f64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(valuations)?;
        conn.execute(
            "INSERT INTO valuations (campaign_id, body_json) VALUES (?1, ?2)
             ON CONFLICT(campaign_id) DO UPDATE SET body_json = ?2",
            params![campaign_id, body],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn fetch_campaign_row(
        conn: &Connection,
        campaign_id: &str,
    ) -> Result<(i64, CampaignRecord), StoreError> {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, body_json FROM campaigns WHERE campaign_id = ?",
                params![campaign_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;
        let (version, body) = row.ok_or_else(|| {
            StoreError::NotFound(format!("campaign {}", campaign_id))
        })?;
        let mut record: CampaignRecord = serde_json::from_str(&body)?;
        record.version = version;
        Ok((version, record))
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn fetch_campaign(&self, campaign_id: &str) -> Result<CampaignRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_campaign_row(&conn, campaign_id).map(|(_, record)| record)
    }

    async fn try_save_campaign(&self, record: &CampaignRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(record)?;
        let updated = conn
            .execute(
                "UPDATE campaigns SET version = version + 1, body_json = ?
                 WHERE campaign_id = ? AND version = ?",
                params![body, record.campaign_id, record.version],
            )
            .map_err(backend)?;
        if updated == 1 {
            return Ok(());
        }

        // Distinguish a missing campaign from a concurrent writer.
        let (version, _) = Self::fetch_campaign_row(&conn, &record.campaign_id)?;
        Err(StoreError::StaleVersion(format!(
            "campaign {} is at v{}, save expected v{}",
            record.campaign_id, version, record.version
        )))
    }

    async fn force_update_active_allocation(
        &self,
        campaign_id: &str,
        blob_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let (_, mut record) = Self::fetch_campaign_row(&conn, campaign_id)?;
        record.active_allocation_id = Some(blob_id.to_string());
        let body = serde_json::to_string(&record)?;
        conn.execute(
            "UPDATE campaigns SET version = version + 1, body_json = ? WHERE campaign_id = ?",
            params![body, campaign_id],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn save_allocation_blob(
        &self,
        blob_id: &str,
        allocation: &BudgetAllocation,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(allocation)?;
        conn.execute(
            "INSERT INTO allocation_blobs (blob_id, body_json) VALUES (?1, ?2)
             ON CONFLICT(blob_id) DO UPDATE SET body_json = ?2",
            params![blob_id, body],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn load_allocation_blob(&self, blob_id: &str) -> Result<BudgetAllocation, StoreError> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM allocation_blobs WHERE blob_id = ?",
                params![blob_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let body =
            body.ok_or_else(|| StoreError::NotFound(format!("allocation blob {}", blob_id)))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn load_delivery_data(
        &self,
        campaign_id: &str,
        network: DeliveryNetwork,
    ) -> Result<CanonicalDeliveryData, StoreError> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM delivery_data WHERE campaign_id = ? AND network = ?",
                params![campaign_id, network.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let body = body.ok_or_else(|| {
            StoreError::NotFound(format!("delivery data for {} on {}", campaign_id, network))
        })?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn save_delivery_data(
        &self,
        campaign_id: &str,
        data: &CanonicalDeliveryData,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(data)?;
        conn.execute(
            "INSERT INTO delivery_data (campaign_id, network, body_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(campaign_id, network) DO UPDATE SET body_json = ?3",
            params![campaign_id, data.network.as_str(), body],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn load_approved_valuations(
        &self,
        campaign_id: &str,
    ) -> Result<HashMap<MeasureSet, f64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body_json FROM valuations WHERE campaign_id = ?",
                params![campaign_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        let body = body
            .ok_or_else(|| StoreError::NotFound(format!("valuations for {}", campaign_id)))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn refresh_valuations(&self, campaign_id: &str) -> Result<(), StoreError> {
        // The SQLite cache is the source of record in this deployment;
        // there is nothing upstream to pull from.
        log::debug!("valuation cache refresh is a no-op for {}", campaign_id);
        Ok(())
    }
}

#[async_trait]
impl ScheduleRegistry for SqliteCampaignStore {
    async fn add_entry(
        &self,
        registry: &str,
        at: DateTime<Utc>,
        entry: ScheduleEntry,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let payload = serde_json::to_string(&entry)?;
        conn.execute(
            "INSERT INTO schedule (registry, campaign_id, fire_at, payload_json)
             VALUES (?, ?, ?, ?)",
            params![registry, entry.campaign_id, at.timestamp(), payload],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn remove_entries(&self, registry: &str, campaign_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM schedule WHERE registry = ? AND campaign_id = ?",
            params![registry, campaign_id],
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn due_entries(
        &self,
        registry: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, ScheduleEntry)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT fire_at, payload_json FROM schedule
                 WHERE registry = ? AND fire_at <= ? ORDER BY fire_at",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![registry, now.timestamp()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(backend)?;

        let mut due = Vec::new();
        for row in rows {
            let (fire_at, payload) = row.map_err(backend)?;
            let at = Utc
                .timestamp_opt(fire_at, 0)
                .single()
                .ok_or_else(|| StoreError::InvalidData(format!("bad fire_at {}", fire_at)))?;
            due.push((at, serde_json::from_str(&payload)?));
        }
        Ok(due)
    }

    fn time_slot_key(&self, at: DateTime<Utc>) -> String {
        at.format("%Y%m%d%H%M").to_string()
    }
}
