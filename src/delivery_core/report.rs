//! Per-network delivery report formats and row parsing
//!
//! Each supported delivery network ships hourly delivery reports as
//! line-oriented text with a header row. Report batches are often appended
//! together upstream, so a single payload can contain several header rows.
//! Every network variant carries a field table mapping its source columns to
//! canonical fields, with a required flag and a canonicalization function
//! per column.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::canonical::{truncate_to_hour, DeliveryRecord};

/// Canonical fields a source column can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    CampaignId,
    Hour,
    AllocationId,
    Impressions,
    Ecpm,
    MediaSpend,
    Clicks,
}

/// One column of a network's field table.
pub struct FieldSpec {
    pub column: &'static str,
    pub target: CanonicalField,
    pub required: bool,
    /// Canonicalizes the raw cell value. Returning an empty string marks the
    /// value as unusable; for a required field that fails the whole batch.
    pub canonicalize: fn(&str) -> String,
}

/// Supported delivery networks.
///
/// A closed set: adding a network means adding a variant and its field
/// table, nothing is resolved at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryNetwork {
    Atlas,
    Meridian,
}

impl DeliveryNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryNetwork::Atlas => "atlas",
            DeliveryNetwork::Meridian => "meridian",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "atlas" => Some(DeliveryNetwork::Atlas),
            "meridian" => Some(DeliveryNetwork::Meridian),
            _ => None,
        }
    }

    pub fn all() -> [DeliveryNetwork; 2] {
        [DeliveryNetwork::Atlas, DeliveryNetwork::Meridian]
    }

    /// The network's field table: source column → canonical target.
    pub fn field_table(&self) -> &'static [FieldSpec] {
        match self {
            // Atlas decorates its line code with a prefix and a slice
            // suffix; the 32-hex allocation id is embedded in the middle.
            DeliveryNetwork::Atlas => &[
                FieldSpec {
                    column: "campaign_id",
                    target: CanonicalField::CampaignId,
                    required: true,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "hour",
                    target: CanonicalField::Hour,
                    required: true,
                    canonicalize: canon_utc_hour,
                },
                FieldSpec {
                    column: "campaign_code",
                    target: CanonicalField::AllocationId,
                    required: true,
                    canonicalize: canon_embedded_allocation_id,
                },
                FieldSpec {
                    column: "imps",
                    target: CanonicalField::Impressions,
                    required: true,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "ecpm",
                    target: CanonicalField::Ecpm,
                    required: false,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "spend",
                    target: CanonicalField::MediaSpend,
                    required: false,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "clicks",
                    target: CanonicalField::Clicks,
                    required: false,
                    canonicalize: canon_identity,
                },
            ],
            DeliveryNetwork::Meridian => &[
                FieldSpec {
                    column: "CampaignGuid",
                    target: CanonicalField::CampaignId,
                    required: true,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "DeliveryHour",
                    target: CanonicalField::Hour,
                    required: true,
                    canonicalize: canon_utc_hour,
                },
                FieldSpec {
                    column: "LineItemId",
                    target: CanonicalField::AllocationId,
                    required: true,
                    canonicalize: canon_embedded_allocation_id,
                },
                FieldSpec {
                    column: "Impressions",
                    target: CanonicalField::Impressions,
                    required: true,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "AvgEcpm",
                    target: CanonicalField::Ecpm,
                    required: false,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "MediaSpend",
                    target: CanonicalField::MediaSpend,
                    required: false,
                    canonicalize: canon_identity,
                },
                FieldSpec {
                    column: "Clicks",
                    target: CanonicalField::Clicks,
                    required: false,
                    canonicalize: canon_identity,
                },
            ],
        }
    }

    /// Parse a raw report payload into canonical delivery records.
    ///
    /// Tolerated (row silently dropped): repeated header rows, rows whose
    /// column count does not match the header. Fatal for the whole batch:
    /// a required field canonicalizing to empty, or a value that does not
    /// parse to its expected type. No partial success: the caller merges
    /// either every row or none.
    pub fn parse_report(&self, raw_text: &str) -> Result<Vec<DeliveryRecord>, ReportParseError> {
        let table = self.field_table();

        let mut lines = raw_text.lines().filter(|l| !l.trim().is_empty());
        let header_line = match lines.next() {
            Some(l) => l.trim(),
            None => return Ok(Vec::new()),
        };
        let header: Vec<&str> = header_line.split(',').map(str::trim).collect();

        // Map header position → field spec. Unknown columns are ignored,
        // but every required column must be present.
        let mut column_specs: Vec<Option<&FieldSpec>> = Vec::with_capacity(header.len());
        for column in &header {
            column_specs.push(table.iter().find(|spec| spec.column == *column));
        }
        for spec in table.iter().filter(|s| s.required) {
            if !header.contains(&spec.column) {
                return Err(ReportParseError::MissingColumn {
                    network: *self,
                    column: spec.column,
                });
            }
        }

        let mut records = Vec::new();
        for (line_no, line) in lines.enumerate() {
            let line = line.trim();
            if line == header_line {
                // Appended batch restating its header.
                continue;
            }
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != header.len() {
                log::debug!(
                    "dropping malformed {} report row {} ({} columns, expected {})",
                    self.as_str(),
                    line_no + 2,
                    cells.len(),
                    header.len()
                );
                continue;
            }

            let mut row = RowBuilder::default();
            for (cell, spec) in cells.iter().zip(&column_specs) {
                let spec = match spec {
                    Some(s) => s,
                    None => continue,
                };
                let canonical = (spec.canonicalize)(cell);
                if canonical.is_empty() {
                    if spec.required {
                        return Err(ReportParseError::RequiredFieldEmpty {
                            column: spec.column,
                            line: line_no + 2,
                        });
                    }
                    continue;
                }
                row.set(spec.target, spec.column, &canonical, line_no + 2)?;
            }
            records.push(row.finish(line_no + 2)?);
        }

        Ok(records)
    }
}

impl fmt::Display for DeliveryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Accumulates one row's canonical values before record assembly.
#[derive(Default)]
struct RowBuilder {
    campaign_id: Option<String>,
    hour: Option<DateTime<Utc>>,
    allocation_id: Option<String>,
    impressions: Option<u64>,
    ecpm: Option<f64>,
    media_spend: Option<f64>,
    clicks: Option<u64>,
}

impl RowBuilder {
    fn set(
        &mut self,
        target: CanonicalField,
        column: &'static str,
        value: &str,
        line: usize,
    ) -> Result<(), ReportParseError> {
        fn invalid(column: &'static str, value: &str, line: usize) -> ReportParseError {
            ReportParseError::InvalidValue {
                column,
                value: value.to_string(),
                line,
            }
        }
        match target {
            CanonicalField::CampaignId => self.campaign_id = Some(value.to_string()),
            CanonicalField::AllocationId => self.allocation_id = Some(value.to_string()),
            CanonicalField::Hour => {
                let parsed: DateTime<Utc> =
                    value.parse().map_err(|_| invalid(column, value, line))?;
                self.hour = Some(parsed);
            }
            CanonicalField::Impressions => {
                self.impressions = Some(value.parse().map_err(|_| invalid(column, value, line))?)
            }
            CanonicalField::Ecpm => {
                self.ecpm = Some(value.parse().map_err(|_| invalid(column, value, line))?)
            }
            CanonicalField::MediaSpend => {
                self.media_spend = Some(value.parse().map_err(|_| invalid(column, value, line))?)
            }
            CanonicalField::Clicks => {
                self.clicks = Some(value.parse().map_err(|_| invalid(column, value, line))?)
            }
        }
        Ok(())
    }

    fn finish(self, line: usize) -> Result<DeliveryRecord, ReportParseError> {
        let missing = |column| ReportParseError::RequiredFieldEmpty { column, line };
        Ok(DeliveryRecord {
            campaign_id: self.campaign_id.ok_or_else(|| missing("campaign id"))?,
            hour: self.hour.ok_or_else(|| missing("hour"))?,
            allocation_id: self.allocation_id.ok_or_else(|| missing("allocation id"))?,
            impressions: self.impressions.ok_or_else(|| missing("impressions"))?,
            ecpm: self.ecpm.unwrap_or(0.0),
            media_spend: self.media_spend.unwrap_or(0.0),
            clicks: self.clicks.unwrap_or(0),
        })
    }
}

#[derive(Debug)]
pub enum ReportParseError {
    MissingColumn {
        network: DeliveryNetwork,
        column: &'static str,
    },
    RequiredFieldEmpty {
        column: &'static str,
        line: usize,
    },
    InvalidValue {
        column: &'static str,
        value: String,
        line: usize,
    },
}

impl fmt::Display for ReportParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportParseError::MissingColumn { network, column } => {
                write!(f, "{} report header is missing column '{}'", network, column)
            }
            ReportParseError::RequiredFieldEmpty { column, line } => {
                write!(f, "required field '{}' empty at line {}", column, line)
            }
            ReportParseError::InvalidValue { column, value, line } => {
                write!(f, "invalid value '{}' for '{}' at line {}", value, column, line)
            }
        }
    }
}

impl std::error::Error for ReportParseError {}

/// Pass the value through untouched.
fn canon_identity(value: &str) -> String {
    value.to_string()
}

/// Normalize an hour string to a UTC whole hour in RFC 3339 form.
///
/// Networks report hours with or without a zone offset; offset-less values
/// are already UTC by contract. Unparseable values canonicalize to empty.
fn canon_utc_hour(value: &str) -> String {
    let with_offset = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc));
    let parsed = with_offset.or_else(|_| {
        NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M"))
            .map(|naive| Utc.from_utc_datetime(&naive))
    });

    match parsed {
        Ok(dt) => truncate_to_hour(dt).to_rfc3339(),
        Err(_) => String::new(),
    }
}

/// Extract the 32-hex allocation id embedded in a decorated line code
/// (e.g. `AX-0f3a…9c-001`). Canonicalizes to empty when no 32-character hex
/// run exists.
fn canon_embedded_allocation_id(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut run_start = 0;
    let mut run_len = 0;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_hexdigit() {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len == 32 {
                return value[run_start..run_start + 32].to_ascii_lowercase();
            }
        } else {
            run_len = 0;
        }
    }
    String::new()
}
