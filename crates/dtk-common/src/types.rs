//! Core record types persisted in the internal tables.
//!
//! All timestamps are naive UTC; display timezones are reintroduced only
//! when rendering alerts.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Wire format for timestamps persisted in the internal tables.
/// Sorts lexicographically in chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Detection skip reason: fewer than `min_samples` finite values in window
pub const REASON_INSUFFICIENT_DATA: &str = "insufficient_data";
/// Detection skip reason: the judged value itself is absent
pub const REASON_MISSING_DATA: &str = "missing_data";

pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp from any of the formats the engine accepts in
/// configuration and query output. Offset-carrying forms are converted to
/// naive UTC.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    let s = s.trim();
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%d",
    ] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(t);
        }
        if format == "%Y-%m-%d" {
            if let Ok(d) = chrono::NaiveDate::parse_from_str(s, format) {
                return Ok(d.and_hms_opt(0, 0, 0).unwrap_or_default());
            }
        }
    }
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(t.naive_utc());
    }
    Err(Error::InvalidTimestamp(s.to_string()))
}

/// Where a value sits relative to the confidence interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
    None,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Above => "above",
            Direction::Below => "below",
            Direction::None => "none",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "above" => Ok(Direction::Above),
            "below" => Ok(Direction::Below),
            "none" => Ok(Direction::None),
            other => Err(Error::Database(format!("unknown direction '{}'", other))),
        }
    }
}

/// Lifecycle state of a metric task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Database(format!("unknown task status '{}'", other))),
        }
    }
}

/// A single seasonality column value: integer bucket or label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeasonalityValue {
    Int(i64),
    Text(String),
}

impl SeasonalityValue {
    /// Stable string form used when building group keys
    pub fn key_part(&self) -> String {
        match self {
            SeasonalityValue::Int(v) => v.to_string(),
            SeasonalityValue::Text(v) => v.clone(),
        }
    }
}

impl From<i64> for SeasonalityValue {
    fn from(v: i64) -> Self {
        SeasonalityValue::Int(v)
    }
}

impl From<&str> for SeasonalityValue {
    fn from(v: &str) -> Self {
        SeasonalityValue::Text(v.to_string())
    }
}

/// Per-row seasonality blob, serialized to JSON at the store boundary
pub type SeasonalityData = BTreeMap<String, SeasonalityValue>;

/// A (metric, timestamp, value, seasonality) record on the interval grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub metric_name: String,
    pub timestamp: NaiveDateTime,
    /// Absent when the grid timestamp was gap-filled
    pub value: Option<f64>,
    #[serde(default)]
    pub seasonality_data: SeasonalityData,
    pub created_at: NaiveDateTime,
}

/// One detector verdict for one grid timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub metric_name: String,
    pub detector_hash: String,
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
    pub is_anomaly: bool,
    pub confidence_lower: Option<f64>,
    pub confidence_upper: Option<f64>,
    pub direction: Direction,
    pub severity: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Set when detection was skipped (`insufficient_data`, `missing_data`)
    pub reason: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Task row: per-metric lock, status, and alert bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub metric_name: String,
    pub status: TaskStatus,
    pub locked_at: Option<NaiveDateTime>,
    pub lock_expires_at: Option<NaiveDateTime>,
    pub last_run_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    pub last_alert_sent: Option<NaiveDateTime>,
    pub alert_count: i64,
}

impl TaskRow {
    pub fn new(metric_name: impl Into<String>) -> Self {
        TaskRow {
            metric_name: metric_name.into(),
            status: TaskStatus::Idle,
            locked_at: None,
            lock_expires_at: None,
            last_run_at: None,
            last_error: None,
            last_alert_sent: None,
            alert_count: 0,
        }
    }

    /// A lock is live when the task is running and not yet expired
    pub fn is_locked_at(&self, now: NaiveDateTime) -> bool {
        self.status == TaskStatus::Running
            && self.lock_expires_at.map(|e| e > now).unwrap_or(false)
    }
}
