//! The alert event: what the evaluator emits and the dispatcher renders.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::str::FromStr;

use dtk_common::{Direction, Error, Result};

/// What kind of condition the event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Anomaly,
    NoData,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Anomaly => "anomaly",
            AlertKind::NoData => "no_data",
        }
    }
}

/// One alert occurrence for one metric
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: String,
    pub kind: AlertKind,
    pub metric_name: String,
    /// Most recent anomalous grid instant (naive UTC)
    pub timestamp: NaiveDateTime,
    /// Timestamp rendered in the policy's display timezone
    pub local_time: String,
    pub value: Option<f64>,
    pub confidence_lower: Option<f64>,
    pub confidence_upper: Option<f64>,
    pub direction: Direction,
    pub severity: f64,
    pub detector_name: String,
    /// Trailing jointly-anomalous run length at emission time
    pub consecutive_count: usize,
}

impl AlertEvent {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Render a naive-UTC instant in the policy's display timezone. Internally
/// everything stays naive UTC; this is the only place timezones appear.
pub fn render_local_time(timestamp: NaiveDateTime, timezone: Option<&str>) -> Result<String> {
    match timezone {
        None => Ok(format!("{} UTC", dtk_common::format_timestamp(timestamp))),
        Some(name) => {
            let tz = chrono_tz::Tz::from_str(name).map_err(|_| {
                Error::Configuration(format!("unknown timezone '{}'", name))
            })?;
            let local = timestamp.and_utc().with_timezone(&tz);
            Ok(local.format("%Y-%m-%d %H:%M:%S %Z").to_string())
        }
    }
}
