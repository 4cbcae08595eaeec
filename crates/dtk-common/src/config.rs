//! Declarative configuration: metric files, profiles, alert channels.
//!
//! Metric declarations and profiles are YAML. Values support environment
//! interpolation in both `${VAR}` and `{{ env_var('VAR') }}` forms before
//! parsing. Configuration errors fail fast (exit code 2) and never touch
//! the tasks table.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::interval::Interval;
use crate::types::parse_timestamp;

static ENV_BRACES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));
static ENV_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*env_var\(\s*'([^']+)'\s*\)\s*\}\}").expect("static regex"));

/// Replace `${VAR}` and `{{ env_var('VAR') }}` references with the value of
/// the corresponding environment variable. Missing variables are a
/// configuration error.
pub fn interpolate_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    let mut matches: Vec<(usize, usize, String)> = Vec::new();
    for caps in ENV_BRACES.captures_iter(raw) {
        let whole = caps.get(0).expect("match 0");
        matches.push((whole.start(), whole.end(), caps[1].to_string()));
    }
    for caps in ENV_CALL.captures_iter(raw) {
        let whole = caps.get(0).expect("match 0");
        matches.push((whole.start(), whole.end(), caps[1].to_string()));
    }
    matches.sort_by_key(|(start, _, _)| *start);
    for (start, end, var) in matches {
        let value = std::env::var(&var).map_err(|_| {
            Error::Configuration(format!("environment variable '{}' is not set", var))
        })?;
        out.push_str(&raw[last..start]);
        out.push_str(&value);
        last = end;
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

mod optional_timestamp {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_str(&crate::types::format_timestamp(*t)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| parse_timestamp(&s).map_err(de::Error::custom))
            .transpose()
    }
}

fn default_true() -> bool {
    true
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_metric_column() -> String {
    "value".to_string()
}

fn default_loading_batch_size() -> usize {
    1000
}

fn default_detection_batch_size() -> usize {
    1000
}

fn default_min_detectors() -> usize {
    1
}

fn default_consecutive_anomalies() -> usize {
    3
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_profile_kind() -> String {
    "sqlite".to_string()
}

fn default_query_timeout() -> u64 {
    300
}

fn default_lock_timeout() -> u64 {
    3600
}

fn default_channel_timeout() -> u64 {
    10
}

fn default_smtp_port() -> u16 {
    25
}

/// Mapping from user-query result columns to engine fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryColumns {
    #[serde(default = "default_timestamp_column")]
    pub timestamp: String,
    #[serde(default = "default_metric_column")]
    pub metric: String,
    /// Columns of the query output carried into the seasonality blob as-is
    #[serde(default)]
    pub seasonality: Vec<String>,
}

impl Default for QueryColumns {
    fn default() -> Self {
        QueryColumns {
            timestamp: default_timestamp_column(),
            metric: default_metric_column(),
            seasonality: Vec::new(),
        }
    }
}

/// Seasonality feature computed from the datapoint timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalityExtract {
    Hour,
    Day,
    Dow,
    Month,
    Quarter,
    Year,
}

impl SeasonalityExtract {
    pub fn extract(&self, t: NaiveDateTime) -> i64 {
        use chrono::{Datelike, Timelike};
        match self {
            SeasonalityExtract::Hour => i64::from(t.hour()),
            SeasonalityExtract::Day => i64::from(t.day()),
            SeasonalityExtract::Dow => i64::from(t.weekday().num_days_from_monday()),
            SeasonalityExtract::Month => i64::from(t.month()),
            SeasonalityExtract::Quarter => i64::from(t.month0() / 3 + 1),
            SeasonalityExtract::Year => i64::from(t.year()),
        }
    }
}

/// A named seasonality column computed from the timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeasonalityColumn {
    pub name: String,
    pub extract: SeasonalityExtract,
}

/// One detector declaration: `{type, params}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
}

/// Direction agreement required across firing detectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    #[default]
    Same,
    Any,
    Up,
    Down,
}

/// Alert policy for a metric
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertPolicy {
    /// Defaults to true when an `alerting` block is present, false otherwise
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IANA timezone for rendered timestamps (display only)
    #[serde(default)]
    pub timezone: Option<String>,
    /// Channel names declared in the profiles file
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_min_detectors")]
    pub min_detectors: usize,
    #[serde(default)]
    pub direction: AlertDirection,
    #[serde(default = "default_consecutive_anomalies")]
    pub consecutive_anomalies: usize,
    /// Minimum spacing between alerts; absent = no cooldown
    #[serde(default)]
    pub alert_cooldown: Option<Interval>,
    #[serde(default)]
    pub cooldown_reset_on_recovery: bool,
    #[serde(default)]
    pub no_data_alert: bool,
    #[serde(default)]
    pub template_single: Option<String>,
    #[serde(default)]
    pub template_consecutive: Option<String>,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        AlertPolicy {
            enabled: false,
            timezone: None,
            channels: Vec::new(),
            min_detectors: default_min_detectors(),
            direction: AlertDirection::Same,
            consecutive_anomalies: default_consecutive_anomalies(),
            alert_cooldown: None,
            cooldown_reset_on_recovery: false,
            no_data_alert: false,
            template_single: None,
            template_consecutive: None,
        }
    }
}

/// Per-metric overrides of the internal table names
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableOverrides {
    #[serde(default)]
    pub datapoints: Option<String>,
    #[serde(default)]
    pub detections: Option<String>,
}

/// A declarative metric: query, interval, detectors, alert routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub interval: Interval,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub query_file: Option<PathBuf>,
    #[serde(default)]
    pub query_columns: QueryColumns,
    #[serde(default, with = "optional_timestamp")]
    pub loading_start_time: Option<NaiveDateTime>,
    /// Load slice size, in intervals
    #[serde(default = "default_loading_batch_size")]
    pub loading_batch_size: usize,
    /// Detection batch size, in intervals
    #[serde(default = "default_detection_batch_size")]
    pub detection_batch_size: usize,
    #[serde(default)]
    pub seasonality_columns: Vec<SeasonalityColumn>,
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
    #[serde(default)]
    pub alerting: AlertPolicy,
    #[serde(default)]
    pub tables: TableOverrides,
    /// Path of the declaring file; set by the loader, used by selectors
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl MetricConfig {
    /// Parse a metric declaration from YAML text (already interpolated)
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: MetricConfig = serde_yaml::from_str(raw)
            .map_err(|e| Error::Configuration(format!("invalid metric declaration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a metric declaration from a file: interpolate environment
    /// variables, parse, resolve `query_file` relative to the metric file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        let interpolated = interpolate_env(&raw)?;
        let mut config = Self::from_yaml_str(&interpolated)?;
        config.source_path = Some(path.to_path_buf());
        if let Some(query_file) = config.query_file.clone() {
            let resolved = if query_file.is_absolute() {
                query_file
            } else {
                path.parent().unwrap_or(Path::new(".")).join(query_file)
            };
            let sql = std::fs::read_to_string(&resolved).map_err(|e| {
                Error::Configuration(format!("cannot read query file {}: {}", resolved.display(), e))
            })?;
            config.query = Some(interpolate_env(&sql)?);
        }
        Ok(config)
    }

    /// The SQL to run, after `query_file` resolution
    pub fn resolved_query(&self) -> Result<&str> {
        self.query.as_deref().ok_or_else(|| {
            Error::Configuration(format!("metric '{}' has no query", self.name))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("metric name must not be empty".to_string()));
        }
        match (&self.query, &self.query_file) {
            (None, None) => {
                return Err(Error::Configuration(format!(
                    "metric '{}' must declare exactly one of query / query_file",
                    self.name
                )))
            }
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(format!(
                    "metric '{}' declares both query and query_file",
                    self.name
                )))
            }
            _ => {}
        }
        if self.loading_batch_size == 0 {
            return Err(Error::Configuration(format!(
                "metric '{}': loading_batch_size must be >= 1",
                self.name
            )));
        }
        if self.detection_batch_size == 0 {
            return Err(Error::Configuration(format!(
                "metric '{}': detection_batch_size must be >= 1",
                self.name
            )));
        }
        if self.alerting.consecutive_anomalies == 0 {
            return Err(Error::Configuration(format!(
                "metric '{}': consecutive_anomalies must be >= 1",
                self.name
            )));
        }
        if self.alerting.min_detectors == 0 {
            return Err(Error::Configuration(format!(
                "metric '{}': min_detectors must be >= 1",
                self.name
            )));
        }
        for detector in &self.detectors {
            if detector.kind.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "metric '{}': detector type must not be empty",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Database connection parameters for one profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    #[serde(rename = "type", default = "default_profile_kind")]
    pub kind: String,
    /// Backend-specific locator; for sqlite, the database file path
    #[serde(default)]
    pub database: Option<String>,
    /// Namespace prefix for the four internal tables
    #[serde(default, alias = "internal_database")]
    pub internal_schema: Option<String>,
    /// Namespace the user queries run against; informational for
    /// backends without schema support
    #[serde(default, alias = "data_database")]
    pub data_schema: Option<String>,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
}

/// One alert delivery channel, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ChannelConfig {
    Mattermost {
        /// Incoming-webhook URL
        url: String,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default = "default_channel_timeout")]
        timeout_seconds: u64,
    },
    Slack {
        webhook_url: String,
        #[serde(default = "default_channel_timeout")]
        timeout_seconds: u64,
    },
    Telegram {
        bot_token: String,
        chat_id: String,
        #[serde(default = "default_channel_timeout")]
        timeout_seconds: u64,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_channel_timeout")]
        timeout_seconds: u64,
    },
    Email {
        from: String,
        to: Vec<String>,
        #[serde(default)]
        smtp_host: Option<String>,
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
    },
}

impl ChannelConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelConfig::Mattermost { .. } => "mattermost",
            ChannelConfig::Slack { .. } => "slack",
            ChannelConfig::Telegram { .. } => "telegram",
            ChannelConfig::Webhook { .. } => "webhook",
            ChannelConfig::Email { .. } => "email",
        }
    }
}

/// The profiles file: named connections plus alert channel declarations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub default_profile: Option<String>,
    pub profiles: BTreeMap<String, ProfileConfig>,
    #[serde(default)]
    pub alert_channels: BTreeMap<String, ChannelConfig>,
}

impl ProfilesFile {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let interpolated = interpolate_env(raw)?;
        let file: ProfilesFile = serde_yaml::from_str(&interpolated)
            .map_err(|e| Error::Configuration(format!("invalid profiles file: {}", e)))?;
        if file.profiles.is_empty() {
            return Err(Error::Configuration(
                "profiles file declares no profiles".to_string(),
            ));
        }
        Ok(file)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    /// Resolve a profile by explicit name, `default_profile`, or the sole entry
    pub fn resolve_profile(&self, name: Option<&str>) -> Result<(&str, &ProfileConfig)> {
        let chosen = name
            .or(self.default_profile.as_deref())
            .or_else(|| {
                if self.profiles.len() == 1 {
                    self.profiles.keys().next().map(String::as_str)
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                Error::Configuration(
                    "no profile selected: pass --profile or set default_profile".to_string(),
                )
            })?;
        let (key, profile) = self.profiles.get_key_value(chosen).ok_or_else(|| {
            Error::Configuration(format!("profile '{}' is not declared", chosen))
        })?;
        Ok((key.as_str(), profile))
    }

    pub fn channel(&self, name: &str) -> Result<&ChannelConfig> {
        self.alert_channels.get(name).ok_or_else(|| {
            Error::Configuration(format!("alert channel '{}' is not declared", name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METRIC_YAML: &str = r#"
name: orders_per_10min
description: Orders per 10 minutes
tags: [core, billing]
interval: 10min
query: |
  SELECT toStartOfTenMinutes(created_at) AS timestamp, count() AS value
  FROM orders
  WHERE created_at >= :from_date AND created_at < :to_date
  GROUP BY 1
loading_start_time: "2024-01-01"
loading_batch_size: 500
seasonality_columns:
  - name: hour
    extract: hour
  - name: dow
    extract: dow
detectors:
  - type: mad
    params:
      window_size: 432
      threshold: 4
  - type: z_score
alerting:
  channels: [ops]
  min_detectors: 2
  direction: same
  consecutive_anomalies: 3
  alert_cooldown: 30min
"#;

    #[test]
    fn parses_full_metric() {
        let m = MetricConfig::from_yaml_str(METRIC_YAML).unwrap();
        assert_eq!(m.name, "orders_per_10min");
        assert!(m.enabled);
        assert_eq!(m.interval.seconds(), 600);
        assert_eq!(m.loading_batch_size, 500);
        assert_eq!(m.detection_batch_size, 1000);
        assert_eq!(m.seasonality_columns.len(), 2);
        assert_eq!(m.detectors.len(), 2);
        assert_eq!(m.detectors[0].kind, "mad");
        assert_eq!(m.detectors[0].params["threshold"], 4);
        assert!(m.alerting.enabled);
        assert_eq!(m.alerting.min_detectors, 2);
        assert_eq!(m.alerting.alert_cooldown.unwrap().seconds(), 1800);
        assert_eq!(
            m.loading_start_time.unwrap(),
            parse_timestamp("2024-01-01").unwrap()
        );
    }

    #[test]
    fn alerting_absent_means_disabled() {
        let m = MetricConfig::from_yaml_str(
            "name: m\ninterval: 1h\nquery: SELECT 1\n",
        )
        .unwrap();
        assert!(!m.alerting.enabled);
        assert_eq!(m.alerting.consecutive_anomalies, 3);
        assert_eq!(m.alerting.min_detectors, 1);
        assert_eq!(m.alerting.direction, AlertDirection::Same);
    }

    #[test]
    fn rejects_missing_query() {
        let err = MetricConfig::from_yaml_str("name: m\ninterval: 1h\n").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rejects_query_and_query_file() {
        let err = MetricConfig::from_yaml_str(
            "name: m\ninterval: 1h\nquery: SELECT 1\nquery_file: q.sql\n",
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(MetricConfig::from_yaml_str(
            "name: m\ninterval: 1h\nquery: SELECT 1\nsurprise: true\n"
        )
        .is_err());
    }

    #[test]
    fn interpolates_both_env_forms() {
        std::env::set_var("DTK_TEST_TOKEN", "s3cret");
        let out = interpolate_env("a=${DTK_TEST_TOKEN} b={{ env_var('DTK_TEST_TOKEN') }}").unwrap();
        assert_eq!(out, "a=s3cret b=s3cret");
        assert!(interpolate_env("${DTK_TEST_MISSING_VAR}").is_err());
    }

    #[test]
    fn parses_profiles_with_channels() {
        let yaml = r#"
default_profile: dev
profiles:
  dev:
    type: sqlite
    database: ./dev.db
  prod:
    type: sqlite
    database: /var/lib/driftkit/prod.db
    internal_schema: monitoring
    query_timeout_seconds: 120
alert_channels:
  ops:
    type: mattermost
    url: https://mm.example.com/hooks/abc
    channel: alerts
  oncall:
    type: telegram
    bot_token: "123:abc"
    chat_id: "-100200300"
  audit:
    type: webhook
    url: https://example.com/hook
    headers:
      X-Token: t
"#;
        let f = ProfilesFile::from_yaml_str(yaml).unwrap();
        let (name, profile) = f.resolve_profile(None).unwrap();
        assert_eq!(name, "dev");
        assert_eq!(profile.database.as_deref(), Some("./dev.db"));
        assert_eq!(profile.query_timeout_seconds, 300);
        assert_eq!(profile.lock_timeout_seconds, 3600);
        let (_, prod) = f.resolve_profile(Some("prod")).unwrap();
        assert_eq!(prod.query_timeout_seconds, 120);
        assert_eq!(prod.internal_schema.as_deref(), Some("monitoring"));
        assert_eq!(f.channel("ops").unwrap().kind(), "mattermost");
        assert!(f.channel("nope").is_err());
        assert!(f.resolve_profile(Some("missing")).is_err());
    }

    #[test]
    fn seasonality_extracts() {
        // 2024-05-01 is a Wednesday
        let t = parse_timestamp("2024-05-01 13:45:00").unwrap();
        assert_eq!(SeasonalityExtract::Hour.extract(t), 13);
        assert_eq!(SeasonalityExtract::Day.extract(t), 1);
        assert_eq!(SeasonalityExtract::Dow.extract(t), 2);
        assert_eq!(SeasonalityExtract::Month.extract(t), 5);
        assert_eq!(SeasonalityExtract::Quarter.extract(t), 2);
        assert_eq!(SeasonalityExtract::Year.extract(t), 2024);
    }
}
