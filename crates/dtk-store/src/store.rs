//! Typed accessors over the four internal tables.
//!
//! Every engine component reads and writes through [`InternalStore`]; the
//! store owns table-name resolution and the row (de)serialization, and
//! keeps watermark queries honest: an empty table yields `None`, never
//! the epoch.

use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tracing::debug;

use dtk_common::{
    Datapoint, DetectionRow, Direction, Error, MetricConfig, Result, SeasonalityData, TaskRow,
    TaskStatus,
};

use crate::adapter::{column, DatabaseAdapter, SqlRow, SqlValue};
use crate::tables::StoreTables;

/// One datapoint as a detector consumes it: grid timestamp, optional
/// value, seasonality blob
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPoint {
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
    pub seasonality: SeasonalityData,
}

/// Store facade over a database adapter and resolved table names
#[derive(Clone)]
pub struct InternalStore {
    adapter: Arc<dyn DatabaseAdapter>,
    tables: StoreTables,
}

fn opt_timestamp(row: &SqlRow, name: &str) -> Result<Option<NaiveDateTime>> {
    match column(row, name)? {
        SqlValue::Null => Ok(None),
        value => value.as_timestamp().map(Some),
    }
}

fn opt_f64(row: &SqlRow, name: &str) -> Result<Option<f64>> {
    match column(row, name)? {
        SqlValue::Null => Ok(None),
        value => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::Database(format!("column '{}' is not numeric", name))),
    }
}

fn opt_text(row: &SqlRow, name: &str) -> Result<Option<String>> {
    match column(row, name)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s.clone())),
        other => Ok(other.to_bind_string()),
    }
}

/// `created_at` persists as REAL epoch seconds with sub-second precision
/// so the "fresh detections only" filter distinguishes runs that start
/// within the same wall-clock second.
fn epoch_value(t: NaiveDateTime) -> SqlValue {
    let utc = t.and_utc();
    SqlValue::Float(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_micros()) / 1e6)
}

fn parse_seasonality(raw: Option<String>) -> SeasonalityData {
    raw.as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn datapoint_to_row(point: &Datapoint) -> Result<SqlRow> {
    let mut row = SqlRow::new();
    row.insert("metric_name".into(), SqlValue::Text(point.metric_name.clone()));
    row.insert("timestamp".into(), SqlValue::Timestamp(point.timestamp));
    row.insert("value".into(), SqlValue::from_opt_f64(point.value));
    row.insert(
        "seasonality_data".into(),
        SqlValue::Text(serde_json::to_string(&point.seasonality_data)?),
    );
    row.insert("created_at".into(), epoch_value(point.created_at));
    Ok(row)
}

fn detection_to_row(detection: &DetectionRow) -> Result<SqlRow> {
    let mut row = SqlRow::new();
    row.insert("metric_name".into(), SqlValue::Text(detection.metric_name.clone()));
    row.insert("detector_hash".into(), SqlValue::Text(detection.detector_hash.clone()));
    row.insert("timestamp".into(), SqlValue::Timestamp(detection.timestamp));
    row.insert("value".into(), SqlValue::from_opt_f64(detection.value));
    row.insert("is_anomaly".into(), SqlValue::from(detection.is_anomaly));
    row.insert(
        "confidence_lower".into(),
        SqlValue::from_opt_f64(detection.confidence_lower),
    );
    row.insert(
        "confidence_upper".into(),
        SqlValue::from_opt_f64(detection.confidence_upper),
    );
    row.insert("direction".into(), SqlValue::Text(detection.direction.to_string()));
    row.insert("severity".into(), SqlValue::Float(detection.severity));
    row.insert(
        "metadata".into(),
        SqlValue::Text(serde_json::to_string(&detection.metadata)?),
    );
    row.insert("reason".into(), SqlValue::from_opt_text(detection.reason.as_deref()));
    row.insert("created_at".into(), epoch_value(detection.created_at));
    Ok(row)
}

fn detection_from_row(row: &SqlRow) -> Result<DetectionRow> {
    let direction: Direction = opt_text(row, "direction")?
        .unwrap_or_else(|| "none".to_string())
        .parse()?;
    let metadata = opt_text(row, "metadata")?
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);
    Ok(DetectionRow {
        metric_name: opt_text(row, "metric_name")?.unwrap_or_default(),
        detector_hash: opt_text(row, "detector_hash")?.unwrap_or_default(),
        timestamp: column(row, "timestamp")?.as_timestamp()?,
        value: opt_f64(row, "value")?,
        is_anomaly: column(row, "is_anomaly")?.as_i64().unwrap_or(0) != 0,
        confidence_lower: opt_f64(row, "confidence_lower")?,
        confidence_upper: opt_f64(row, "confidence_upper")?,
        direction,
        severity: opt_f64(row, "severity")?.unwrap_or(0.0),
        metadata,
        reason: opt_text(row, "reason")?,
        created_at: column(row, "created_at")?.as_timestamp()?,
    })
}

fn task_from_row(row: &SqlRow) -> Result<TaskRow> {
    let status: TaskStatus = opt_text(row, "status")?
        .unwrap_or_else(|| "idle".to_string())
        .parse()?;
    Ok(TaskRow {
        metric_name: opt_text(row, "metric_name")?.unwrap_or_default(),
        status,
        locked_at: opt_timestamp(row, "locked_at")?,
        lock_expires_at: opt_timestamp(row, "lock_expires_at")?,
        last_run_at: opt_timestamp(row, "last_run_at")?,
        last_error: opt_text(row, "last_error")?,
        last_alert_sent: opt_timestamp(row, "last_alert_sent")?,
        alert_count: column(row, "alert_count")?.as_i64().unwrap_or(0),
    })
}

impl InternalStore {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, tables: StoreTables) -> Self {
        InternalStore { adapter, tables }
    }

    pub fn adapter(&self) -> Arc<dyn DatabaseAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn tables(&self) -> &StoreTables {
        &self.tables
    }

    /// Create the four internal tables if missing
    pub async fn ensure_tables(&self) -> Result<()> {
        for statement in self.tables.ddl() {
            self.adapter.execute_ddl(&statement).await?;
        }
        Ok(())
    }

    /// Write-or-replace datapoints by (metric, timestamp)
    pub async fn upsert_datapoints(&self, points: &[Datapoint]) -> Result<u64> {
        let rows: Vec<SqlRow> = points.iter().map(datapoint_to_row).collect::<Result<_>>()?;
        self.adapter
            .upsert(&self.tables.datapoints, &["metric_name", "timestamp"], &rows)
            .await
    }

    /// Write-or-replace detections by (metric, detector_hash, timestamp)
    pub async fn upsert_detections(&self, detections: &[DetectionRow]) -> Result<u64> {
        let rows: Vec<SqlRow> = detections
            .iter()
            .map(detection_to_row)
            .collect::<Result<_>>()?;
        self.adapter
            .upsert(
                &self.tables.detections,
                &["metric_name", "detector_hash", "timestamp"],
                &rows,
            )
            .await
    }

    /// Highest datapoint timestamp; `None` when no rows exist
    pub async fn last_datapoint_timestamp(&self, metric: &str) -> Result<Option<NaiveDateTime>> {
        let query = format!(
            "SELECT MAX(timestamp) AS ts FROM {} WHERE metric_name = :metric",
            self.tables.datapoints
        );
        let rows = self
            .adapter
            .execute(&query, &[("metric", SqlValue::from(metric))])
            .await?;
        match rows.first() {
            Some(row) => opt_timestamp(row, "ts"),
            None => Ok(None),
        }
    }

    /// Lowest datapoint timestamp; `None` when no rows exist
    pub async fn first_datapoint_timestamp(&self, metric: &str) -> Result<Option<NaiveDateTime>> {
        let query = format!(
            "SELECT MIN(timestamp) AS ts FROM {} WHERE metric_name = :metric",
            self.tables.datapoints
        );
        let rows = self
            .adapter
            .execute(&query, &[("metric", SqlValue::from(metric))])
            .await?;
        match rows.first() {
            Some(row) => opt_timestamp(row, "ts"),
            None => Ok(None),
        }
    }

    /// Highest datapoint timestamp with a present value; `None` when empty
    pub async fn last_present_timestamp(&self, metric: &str) -> Result<Option<NaiveDateTime>> {
        let query = format!(
            "SELECT MAX(timestamp) AS ts FROM {} WHERE metric_name = :metric AND value IS NOT NULL",
            self.tables.datapoints
        );
        let rows = self
            .adapter
            .execute(&query, &[("metric", SqlValue::from(metric))])
            .await?;
        match rows.first() {
            Some(row) => opt_timestamp(row, "ts"),
            None => Ok(None),
        }
    }

    /// Highest detection timestamp for one detector stream; `None` when empty
    pub async fn last_detection_timestamp(
        &self,
        metric: &str,
        detector_hash: &str,
    ) -> Result<Option<NaiveDateTime>> {
        let query = format!(
            "SELECT MAX(timestamp) AS ts FROM {} WHERE metric_name = :metric AND detector_hash = :hash",
            self.tables.detections
        );
        let rows = self
            .adapter
            .execute(
                &query,
                &[
                    ("metric", SqlValue::from(metric)),
                    ("hash", SqlValue::from(detector_hash)),
                ],
            )
            .await?;
        match rows.first() {
            Some(row) => opt_timestamp(row, "ts"),
            None => Ok(None),
        }
    }

    /// The `count` most recent datapoints strictly before `end_exclusive`,
    /// oldest first
    pub async fn load_window(
        &self,
        metric: &str,
        end_exclusive: NaiveDateTime,
        count: usize,
    ) -> Result<Vec<WindowPoint>> {
        let query = format!(
            "SELECT timestamp, value, seasonality_data FROM {} \
             WHERE metric_name = :metric AND timestamp < :end \
             ORDER BY timestamp DESC LIMIT :count",
            self.tables.datapoints
        );
        let rows = self
            .adapter
            .execute(
                &query,
                &[
                    ("metric", SqlValue::from(metric)),
                    ("end", SqlValue::Timestamp(end_exclusive)),
                    ("count", SqlValue::Int(count as i64)),
                ],
            )
            .await?;
        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            points.push(WindowPoint {
                timestamp: column(row, "timestamp")?.as_timestamp()?,
                value: opt_f64(row, "value")?,
                seasonality: parse_seasonality(opt_text(row, "seasonality_data")?),
            });
        }
        points.reverse();
        Ok(points)
    }

    /// The most recent `count` detection rows per fingerprint, restricted
    /// to rows created after `created_after`. Used by the alert evaluator;
    /// the filter keeps historical backfill from triggering fresh alerts.
    pub async fn recent_detections(
        &self,
        metric: &str,
        detector_hashes: &[String],
        count: usize,
        created_after: NaiveDateTime,
    ) -> Result<Vec<DetectionRow>> {
        let query = format!(
            "SELECT * FROM {} \
             WHERE metric_name = :metric AND detector_hash = :hash AND created_at > :after \
             ORDER BY timestamp DESC LIMIT :count",
            self.tables.detections
        );
        let mut out = Vec::new();
        for hash in detector_hashes {
            let rows = self
                .adapter
                .execute(
                    &query,
                    &[
                        ("metric", SqlValue::from(metric)),
                        ("hash", SqlValue::from(hash.as_str())),
                        ("after", epoch_value(created_after)),
                        ("count", SqlValue::Int(count as i64)),
                    ],
                )
                .await?;
            for row in &rows {
                out.push(detection_from_row(row)?);
            }
        }
        Ok(out)
    }

    /// Whether any detector observed a genuinely non-anomalous point
    /// (no anomaly, no skip reason) after `since`. Used by the cooldown
    /// recovery check; deliberately unrestricted by `created_at`, so
    /// detections written by earlier runs count as recovery.
    pub async fn has_recovery_since(
        &self,
        metric: &str,
        detector_hashes: &[String],
        since: NaiveDateTime,
    ) -> Result<bool> {
        let query = format!(
            "SELECT COUNT(*) AS n FROM {} \
             WHERE metric_name = :metric AND detector_hash = :hash \
             AND timestamp > :since AND is_anomaly = 0 AND reason IS NULL",
            self.tables.detections
        );
        for hash in detector_hashes {
            let rows = self
                .adapter
                .execute(
                    &query,
                    &[
                        ("metric", SqlValue::from(metric)),
                        ("hash", SqlValue::from(hash.as_str())),
                        ("since", SqlValue::Timestamp(since)),
                    ],
                )
                .await?;
            let count = rows
                .first()
                .and_then(|r| r.get("n"))
                .and_then(SqlValue::as_i64)
                .unwrap_or(0);
            if count > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Full-refresh purge: all datapoints and detections for a metric
    pub async fn purge_metric(&self, metric: &str) -> Result<()> {
        let params = [("metric", SqlValue::from(metric))];
        let datapoints = self
            .adapter
            .delete(&self.tables.datapoints, "metric_name = :metric", &params)
            .await?;
        let detections = self
            .adapter
            .delete(&self.tables.detections, "metric_name = :metric", &params)
            .await?;
        debug!(metric, datapoints, detections, "purged metric state");
        Ok(())
    }

    /// Purge one detector stream (fingerprint changed or full refresh)
    pub async fn purge_detector(&self, metric: &str, detector_hash: &str) -> Result<u64> {
        self.adapter
            .delete(
                &self.tables.detections,
                "metric_name = :metric AND detector_hash = :hash",
                &[
                    ("metric", SqlValue::from(metric)),
                    ("hash", SqlValue::from(detector_hash)),
                ],
            )
            .await
    }

    pub async fn task(&self, metric: &str) -> Result<Option<TaskRow>> {
        let query = format!(
            "SELECT * FROM {} WHERE metric_name = :metric",
            self.tables.tasks
        );
        let rows = self
            .adapter
            .execute(&query, &[("metric", SqlValue::from(metric))])
            .await?;
        rows.first().map(task_from_row).transpose()
    }

    /// Take the per-metric lock. Fails with [`Error::Locked`] while another
    /// run holds a live lock; expired locks are stolen silently, `force`
    /// steals unconditionally.
    pub async fn acquire_lock(
        &self,
        metric: &str,
        ttl: Duration,
        now: NaiveDateTime,
        force: bool,
    ) -> Result<()> {
        if let Some(task) = self.task(metric).await? {
            if task.is_locked_at(now) && !force {
                return Err(Error::Locked(metric.to_string()));
            }
        }
        let mut row = SqlRow::new();
        row.insert("metric_name".into(), SqlValue::from(metric));
        row.insert("status".into(), SqlValue::Text(TaskStatus::Running.to_string()));
        row.insert("locked_at".into(), SqlValue::Timestamp(now));
        row.insert("lock_expires_at".into(), SqlValue::Timestamp(now + ttl));
        self.adapter
            .upsert(&self.tables.tasks, &["metric_name"], &[row])
            .await?;
        debug!(metric, "acquired task lock");
        Ok(())
    }

    /// Release the lock with the final run status
    pub async fn release_lock(
        &self,
        metric: &str,
        status: TaskStatus,
        error: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mut row = SqlRow::new();
        row.insert("metric_name".into(), SqlValue::from(metric));
        row.insert("status".into(), SqlValue::Text(status.to_string()));
        row.insert("locked_at".into(), SqlValue::Null);
        row.insert("lock_expires_at".into(), SqlValue::Null);
        row.insert("last_run_at".into(), SqlValue::Timestamp(now));
        row.insert("last_error".into(), SqlValue::from_opt_text(error));
        self.adapter
            .upsert(&self.tables.tasks, &["metric_name"], &[row])
            .await?;
        debug!(metric, status = %status, "released task lock");
        Ok(())
    }

    pub async fn last_alert_timestamp(&self, metric: &str) -> Result<Option<NaiveDateTime>> {
        Ok(self.task(metric).await?.and_then(|t| t.last_alert_sent))
    }

    /// Record an emitted alert: bump `alert_count`, stamp `last_alert_sent`.
    /// Called before dispatch so the cooldown gate holds even when
    /// delivery fails.
    pub async fn record_alert(&self, metric: &str, now: NaiveDateTime) -> Result<()> {
        let count = self.task(metric).await?.map(|t| t.alert_count).unwrap_or(0);
        let mut row = SqlRow::new();
        row.insert("metric_name".into(), SqlValue::from(metric));
        row.insert("last_alert_sent".into(), SqlValue::Timestamp(now));
        row.insert("alert_count".into(), SqlValue::Int(count + 1));
        self.adapter
            .upsert(&self.tables.tasks, &["metric_name"], &[row])
            .await?;
        Ok(())
    }

    /// Mirror the declared metric configuration into `_dtk_metrics`.
    /// Informational only; written on every run.
    pub async fn upsert_metric_metadata(
        &self,
        config: &MetricConfig,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mut row = SqlRow::new();
        row.insert("metric_name".into(), SqlValue::Text(config.name.clone()));
        row.insert("interval".into(), SqlValue::Text(config.interval.to_string()));
        row.insert(
            "description".into(),
            SqlValue::from_opt_text(config.description.as_deref()),
        );
        row.insert("tags".into(), SqlValue::Text(serde_json::to_string(&config.tags)?));
        row.insert("enabled".into(), SqlValue::from(config.enabled));
        row.insert(
            "alerting_enabled".into(),
            SqlValue::from(config.alerting.enabled),
        );
        row.insert("updated_at".into(), SqlValue::Timestamp(now));
        self.adapter
            .upsert(&self.tables.metrics, &["metric_name"], &[row])
            .await?;
        Ok(())
    }

    /// Total datapoint rows for a metric (used by tests and run reports)
    pub async fn count_datapoints(&self, metric: &str) -> Result<i64> {
        let query = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE metric_name = :metric",
            self.tables.datapoints
        );
        let rows = self
            .adapter
            .execute(&query, &[("metric", SqlValue::from(metric))])
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(SqlValue::as_i64)
            .unwrap_or(0))
    }

    /// Total detection rows for one detector stream
    pub async fn count_detections(&self, metric: &str, detector_hash: &str) -> Result<i64> {
        let query = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE metric_name = :metric AND detector_hash = :hash",
            self.tables.detections
        );
        let rows = self
            .adapter
            .execute(
                &query,
                &[
                    ("metric", SqlValue::from(metric)),
                    ("hash", SqlValue::from(detector_hash)),
                ],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(SqlValue::as_i64)
            .unwrap_or(0))
    }
}
