//! Slice-wise incremental load of the user query.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use dtk_common::{
    Datapoint, Error, MetricConfig, Result, SeasonalityData, SeasonalityValue,
};
use dtk_store::{column, DatabaseAdapter, InternalStore, SqlRow, SqlValue};

/// Time-range overrides for one LOAD invocation (`--from` / `--to`)
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadWindow {
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

/// Result of one LOAD step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_written: u64,
    pub slices: usize,
}

/// Runs the user query against the data connection and persists
/// datapoints through the internal store
pub struct MetricLoader {
    data: Arc<dyn DatabaseAdapter>,
    store: InternalStore,
}

impl MetricLoader {
    pub fn new(data: Arc<dyn DatabaseAdapter>, store: InternalStore) -> Self {
        MetricLoader { data, store }
    }

    /// Load `[from, to)` in slices of `loading_batch_size` intervals.
    /// Re-invoking with unchanged inputs writes the same rows; the visible
    /// datapoint set is a pure function of the query results and the grid.
    pub async fn load(
        &self,
        metric: &MetricConfig,
        window: LoadWindow,
        full_refresh: bool,
        now: NaiveDateTime,
    ) -> Result<LoadOutcome> {
        let interval = metric.interval;
        let mut outcome = LoadOutcome::default();

        if full_refresh {
            info!(metric = %metric.name, "full refresh: purging datapoints and detections");
            self.store.purge_metric(&metric.name).await?;
        }

        let configured = metric.loading_start_time.map(|t| interval.align_up(t));
        let watermark = if full_refresh {
            None
        } else {
            self.store
                .last_datapoint_timestamp(&metric.name)
                .await?
                .map(|t| interval.next(t))
        };
        let from = match window.from {
            // An explicit --from reloads that range; upserts keep it safe
            Some(explicit) => interval.align_up(explicit),
            None => match (configured, watermark) {
                (Some(c), Some(w)) => c.max(w),
                (Some(c), None) => c,
                (None, Some(w)) => w,
                (None, None) => {
                    return Err(Error::Load(format!(
                        "metric '{}' has no loading_start_time and no datapoints; pass --from",
                        metric.name
                    )))
                }
            },
        };
        // The current incomplete interval is excluded
        let to = window.to.unwrap_or_else(|| interval.align(now));
        if from >= to {
            debug!(metric = %metric.name, "nothing to load");
            return Ok(outcome);
        }

        let step = interval.span(metric.loading_batch_size);
        let mut slice_from = from;
        while slice_from < to {
            let slice_to = (slice_from + step).min(to);
            let written = self.load_slice(metric, slice_from, slice_to, now).await?;
            outcome.rows_written += written;
            outcome.slices += 1;
            debug!(
                metric = %metric.name,
                from = %slice_from,
                to = %slice_to,
                rows = written,
                "loaded slice"
            );
            slice_from = slice_to;
        }

        info!(
            metric = %metric.name,
            rows = outcome.rows_written,
            slices = outcome.slices,
            "load step finished"
        );
        Ok(outcome)
    }

    async fn load_slice(
        &self,
        metric: &MetricConfig,
        slice_from: NaiveDateTime,
        slice_to: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<u64> {
        let interval = metric.interval;
        let query = metric.resolved_query()?;
        let rows = self
            .data
            .execute(
                query,
                &[
                    ("from_date", SqlValue::Timestamp(slice_from)),
                    ("to_date", SqlValue::Timestamp(slice_to)),
                ],
            )
            .await?;

        let mut by_timestamp: BTreeMap<NaiveDateTime, (Option<f64>, SeasonalityData)> =
            BTreeMap::new();
        for row in &rows {
            let raw_timestamp = column(row, &metric.query_columns.timestamp)?.as_timestamp()?;
            let timestamp = interval.align(raw_timestamp);
            if timestamp < slice_from || timestamp >= slice_to {
                continue;
            }
            let value = metric_value(row, &metric.query_columns.metric)?;
            let mut seasonality = SeasonalityData::new();
            for name in &metric.query_columns.seasonality {
                if let Some(value) = seasonality_value(column(row, name)?) {
                    seasonality.insert(name.clone(), value);
                }
            }
            // Last row wins when several align to the same grid instant
            by_timestamp.insert(timestamp, (value, seasonality));
        }

        let mut points = Vec::new();
        for timestamp in interval.range(slice_from, slice_to) {
            let (value, mut seasonality) =
                by_timestamp.remove(&timestamp).unwrap_or((None, SeasonalityData::new()));
            for extract in &metric.seasonality_columns {
                // Query-provided columns take precedence over computed ones
                seasonality
                    .entry(extract.name.clone())
                    .or_insert_with(|| SeasonalityValue::Int(extract.extract.extract(timestamp)));
            }
            points.push(Datapoint {
                metric_name: metric.name.clone(),
                timestamp,
                value,
                seasonality_data: seasonality,
                created_at: now,
            });
        }
        self.store.upsert_datapoints(&points).await
    }
}

fn metric_value(row: &SqlRow, name: &str) -> Result<Option<f64>> {
    match column(row, name)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => s
            .parse::<f64>()
            .map(Some)
            .map_err(|_| Error::Load(format!("value column '{}' returned non-numeric '{}'", name, s))),
        value => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::Load(format!("value column '{}' is not numeric", name))),
    }
}

fn seasonality_value(value: &SqlValue) -> Option<SeasonalityValue> {
    match value {
        SqlValue::Null => None,
        SqlValue::Int(v) => Some(SeasonalityValue::Int(*v)),
        SqlValue::Float(v) if v.fract() == 0.0 => Some(SeasonalityValue::Int(*v as i64)),
        SqlValue::Float(v) => Some(SeasonalityValue::Text(v.to_string())),
        SqlValue::Text(s) => Some(SeasonalityValue::Text(s.clone())),
        SqlValue::Timestamp(t) => Some(SeasonalityValue::Text(dtk_common::format_timestamp(*t))),
    }
}
