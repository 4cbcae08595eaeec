//! Incremental detection driver.
//!
//! For every configured detector the runner resumes from that detector's
//! own watermark, walks forward in batches of `detection_batch_size`
//! intervals, and judges each batch against a trailing history window.
//! Running twice in succession writes zero new rows.

use chrono::NaiveDateTime;
use tracing::{debug, info};

use dtk_common::{DetectionRow, MetricConfig, Result, SeasonalityData};
use dtk_store::InternalStore;

use crate::detectors::{build_detectors, Detector};
use crate::preprocess::{self, InputType};

/// Result of one DETECT step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectOutcome {
    pub rows_written: u64,
    pub anomalies: u64,
}

/// Drives detectors over newly loaded datapoints
pub struct DetectionRunner {
    store: InternalStore,
}

impl DetectionRunner {
    pub fn new(store: InternalStore) -> Self {
        DetectionRunner { store }
    }

    /// Run every configured detector incrementally; returns totals across
    /// detectors
    pub async fn detect(
        &self,
        metric: &MetricConfig,
        full_refresh: bool,
        now: NaiveDateTime,
    ) -> Result<DetectOutcome> {
        let detectors = build_detectors(&metric.detectors)?;
        let mut outcome = DetectOutcome::default();
        if detectors.is_empty() {
            debug!(metric = %metric.name, "no detectors configured");
            return Ok(outcome);
        }

        let interval = metric.interval;
        let Some(last_datapoint) = self.store.last_datapoint_timestamp(&metric.name).await? else {
            debug!(metric = %metric.name, "no datapoints to detect on");
            return Ok(outcome);
        };
        // Judge through the last datapoint inclusive
        let end_exclusive = interval.next(last_datapoint);
        let first_datapoint = self.store.first_datapoint_timestamp(&metric.name).await?;

        for detector in &detectors {
            let detector_outcome = self
                .run_detector(
                    metric,
                    detector,
                    full_refresh,
                    first_datapoint,
                    end_exclusive,
                    now,
                )
                .await?;
            outcome.rows_written += detector_outcome.rows_written;
            outcome.anomalies += detector_outcome.anomalies;
        }

        info!(
            metric = %metric.name,
            rows = outcome.rows_written,
            anomalies = outcome.anomalies,
            "detection step finished"
        );
        Ok(outcome)
    }

    async fn run_detector(
        &self,
        metric: &MetricConfig,
        detector: &Detector,
        full_refresh: bool,
        first_datapoint: Option<NaiveDateTime>,
        end_exclusive: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<DetectOutcome> {
        let interval = metric.interval;
        let detector_hash = detector.fingerprint();
        let mut outcome = DetectOutcome::default();

        if full_refresh {
            self.store.purge_detector(&metric.name, &detector_hash).await?;
        }

        let resume = self
            .store
            .last_detection_timestamp(&metric.name, &detector_hash)
            .await?
            .map(|t| interval.next(t));
        let configured = metric.loading_start_time.map(|t| interval.align_up(t));
        let candidate = match (configured, resume) {
            (Some(c), Some(r)) => Some(c.max(r)),
            (Some(c), None) => Some(c),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };
        // Detection can never precede the first datapoint
        let start = match (candidate, first_datapoint) {
            (Some(s), Some(first)) => s.max(first),
            (None, Some(first)) => first,
            _ => return Ok(outcome),
        };
        if start >= end_exclusive {
            debug!(metric = %metric.name, detector = %detector_hash, "detector is up to date");
            return Ok(outcome);
        }

        let step = interval.span(metric.detection_batch_size);
        let mut batch_from = start;
        while batch_from < end_exclusive {
            let batch_to = (batch_from + step).min(end_exclusive);
            let batch_len = interval.count_between(batch_from, batch_to);
            let need = detector.window_size() + batch_len;

            let rows = self.store.load_window(&metric.name, batch_to, need).await?;
            let Some(start_index) = rows.iter().position(|r| r.timestamp >= batch_from) else {
                batch_from = batch_to;
                continue;
            };

            let raw: Vec<Option<f64>> = rows.iter().map(|r| r.value).collect();
            let seasonality: Vec<SeasonalityData> =
                rows.iter().map(|r| r.seasonality.clone()).collect();
            let pre = detector.preprocessing();
            let processed = preprocess::apply(&raw, pre.input_type, pre.smoothing_window);

            let points = detector.detect(&processed, &seasonality, start_index);
            let mut detections = Vec::with_capacity(points.len());
            for point in points {
                let timestamp = rows[point.index].timestamp;
                if timestamp < batch_from || timestamp >= batch_to {
                    continue;
                }
                let mut metadata = point.metadata;
                if pre.input_type != InputType::Raw {
                    metadata["processed_value"] =
                        serde_json::to_value(processed[point.index]).unwrap_or_default();
                }
                if point.is_anomaly {
                    outcome.anomalies += 1;
                }
                detections.push(DetectionRow {
                    metric_name: metric.name.clone(),
                    detector_hash: detector_hash.clone(),
                    timestamp,
                    value: raw[point.index],
                    is_anomaly: point.is_anomaly,
                    confidence_lower: point.confidence_lower,
                    confidence_upper: point.confidence_upper,
                    direction: point.direction,
                    severity: point.severity,
                    metadata,
                    reason: point.reason,
                    created_at: now,
                });
            }
            outcome.rows_written += self.store.upsert_detections(&detections).await?;
            debug!(
                metric = %metric.name,
                detector = %detector_hash,
                from = %batch_from,
                to = %batch_to,
                rows = detections.len(),
                "detected batch"
            );
            batch_from = batch_to;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtk_common::{parse_timestamp, Datapoint, SeasonalityData};
    use dtk_store::{SqliteAdapter, StoreTables};
    use std::sync::Arc;

    const METRIC_YAML: &str = r#"
name: events
interval: 1min
query: SELECT 1
detectors:
  - type: mad
    params:
      window_size: 10
      min_samples: 3
detection_batch_size: 7
"#;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    async fn store() -> InternalStore {
        let adapter = SqliteAdapter::in_memory().await.unwrap();
        let store = InternalStore::new(
            Arc::new(adapter),
            StoreTables::resolve(None, &Default::default()),
        );
        store.ensure_tables().await.unwrap();
        store
    }

    async fn seed(store: &InternalStore, metric: &str, values: &[Option<f64>]) {
        let base = ts("2024-01-01 00:00:00");
        let points: Vec<Datapoint> = values
            .iter()
            .enumerate()
            .map(|(i, value)| Datapoint {
                metric_name: metric.to_string(),
                timestamp: base + chrono::Duration::minutes(i as i64),
                value: *value,
                seasonality_data: SeasonalityData::new(),
                created_at: base,
            })
            .collect();
        store.upsert_datapoints(&points).await.unwrap();
    }

    #[tokio::test]
    async fn detects_incrementally_and_idempotently() {
        let store = store().await;
        let metric = MetricConfig::from_yaml_str(METRIC_YAML).unwrap();
        let mut values: Vec<Option<f64>> = vec![Some(10.0); 20];
        values[15] = Some(100.0);
        seed(&store, "events", &values).await;

        let runner = DetectionRunner::new(store.clone());
        let now = ts("2024-01-01 01:00:00");
        let first = runner.detect(&metric, false, now).await.unwrap();
        assert_eq!(first.rows_written, 20);
        assert_eq!(first.anomalies, 1);

        // Second run: nothing new
        let second = runner.detect(&metric, false, now).await.unwrap();
        assert_eq!(second, DetectOutcome::default());

        let hash = build_detectors(&metric.detectors).unwrap()[0].fingerprint();
        assert_eq!(store.count_detections("events", &hash).await.unwrap(), 20);

        // New datapoints extend the stream without rewriting history
        let mut extended = values.clone();
        extended.extend([Some(10.0), Some(10.0)]);
        seed(&store, "events", &extended).await;
        let third = runner.detect(&metric, false, now).await.unwrap();
        assert_eq!(third.rows_written, 2);
        assert_eq!(store.count_detections("events", &hash).await.unwrap(), 22);
    }

    #[tokio::test]
    async fn anomaly_lands_on_the_spike_timestamp() {
        let store = store().await;
        let metric = MetricConfig::from_yaml_str(METRIC_YAML).unwrap();
        let mut values: Vec<Option<f64>> = vec![Some(10.0); 20];
        values[15] = Some(100.0);
        seed(&store, "events", &values).await;

        DetectionRunner::new(store.clone())
            .detect(&metric, false, ts("2024-01-01 01:00:00"))
            .await
            .unwrap();

        let hash = build_detectors(&metric.detectors).unwrap()[0].fingerprint();
        let rows = store
            .recent_detections("events", &[hash], 50, ts("2023-01-01 00:00:00"))
            .await
            .unwrap();
        let anomalies: Vec<_> = rows.iter().filter(|r| r.is_anomaly).collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].timestamp, ts("2024-01-01 00:15:00"));
        assert_eq!(anomalies[0].value, Some(100.0));
        assert_eq!(anomalies[0].metadata["detector"], "mad");
    }

    #[tokio::test]
    async fn gap_rows_get_missing_data_reason() {
        let store = store().await;
        let metric = MetricConfig::from_yaml_str(METRIC_YAML).unwrap();
        let mut values: Vec<Option<f64>> = vec![Some(5.0); 10];
        values[7] = None;
        seed(&store, "events", &values).await;

        DetectionRunner::new(store.clone())
            .detect(&metric, false, ts("2024-01-01 01:00:00"))
            .await
            .unwrap();

        let hash = build_detectors(&metric.detectors).unwrap()[0].fingerprint();
        let rows = store
            .recent_detections("events", &[hash], 50, ts("2023-01-01 00:00:00"))
            .await
            .unwrap();
        let gap = rows
            .iter()
            .find(|r| r.timestamp == ts("2024-01-01 00:07:00"))
            .unwrap();
        assert!(!gap.is_anomaly);
        assert_eq!(gap.reason.as_deref(), Some(dtk_common::REASON_MISSING_DATA));
        // Early rows below min_samples get insufficient_data
        let warmup = rows
            .iter()
            .find(|r| r.timestamp == ts("2024-01-01 00:00:00"))
            .unwrap();
        assert_eq!(
            warmup.reason.as_deref(),
            Some(dtk_common::REASON_INSUFFICIENT_DATA)
        );
    }

    #[tokio::test]
    async fn full_refresh_regenerates_the_same_rows() {
        let store = store().await;
        let metric = MetricConfig::from_yaml_str(METRIC_YAML).unwrap();
        let mut values: Vec<Option<f64>> = vec![Some(10.0); 30];
        values[25] = Some(90.0);
        seed(&store, "events", &values).await;

        let runner = DetectionRunner::new(store.clone());
        let now = ts("2024-01-01 01:00:00");
        let first = runner.detect(&metric, false, now).await.unwrap();
        let refreshed = runner.detect(&metric, true, now).await.unwrap();
        assert_eq!(first, refreshed);

        let hash = build_detectors(&metric.detectors).unwrap()[0].fingerprint();
        assert_eq!(store.count_detections("events", &hash).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn respects_configured_start_time() {
        let store = store().await;
        let yaml = format!("{}loading_start_time: \"2024-01-01 00:10:00\"\n", METRIC_YAML);
        let metric = MetricConfig::from_yaml_str(&yaml).unwrap();
        seed(&store, "events", &vec![Some(1.0); 20]).await;

        DetectionRunner::new(store.clone())
            .detect(&metric, false, ts("2024-01-01 01:00:00"))
            .await
            .unwrap();

        let hash = build_detectors(&metric.detectors).unwrap()[0].fingerprint();
        assert_eq!(store.count_detections("events", &hash).await.unwrap(), 10);
    }
}
