//! Alert decision logic.
//!
//! Walks the most recent detection rows per fingerprint, aggregates across
//! detectors, and enforces consecutive-anomaly confirmation plus the
//! cooldown gate. At most one alert event comes out of an evaluation; on
//! emission the alert is recorded before the caller dispatches, so the
//! cooldown holds even when delivery fails.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::debug;

use dtk_common::{
    AlertDirection, AlertPolicy, DetectionRow, Direction, MetricConfig, Result,
};
use dtk_store::InternalStore;

use crate::event::{render_local_time, AlertEvent, AlertKind};

/// Evaluates a metric's alert policy against fresh detections
pub struct AlertEvaluator {
    store: InternalStore,
}

fn jointly_anomalous(rows: &[&DetectionRow], policy: &AlertPolicy) -> bool {
    let firing: Vec<&DetectionRow> = rows.iter().copied().filter(|r| r.is_anomaly).collect();
    if firing.len() < policy.min_detectors {
        return false;
    }
    match policy.direction {
        AlertDirection::Any => true,
        AlertDirection::Same => firing.iter().all(|r| r.direction == firing[0].direction),
        AlertDirection::Up => firing.iter().all(|r| r.direction == Direction::Above),
        AlertDirection::Down => firing.iter().all(|r| r.direction == Direction::Below),
    }
}

impl AlertEvaluator {
    pub fn new(store: InternalStore) -> Self {
        AlertEvaluator { store }
    }

    /// Produce at most one alert event. `detectors` pairs each fingerprint
    /// with its display name; only detections created after
    /// `run_started_at` are considered, which keeps historical backfill
    /// from firing fresh alerts.
    pub async fn evaluate(
        &self,
        metric: &MetricConfig,
        detectors: &[(String, String)],
        run_started_at: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Option<AlertEvent>> {
        let policy = &metric.alerting;
        if !policy.enabled {
            return Ok(None);
        }

        // Cooldown gate, cheapest check first
        let last_alert = self.store.last_alert_timestamp(&metric.name).await?;
        let in_cooldown = match (policy.alert_cooldown, last_alert) {
            (Some(cooldown), Some(last)) => last + cooldown.duration() > now,
            _ => false,
        };
        let hashes: Vec<String> = detectors.iter().map(|(hash, _)| hash.clone()).collect();
        if in_cooldown {
            if !policy.cooldown_reset_on_recovery {
                debug!(metric = %metric.name, "alert suppressed by cooldown");
                return Ok(None);
            }
            // Recovery scans the whole detection stream after the last
            // alert, not just this run's fresh rows: a normal point
            // recorded by an earlier cycle still re-arms the alert.
            let recovered = match last_alert {
                Some(last) => {
                    self.store
                        .has_recovery_since(&metric.name, &hashes, last)
                        .await?
                }
                None => false,
            };
            if !recovered {
                debug!(metric = %metric.name, "cooldown active and no recovery observed");
                return Ok(None);
            }
        }

        let rows = self
            .store
            .recent_detections(
                &metric.name,
                &hashes,
                policy.consecutive_anomalies + 1,
                run_started_at,
            )
            .await?;

        if let Some(event) = self.evaluate_anomaly(metric, detectors, &rows)? {
            self.store.record_alert(&metric.name, now).await?;
            return Ok(Some(event));
        }

        if policy.no_data_alert {
            if let Some(event) = self.evaluate_no_data(metric, now).await? {
                self.store.record_alert(&metric.name, now).await?;
                return Ok(Some(event));
            }
        }

        Ok(None)
    }

    fn evaluate_anomaly(
        &self,
        metric: &MetricConfig,
        detectors: &[(String, String)],
        rows: &[DetectionRow],
    ) -> Result<Option<AlertEvent>> {
        let policy = &metric.alerting;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut by_timestamp: BTreeMap<NaiveDateTime, Vec<&DetectionRow>> = BTreeMap::new();
        for row in rows {
            by_timestamp.entry(row.timestamp).or_default().push(row);
        }
        let timestamps: Vec<NaiveDateTime> = by_timestamp.keys().rev().copied().collect();

        // Trailing run of contiguous, jointly anomalous grid instants
        let mut run = 0usize;
        for (i, timestamp) in timestamps.iter().enumerate() {
            if i > 0 && timestamps[i - 1] - *timestamp != metric.interval.duration() {
                break;
            }
            if jointly_anomalous(&by_timestamp[timestamp], policy) {
                run += 1;
            } else {
                break;
            }
        }
        if run < policy.consecutive_anomalies {
            return Ok(None);
        }

        let latest = timestamps[0];
        let firing: Vec<&DetectionRow> = by_timestamp[&latest]
            .iter()
            .copied()
            .filter(|r| r.is_anomaly)
            .collect();
        let Some(best) = firing.iter().max_by(|a, b| {
            a.severity
                .partial_cmp(&b.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return Ok(None);
        };
        let detector_name = detectors
            .iter()
            .find(|(hash, _)| *hash == best.detector_hash)
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| best.detector_hash.clone());

        Ok(Some(AlertEvent {
            id: AlertEvent::new_id(),
            kind: AlertKind::Anomaly,
            metric_name: metric.name.clone(),
            timestamp: latest,
            local_time: render_local_time(latest, policy.timezone.as_deref())?,
            value: best.value,
            confidence_lower: best.confidence_lower,
            confidence_upper: best.confidence_upper,
            direction: best.direction,
            severity: best.severity,
            detector_name,
            consecutive_count: run,
        }))
    }

    async fn evaluate_no_data(
        &self,
        metric: &MetricConfig,
        now: NaiveDateTime,
    ) -> Result<Option<AlertEvent>> {
        let policy = &metric.alerting;
        let interval = metric.interval;
        let expected = interval.align(now);

        let (reference, missing) = match self.store.last_present_timestamp(&metric.name).await? {
            Some(last) => (last, interval.count_between(last, expected)),
            None => match self.store.first_datapoint_timestamp(&metric.name).await? {
                Some(first) => (first, interval.count_between(first, expected) + 1),
                None => return Ok(None),
            },
        };
        if missing <= policy.consecutive_anomalies {
            return Ok(None);
        }

        debug!(metric = %metric.name, missing, "no data past the alert threshold");
        Ok(Some(AlertEvent {
            id: AlertEvent::new_id(),
            kind: AlertKind::NoData,
            metric_name: metric.name.clone(),
            timestamp: reference,
            local_time: render_local_time(reference, policy.timezone.as_deref())?,
            value: None,
            confidence_lower: None,
            confidence_upper: None,
            direction: Direction::None,
            severity: 0.0,
            detector_name: "no_data".to_string(),
            consecutive_count: missing,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtk_common::{parse_timestamp, Datapoint, SeasonalityData};
    use dtk_store::{SqliteAdapter, StoreTables};
    use std::sync::Arc;

    const BASE_YAML: &str = r#"
name: orders
interval: 1min
query: SELECT 1
"#;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    fn metric(alerting: &str) -> MetricConfig {
        MetricConfig::from_yaml_str(&format!("{}alerting:\n{}", BASE_YAML, alerting)).unwrap()
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

    const RUN_START: &str = "2024-01-01 09:59:00";
    const CREATED: &str = "2024-01-01 10:30:00";

    fn detection(
        hash: &str,
        when: &str,
        anomaly: bool,
        direction: Direction,
    ) -> DetectionRow {
        DetectionRow {
            metric_name: "orders".to_string(),
            detector_hash: hash.to_string(),
            timestamp: ts(when),
            value: Some(100.0),
            is_anomaly: anomaly,
            confidence_lower: Some(8.0),
            confidence_upper: Some(12.0),
            direction,
            severity: if anomaly { 9.0 } else { 0.0 },
            metadata: serde_json::Value::Null,
            reason: None,
            created_at: ts(CREATED),
        }
    }

    /// Seed one detector stream from a +/-/. pattern, one minute apart,
    /// ending at 10:10 ('+' above, '-' below, '.' normal)
    async fn seed_pattern(store: &InternalStore, hash: &str, pattern: &str) {
        let mut rows = Vec::new();
        let count = pattern.chars().count();
        for (i, c) in pattern.chars().enumerate() {
            let when = ts("2024-01-01 10:10:00")
                - chrono::Duration::minutes((count - 1 - i) as i64);
            let (anomaly, direction) = match c {
                '+' => (true, Direction::Above),
                '-' => (true, Direction::Below),
                _ => (false, Direction::None),
            };
            rows.push(DetectionRow {
                timestamp: when,
                ..detection(hash, "2024-01-01 10:10:00", anomaly, direction)
            });
        }
        store.upsert_detections(&rows).await.unwrap();
    }

    fn pair(hash: &str, name: &str) -> Vec<(String, String)> {
        vec![(hash.to_string(), name.to_string())]
    }

    #[tokio::test]
    async fn single_spike_does_not_confirm() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 3\n");
        seed_pattern(&store, "mad|{}", "....+.").await;

        let event = AlertEvaluator::new(store)
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn three_in_a_row_confirms_once() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 3\n");
        seed_pattern(&store, "mad|{}", ".+.+++").await;

        let evaluator = AlertEvaluator::new(store.clone());
        let event = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap()
            .expect("alert should fire");
        assert_eq!(event.kind, AlertKind::Anomaly);
        assert_eq!(event.timestamp, ts("2024-01-01 10:10:00"));
        assert_eq!(event.consecutive_count, 3);
        assert_eq!(event.direction, Direction::Above);
        assert_eq!(event.detector_name, "mad");

        // Recording happened: task bookkeeping updated
        let task = store.task("orders").await.unwrap().unwrap();
        assert_eq!(task.alert_count, 1);
        assert_eq!(task.last_alert_sent, Some(ts("2024-01-01 10:11:00")));
    }

    #[tokio::test]
    async fn interrupted_run_does_not_confirm() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 3\n");
        seed_pattern(&store, "mad|{}", "+++.++").await;

        let event = AlertEvaluator::new(store)
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn stale_detections_never_alert() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 3\n");
        seed_pattern(&store, "mad|{}", "++++++").await;

        // Run started after the detections were created: nothing is fresh
        let event = AlertEvaluator::new(store)
            .evaluate(
                &metric,
                &pair("mad|{}", "mad"),
                ts("2024-01-01 11:00:00"),
                ts("2024-01-01 11:01:00"),
            )
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn disabled_policy_never_alerts() {
        let store = store().await;
        let metric = metric("  enabled: false\n  consecutive_anomalies: 1\n");
        seed_pattern(&store, "mad|{}", "++++++").await;

        let event = AlertEvaluator::new(store)
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn min_detectors_and_direction_agreement() {
        let detectors = vec![
            ("mad|{}".to_string(), "mad".to_string()),
            ("z_score|{}".to_string(), "z_score".to_string()),
        ];
        let policy = "  consecutive_anomalies: 1\n  min_detectors: 2\n  direction: same\n";

        // Only one detector fires: no alert
        let store_a = store().await;
        seed_pattern(&store_a, "mad|{}", ".+").await;
        seed_pattern(&store_a, "z_score|{}", "..").await;
        let event = AlertEvaluator::new(store_a)
            .evaluate(&metric(policy), &detectors, ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_none());

        // Both fire above: alert
        let store_b = store().await;
        seed_pattern(&store_b, "mad|{}", ".+").await;
        seed_pattern(&store_b, "z_score|{}", ".+").await;
        let event = AlertEvaluator::new(store_b)
            .evaluate(&metric(policy), &detectors, ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_some());

        // Disagreeing directions: no alert
        let store_c = store().await;
        seed_pattern(&store_c, "mad|{}", ".+").await;
        seed_pattern(&store_c, "z_score|{}", ".-").await;
        let event = AlertEvaluator::new(store_c)
            .evaluate(&metric(policy), &detectors, ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn direction_up_rejects_below() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 1\n  direction: up\n");
        seed_pattern(&store, "mad|{}", ".-").await;

        let event = AlertEvaluator::new(store)
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn cooldown_suppresses_then_releases() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 1\n  alert_cooldown: 30min\n");
        let evaluator = AlertEvaluator::new(store.clone());
        seed_pattern(&store, "mad|{}", "++++++").await;

        // First alert fires at 10:11
        let first = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:11:00"))
            .await
            .unwrap();
        assert!(first.is_some());

        // Ten minutes later the same anomaly stays silent
        let second = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:21:00"))
            .await
            .unwrap();
        assert!(second.is_none());

        // After the cooldown expires it fires again
        let third = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:41:01"))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn recovery_resets_the_cooldown() {
        let store = store().await;
        let metric = metric(
            "  consecutive_anomalies: 1\n  alert_cooldown: 30min\n  cooldown_reset_on_recovery: true\n",
        );
        let evaluator = AlertEvaluator::new(store.clone());

        // Alert at 10:05 (pattern ending then)
        let mut rows = vec![
            detection("mad|{}", "2024-01-01 10:05:00", true, Direction::Above),
        ];
        store.upsert_detections(&rows).await.unwrap();
        let first = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:05:30"))
            .await
            .unwrap();
        assert!(first.is_some());

        // A normal point at 10:06, then an anomaly at 10:07: despite the
        // cooldown, recovery re-arms the alert
        rows = vec![
            detection("mad|{}", "2024-01-01 10:06:00", false, Direction::None),
            detection("mad|{}", "2024-01-01 10:07:00", true, Direction::Above),
        ];
        store.upsert_detections(&rows).await.unwrap();
        let second = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:07:30"))
            .await
            .unwrap();
        assert!(second.is_some());

        // Without a recovery point in between, the cooldown still holds
        rows = vec![detection("mad|{}", "2024-01-01 10:08:00", true, Direction::Above)];
        store.upsert_detections(&rows).await.unwrap();
        let third = evaluator
            .evaluate(&metric, &pair("mad|{}", "mad"), ts(RUN_START), ts("2024-01-01 10:08:30"))
            .await
            .unwrap();
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn recovery_recorded_by_an_earlier_run_still_counts() {
        let store = store().await;
        let metric = metric(
            "  consecutive_anomalies: 1\n  alert_cooldown: 30min\n  cooldown_reset_on_recovery: true\n",
        );
        let evaluator = AlertEvaluator::new(store.clone());
        store
            .record_alert("orders", ts("2024-01-01 10:05:30"))
            .await
            .unwrap();

        // The recovery point was written by a previous cycle...
        store
            .upsert_detections(&[DetectionRow {
                timestamp: ts("2024-01-01 10:06:00"),
                created_at: ts("2024-01-01 10:06:30"),
                ..detection("mad|{}", "2024-01-01 10:06:00", false, Direction::None)
            }])
            .await
            .unwrap();
        // ...while only the new anomaly is fresh in this run
        store
            .upsert_detections(&[DetectionRow {
                created_at: ts("2024-01-01 10:07:30"),
                ..detection("mad|{}", "2024-01-01 10:07:00", true, Direction::Above)
            }])
            .await
            .unwrap();

        let event = evaluator
            .evaluate(
                &metric,
                &pair("mad|{}", "mad"),
                ts("2024-01-01 10:07:00"),
                ts("2024-01-01 10:07:45"),
            )
            .await
            .unwrap();
        assert!(
            event.is_some(),
            "stale recovery rows must still re-arm the cooldown"
        );
    }

    #[tokio::test]
    async fn no_data_alert_after_n_missing_intervals() {
        let store = store().await;
        let metric = metric("  consecutive_anomalies: 3\n  no_data_alert: true\n");
        let evaluator = AlertEvaluator::new(store.clone());

        // Data present through 10:00, gap rows afterwards
        let mut points = Vec::new();
        for i in 0..=5 {
            points.push(Datapoint {
                metric_name: "orders".to_string(),
                timestamp: ts("2024-01-01 10:00:00") + chrono::Duration::minutes(i),
                value: if i == 0 { Some(10.0) } else { None },
                seasonality_data: SeasonalityData::new(),
                created_at: ts("2024-01-01 10:06:00"),
            });
        }
        store.upsert_datapoints(&points).await.unwrap();

        // Only two intervals missing: quiet
        let early = evaluator
            .evaluate(&metric, &[], ts(RUN_START), ts("2024-01-01 10:02:30"))
            .await
            .unwrap();
        assert!(early.is_none());

        // Five intervals missing: no-data alert
        let event = evaluator
            .evaluate(&metric, &[], ts(RUN_START), ts("2024-01-01 10:05:30"))
            .await
            .unwrap()
            .expect("no-data alert should fire");
        assert_eq!(event.kind, AlertKind::NoData);
        assert_eq!(event.timestamp, ts("2024-01-01 10:00:00"));
        assert_eq!(event.consecutive_count, 5);
        assert_eq!(event.detector_name, "no_data");
    }
}
