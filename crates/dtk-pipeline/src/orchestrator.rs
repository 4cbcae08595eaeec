//! Per-metric run orchestration.

use chrono::{NaiveDateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use dtk_alert::{AlertDispatcher, AlertEvaluator, AlertEvent, ChannelDelivery};
use dtk_common::{Error, MetricConfig, Result, TaskStatus};
use dtk_detect::{build_detectors, DetectionRunner};
use dtk_loader::{LoadWindow, MetricLoader};
use dtk_store::{DatabaseAdapter, InternalStore};

/// One pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Load,
    Detect,
    Alert,
}

impl Step {
    /// The full pipeline, in execution order
    pub fn all() -> Vec<Step> {
        vec![Step::Load, Step::Detect, Step::Alert]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Load => "load",
            Step::Detect => "detect",
            Step::Alert => "alert",
        }
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "load" => Ok(Step::Load),
            "detect" => Ok(Step::Detect),
            "alert" => Ok(Step::Alert),
            other => Err(Error::Configuration(format!("unknown step '{}'", other))),
        }
    }
}

/// Parse a `--steps load,detect,alert` list, keeping pipeline order
pub fn parse_steps(raw: &str) -> Result<Vec<Step>> {
    let mut requested = Vec::new();
    for part in raw.split(',') {
        let step: Step = part.parse()?;
        if !requested.contains(&step) {
            requested.push(step);
        }
    }
    let mut steps: Vec<Step> = Step::all()
        .into_iter()
        .filter(|s| requested.contains(s))
        .collect();
    if steps.is_empty() {
        steps = Step::all();
    }
    Ok(steps)
}

/// Options for one `run` invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub steps: Vec<Step>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub full_refresh: bool,
    pub force: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            steps: Step::all(),
            from: None,
            to: None,
            full_refresh: false,
            force: false,
        }
    }
}

/// What one metric run did
#[derive(Debug, Default)]
pub struct RunReport {
    pub metric: String,
    pub rows_loaded: u64,
    pub detection_rows: u64,
    pub anomalies: u64,
    pub alert: Option<AlertEvent>,
    pub deliveries: Vec<ChannelDelivery>,
}

/// Orchestrates LOAD -> DETECT -> ALERT for one metric under the task lock
pub struct Pipeline {
    data: Arc<dyn DatabaseAdapter>,
    store: InternalStore,
    dispatcher: Arc<AlertDispatcher>,
    lock_ttl: chrono::Duration,
}

impl Pipeline {
    pub fn new(
        data: Arc<dyn DatabaseAdapter>,
        store: InternalStore,
        dispatcher: Arc<AlertDispatcher>,
        lock_timeout_seconds: u64,
    ) -> Self {
        Pipeline {
            data,
            store,
            dispatcher,
            lock_ttl: chrono::Duration::seconds(lock_timeout_seconds as i64),
        }
    }

    pub fn store(&self) -> &InternalStore {
        &self.store
    }

    /// Run the selected steps for one metric. Fails with [`Error::Locked`]
    /// while another run holds a live lock (unless `force`); any step
    /// failure aborts subsequent steps and releases the lock as `failed`.
    pub async fn run_metric(
        &self,
        metric: &MetricConfig,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let run_started_at = Utc::now().naive_utc();
        self.store.ensure_tables().await?;
        self.store
            .acquire_lock(&metric.name, self.lock_ttl, run_started_at, options.force)
            .await?;
        info!(
            metric = %metric.name,
            steps = %options.steps.iter().map(Step::as_str).collect::<Vec<_>>().join(","),
            full_refresh = options.full_refresh,
            "metric run started"
        );

        let result = self.run_steps(metric, options, run_started_at).await;

        // Mirror the declared configuration on every run, failed ones
        // included; the table is informational, so a write failure is
        // logged rather than masking the step result.
        if let Err(metadata_error) = self
            .store
            .upsert_metric_metadata(metric, Utc::now().naive_utc())
            .await
        {
            warn!(
                metric = %metric.name,
                error = %metadata_error,
                "failed to mirror metric metadata"
            );
        }

        let finished_at = Utc::now().naive_utc();
        match result {
            Ok(report) => {
                self.store
                    .release_lock(&metric.name, TaskStatus::Success, None, finished_at)
                    .await?;
                info!(
                    metric = %metric.name,
                    rows_loaded = report.rows_loaded,
                    detections = report.detection_rows,
                    anomalies = report.anomalies,
                    alerted = report.alert.is_some(),
                    "metric run finished"
                );
                Ok(report)
            }
            Err(step_error) => {
                error!(metric = %metric.name, error = %step_error, "metric run failed");
                if let Err(release_error) = self
                    .store
                    .release_lock(
                        &metric.name,
                        TaskStatus::Failed,
                        Some(&step_error.to_string()),
                        finished_at,
                    )
                    .await
                {
                    // The lock TTL still recovers the task if this write is lost
                    warn!(
                        metric = %metric.name,
                        error = %release_error,
                        "failed to record run failure"
                    );
                }
                Err(step_error)
            }
        }
    }

    async fn run_steps(
        &self,
        metric: &MetricConfig,
        options: &RunOptions,
        run_started_at: NaiveDateTime,
    ) -> Result<RunReport> {
        let mut report = RunReport {
            metric: metric.name.clone(),
            ..RunReport::default()
        };

        for step in &options.steps {
            match step {
                Step::Load => {
                    let loader = MetricLoader::new(Arc::clone(&self.data), self.store.clone());
                    let window = LoadWindow {
                        from: options.from,
                        to: options.to,
                    };
                    let outcome = loader
                        .load(metric, window, options.full_refresh, Utc::now().naive_utc())
                        .await?;
                    report.rows_loaded = outcome.rows_written;
                }
                Step::Detect => {
                    let runner = DetectionRunner::new(self.store.clone());
                    let outcome = runner
                        .detect(metric, options.full_refresh, Utc::now().naive_utc())
                        .await?;
                    report.detection_rows = outcome.rows_written;
                    report.anomalies = outcome.anomalies;
                }
                Step::Alert => {
                    let detectors = build_detectors(&metric.detectors)?;
                    let pairs: Vec<(String, String)> = detectors
                        .iter()
                        .map(|d| (d.fingerprint(), d.name().to_string()))
                        .collect();
                    let evaluator = AlertEvaluator::new(self.store.clone());
                    if let Some(event) = evaluator
                        .evaluate(metric, &pairs, run_started_at, Utc::now().naive_utc())
                        .await?
                    {
                        let deliveries = self.dispatcher.dispatch(&metric.alerting, &event).await?;
                        report.alert = Some(event);
                        report.deliveries = deliveries;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_lists_in_pipeline_order() {
        let steps = parse_steps("alert,load").unwrap();
        assert_eq!(steps, vec![Step::Load, Step::Alert]);
        let steps = parse_steps("load,detect,alert").unwrap();
        assert_eq!(steps, Step::all());
        let steps = parse_steps("detect,detect").unwrap();
        assert_eq!(steps, vec![Step::Detect]);
        assert!(parse_steps("load,teleport").is_err());
    }
}
