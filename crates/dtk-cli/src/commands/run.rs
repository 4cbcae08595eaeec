//! `dtk run`: execute the pipeline for selected metrics.

use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use dtk_alert::{render_local_time, AlertDispatcher};
use dtk_common::{parse_timestamp, Error, MetricConfig, ProfileConfig, Result};
use dtk_detect::build_detectors;
use dtk_pipeline::{parse_steps, Pipeline, RunOptions, Step};
use dtk_store::{DatabaseAdapter, InternalStore, SqliteAdapter, StoreTables};

use crate::project::Project;
use crate::selector;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Metric selectors: exact name, metric-file glob, or tag:<name>.
    /// Empty selects every enabled metric.
    #[arg(long = "select", short = 's')]
    pub select: Vec<String>,

    /// Selectors to exclude from the selection
    #[arg(long = "exclude")]
    pub exclude: Vec<String>,

    /// Comma-separated subset of load,detect,alert (default: all)
    #[arg(long)]
    pub steps: Option<String>,

    /// Load range start, e.g. "2024-01-01" or "2024-01-01 06:00:00"
    #[arg(long)]
    pub from: Option<String>,

    /// Load range end (exclusive)
    #[arg(long)]
    pub to: Option<String>,

    /// Purge and regenerate all datapoints and detections first
    #[arg(long)]
    pub full_refresh: bool,

    /// Steal a live task lock (unsafe: may race another process)
    #[arg(long)]
    pub force: bool,

    /// Profile name from the profiles file
    #[arg(long)]
    pub profile: Option<String>,
}

fn parse_cli_timestamp(raw: &str, flag: &str) -> Result<chrono::NaiveDateTime> {
    parse_timestamp(raw)
        .map_err(|_| Error::Configuration(format!("{}: unrecognized timestamp '{}'", flag, raw)))
}

async fn connect(project_root: &Path, profile: &ProfileConfig) -> Result<Arc<SqliteAdapter>> {
    if profile.kind != "sqlite" {
        return Err(Error::Configuration(format!(
            "unsupported profile type '{}' (this build ships the sqlite adapter)",
            profile.kind
        )));
    }
    let database = profile.database.as_deref().ok_or_else(|| {
        Error::Configuration("sqlite profile requires a database path".to_string())
    })?;
    let path = if Path::new(database).is_absolute() {
        database.to_string()
    } else {
        project_root.join(database).display().to_string()
    };
    let adapter = SqliteAdapter::connect(
        &path,
        Duration::from_secs(profile.query_timeout_seconds),
    )
    .await?;
    Ok(Arc::new(adapter))
}

/// Fail fast on anything a run would only discover mid-pipeline
fn validate(project: &Project, metrics: &[&MetricConfig]) -> Result<()> {
    for metric in metrics {
        build_detectors(&metric.detectors)?;
        for channel in &metric.alerting.channels {
            project.profiles.channel(channel)?;
        }
        if let Some(timezone) = &metric.alerting.timezone {
            render_local_time(chrono::Utc::now().naive_utc(), Some(timezone))?;
        }
    }
    Ok(())
}

pub async fn execute(project_root: &Path, args: &RunArgs) -> Result<i32> {
    let project = Project::load(project_root)?;
    let (profile_name, profile) = project.profiles.resolve_profile(args.profile.as_deref())?;

    let metrics = selector::select(&project.metrics, &args.select, &args.exclude, &project.root)?;
    if metrics.is_empty() {
        warn!("no enabled metrics matched the selection");
        return Ok(0);
    }
    validate(&project, &metrics)?;

    let options = RunOptions {
        steps: match &args.steps {
            Some(raw) => parse_steps(raw)?,
            None => Step::all(),
        },
        from: args
            .from
            .as_deref()
            .map(|raw| parse_cli_timestamp(raw, "--from"))
            .transpose()?,
        to: args
            .to
            .as_deref()
            .map(|raw| parse_cli_timestamp(raw, "--to"))
            .transpose()?,
        full_refresh: args.full_refresh,
        force: args.force,
    };

    let adapter = connect(&project.root, profile).await?;
    let dispatcher = Arc::new(AlertDispatcher::new(project.profiles.alert_channels.clone())?);

    info!(
        profile = profile_name,
        metrics = metrics.len(),
        "starting run"
    );
    let mut failed = 0usize;
    for metric in &metrics {
        let tables = StoreTables::resolve(profile.internal_schema.as_deref(), &metric.tables);
        let store = InternalStore::new(
            Arc::clone(&adapter) as Arc<dyn DatabaseAdapter>,
            tables,
        );
        let pipeline = Pipeline::new(
            Arc::clone(&adapter) as Arc<dyn DatabaseAdapter>,
            store,
            Arc::clone(&dispatcher),
            profile.lock_timeout_seconds,
        );
        // One metric's failure never aborts the rest of the batch
        match pipeline.run_metric(metric, &options).await {
            Ok(report) => {
                info!(
                    metric = %metric.name,
                    loaded = report.rows_loaded,
                    detections = report.detection_rows,
                    anomalies = report.anomalies,
                    alerted = report.alert.is_some(),
                    "metric ok"
                );
            }
            Err(e) => {
                error!(metric = %metric.name, category = e.category(), error = %e, "metric failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        error!(failed, total = metrics.len(), "run finished with failures");
        Ok(1)
    } else {
        info!(total = metrics.len(), "run finished");
        Ok(0)
    }
}
