//! `dtk test-alert <metric>`: push a synthetic event through the metric's
//! configured channels.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use dtk_alert::{render_local_time, AlertDispatcher, AlertEvent, AlertKind};
use dtk_common::{Direction, Result};

use crate::project::Project;

pub async fn execute(
    project_root: &Path,
    metric_name: &str,
    profile: Option<&str>,
) -> Result<i32> {
    let project = Project::load(project_root)?;
    // Dispatch needs no database, but a bad --profile should still fail fast
    project.profiles.resolve_profile(profile)?;
    let metric = project.metric_by_name(metric_name)?;
    let policy = &metric.alerting;

    if policy.channels.is_empty() {
        warn!(metric = metric_name, "no alert channels configured; nothing to test");
        return Ok(0);
    }
    for channel in &policy.channels {
        project.profiles.channel(channel)?;
    }

    let now = chrono::Utc::now().naive_utc();
    let timestamp = metric.interval.align(now);
    let event = AlertEvent {
        id: AlertEvent::new_id(),
        kind: AlertKind::Anomaly,
        metric_name: metric.name.clone(),
        timestamp,
        local_time: render_local_time(timestamp, policy.timezone.as_deref())?,
        value: Some(42.0),
        confidence_lower: Some(10.0),
        confidence_upper: Some(20.0),
        direction: Direction::Above,
        severity: 3.0,
        detector_name: "test_alert".to_string(),
        consecutive_count: 1,
    };

    let dispatcher = Arc::new(AlertDispatcher::new(project.profiles.alert_channels.clone())?);
    let deliveries = dispatcher.dispatch(policy, &event).await?;

    let mut failed = 0usize;
    for delivery in &deliveries {
        if delivery.success {
            info!(channel = %delivery.channel, kind = delivery.kind, "test alert delivered");
        } else {
            warn!(
                channel = %delivery.channel,
                kind = delivery.kind,
                error = delivery.error.as_deref().unwrap_or("unknown"),
                "test alert failed"
            );
            failed += 1;
        }
    }
    Ok(if failed > 0 { 1 } else { 0 })
}
