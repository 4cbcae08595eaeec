//! `dtk init <name>`: scaffold a runnable example project.

use std::path::{Path, PathBuf};
use tracing::info;

use dtk_common::{Error, Result};

use crate::project::PROJECT_FILE;

const PROJECT_TEMPLATE: &str = "name: {name}\n\
# metrics_dir: metrics\n\
# profiles_file: profiles.yml\n";

const PROFILES_TEMPLATE: &str = r#"default_profile: dev

profiles:
  dev:
    type: sqlite
    database: ./driftkit.db
    # internal_schema: monitoring
    # query_timeout_seconds: 300
    # lock_timeout_seconds: 3600

alert_channels: {}
  # ops:
  #   type: mattermost
  #   url: "$MATTERMOST_WEBHOOK_URL"   # wrap the name in braces to interpolate
  #   channel: alerts
  # oncall:
  #   type: telegram
  #   bot_token: "$TELEGRAM_BOT_TOKEN"
  #   chat_id: "-1000000000"
"#;

const EXAMPLE_METRIC_TEMPLATE: &str = r#"name: example_metric
description: Hourly event count (replace the query with your own)
tags: [example]
interval: 1h
enabled: false

query: >
  SELECT event_hour AS timestamp, event_count AS value
  FROM events_hourly
  WHERE event_hour >= :from_date AND event_hour < :to_date

loading_start_time: "2024-01-01"

seasonality_columns:
  - name: hour
    extract: hour
  - name: dow
    extract: dow

detectors:
  - type: mad
    params:
      window_size: 336
      threshold: 4
      seasonality_components: [hour, dow]

alerting:
  enabled: false
  channels: []
  consecutive_anomalies: 3
  direction: same
  alert_cooldown: 2h
"#;

pub fn execute(name: &str, parent: &Path) -> Result<PathBuf> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Configuration(format!(
            "project name '{}' must be alphanumeric with - or _",
            name
        )));
    }
    let root = parent.join(name);
    if root.exists() {
        return Err(Error::Configuration(format!(
            "{} already exists",
            root.display()
        )));
    }

    std::fs::create_dir_all(root.join("metrics"))?;
    std::fs::write(
        root.join(PROJECT_FILE),
        PROJECT_TEMPLATE.replace("{name}", name),
    )?;
    std::fs::write(root.join("profiles.yml"), PROFILES_TEMPLATE)?;
    std::fs::write(
        root.join("metrics").join("example_metric.yml"),
        EXAMPLE_METRIC_TEMPLATE,
    )?;

    info!(project = name, path = %root.display(), "project scaffolded");
    Ok(root)
}
