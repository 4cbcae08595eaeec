//! Internal table names and schema.

use dtk_common::TableOverrides;

pub const DEFAULT_DATAPOINTS_TABLE: &str = "_dtk_datapoints";
pub const DEFAULT_DETECTIONS_TABLE: &str = "_dtk_detections";
pub const TASKS_TABLE: &str = "_dtk_tasks";
pub const METRICS_TABLE: &str = "_dtk_metrics";

/// Resolved names of the four internal tables
#[derive(Debug, Clone)]
pub struct StoreTables {
    pub datapoints: String,
    pub detections: String,
    pub tasks: String,
    pub metrics: String,
}

fn qualify(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", schema, name),
        None => name.to_string(),
    }
}

impl StoreTables {
    /// Apply the profile schema and per-metric table overrides.
    /// Datapoints/detections are overridable per metric; tasks and metric
    /// metadata are global.
    pub fn resolve(schema: Option<&str>, overrides: &TableOverrides) -> Self {
        StoreTables {
            datapoints: qualify(
                schema,
                overrides
                    .datapoints
                    .as_deref()
                    .unwrap_or(DEFAULT_DATAPOINTS_TABLE),
            ),
            detections: qualify(
                schema,
                overrides
                    .detections
                    .as_deref()
                    .unwrap_or(DEFAULT_DETECTIONS_TABLE),
            ),
            tasks: qualify(schema, TASKS_TABLE),
            metrics: qualify(schema, METRICS_TABLE),
        }
    }

    /// DDL for the four tables, idempotent
    pub fn ddl(&self) -> Vec<String> {
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 metric_name TEXT NOT NULL,\n\
                 timestamp TEXT NOT NULL,\n\
                 value REAL,\n\
                 seasonality_data TEXT NOT NULL DEFAULT '{{}}',\n\
                 created_at REAL NOT NULL,\n\
                 PRIMARY KEY (metric_name, timestamp)\n\
                 )",
                self.datapoints
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 metric_name TEXT NOT NULL,\n\
                 detector_hash TEXT NOT NULL,\n\
                 timestamp TEXT NOT NULL,\n\
                 value REAL,\n\
                 is_anomaly INTEGER NOT NULL DEFAULT 0,\n\
                 confidence_lower REAL,\n\
                 confidence_upper REAL,\n\
                 direction TEXT NOT NULL DEFAULT 'none',\n\
                 severity REAL NOT NULL DEFAULT 0,\n\
                 metadata TEXT NOT NULL DEFAULT '{{}}',\n\
                 reason TEXT,\n\
                 created_at REAL NOT NULL,\n\
                 PRIMARY KEY (metric_name, detector_hash, timestamp)\n\
                 )",
                self.detections
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 metric_name TEXT NOT NULL,\n\
                 status TEXT NOT NULL DEFAULT 'idle',\n\
                 locked_at TEXT,\n\
                 lock_expires_at TEXT,\n\
                 last_run_at TEXT,\n\
                 last_error TEXT,\n\
                 last_alert_sent TEXT,\n\
                 alert_count INTEGER NOT NULL DEFAULT 0,\n\
                 PRIMARY KEY (metric_name)\n\
                 )",
                self.tasks
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n\
                 metric_name TEXT NOT NULL,\n\
                 interval TEXT NOT NULL,\n\
                 description TEXT,\n\
                 tags TEXT NOT NULL DEFAULT '[]',\n\
                 enabled INTEGER NOT NULL DEFAULT 1,\n\
                 alerting_enabled INTEGER NOT NULL DEFAULT 0,\n\
                 updated_at TEXT NOT NULL,\n\
                 PRIMARY KEY (metric_name)\n\
                 )",
                self.metrics
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names() {
        let t = StoreTables::resolve(None, &TableOverrides::default());
        assert_eq!(t.datapoints, "_dtk_datapoints");
        assert_eq!(t.detections, "_dtk_detections");
        assert_eq!(t.tasks, "_dtk_tasks");
        assert_eq!(t.metrics, "_dtk_metrics");
    }

    #[test]
    fn overrides_and_schema() {
        let overrides = TableOverrides {
            datapoints: Some("custom_points".to_string()),
            detections: None,
        };
        let t = StoreTables::resolve(Some("monitoring"), &overrides);
        assert_eq!(t.datapoints, "monitoring.custom_points");
        assert_eq!(t.detections, "monitoring._dtk_detections");
        assert_eq!(t.tasks, "monitoring._dtk_tasks");
    }
}
