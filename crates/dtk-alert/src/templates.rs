//! Alert message rendering.
//!
//! Templates are tera one-offs over a flat variable set. Numeric values
//! are exposed both raw (`value_raw`) and pre-formatted (`value`) so the
//! default templates stay readable.

use tera::{Context, Tera};

use dtk_common::{format_timestamp, AlertPolicy, Error, Result};

use crate::event::{AlertEvent, AlertKind};

pub const DEFAULT_TEMPLATE_SINGLE: &str = "[driftkit] {{ metric_name }}: value {{ value }} is \
{{ direction }} the expected range [{{ confidence_lower }}, {{ confidence_upper }}] at \
{{ local_time }} (severity {{ severity }}, detector {{ detector_name }})";

pub const DEFAULT_TEMPLATE_CONSECUTIVE: &str = "[driftkit] {{ metric_name }}: \
{{ consecutive_count }} consecutive anomalous intervals, latest value {{ value }} \
{{ direction }} [{{ confidence_lower }}, {{ confidence_upper }}] at {{ local_time }} \
(severity {{ severity }}, detector {{ detector_name }})";

pub const DEFAULT_TEMPLATE_NO_DATA: &str = "[driftkit] {{ metric_name }}: no data since \
{{ local_time }} ({{ consecutive_count }} missing intervals)";

fn format_number(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.4}", value)
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map(format_number).unwrap_or_else(|| "n/a".to_string())
}

fn context(event: &AlertEvent) -> Context {
    let mut context = Context::new();
    context.insert("alert_id", &event.id);
    context.insert("alert_kind", event.kind.as_str());
    context.insert("metric_name", &event.metric_name);
    context.insert("timestamp", &format_timestamp(event.timestamp));
    context.insert("local_time", &event.local_time);
    context.insert("value", &format_optional(event.value));
    context.insert("value_raw", &event.value);
    context.insert("confidence_lower", &format_optional(event.confidence_lower));
    context.insert("confidence_lower_raw", &event.confidence_lower);
    context.insert("confidence_upper", &format_optional(event.confidence_upper));
    context.insert("confidence_upper_raw", &event.confidence_upper);
    context.insert("direction", event.direction.as_str());
    context.insert("severity", &format!("{:.2}", event.severity));
    context.insert("severity_raw", &event.severity);
    context.insert("detector_name", &event.detector_name);
    context.insert("consecutive_count", &event.consecutive_count);
    context
}

/// Pick the template the policy configures for this event and render it
pub fn render(policy: &AlertPolicy, event: &AlertEvent) -> Result<String> {
    let template = match event.kind {
        AlertKind::NoData => policy
            .template_single
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE_NO_DATA),
        AlertKind::Anomaly if event.consecutive_count > 1 => policy
            .template_consecutive
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE_CONSECUTIVE),
        AlertKind::Anomaly => policy
            .template_single
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE_SINGLE),
    };
    Tera::one_off(template, &context(event), false)
        .map_err(|e| Error::Alert(format!("template render failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtk_common::{parse_timestamp, Direction};

    fn event(kind: AlertKind, consecutive: usize) -> AlertEvent {
        AlertEvent {
            id: "test".to_string(),
            kind,
            metric_name: "orders".to_string(),
            timestamp: parse_timestamp("2024-06-01 12:00:00").unwrap(),
            local_time: "2024-06-01 12:00:00 UTC".to_string(),
            value: Some(120.0),
            confidence_lower: Some(80.0),
            confidence_upper: Some(100.5),
            direction: Direction::Above,
            severity: 4.5,
            detector_name: "mad".to_string(),
            consecutive_count: consecutive,
        }
    }

    #[test]
    fn default_single_template_renders_all_variables() {
        let message = render(&AlertPolicy::default(), &event(AlertKind::Anomaly, 1)).unwrap();
        assert!(message.contains("orders"));
        assert!(message.contains("120"));
        assert!(message.contains("above"));
        assert!(message.contains("[80, 100.5000]"));
        assert!(message.contains("severity 4.50"));
        assert!(message.contains("mad"));
    }

    #[test]
    fn consecutive_template_kicks_in_after_the_first() {
        let message = render(&AlertPolicy::default(), &event(AlertKind::Anomaly, 3)).unwrap();
        assert!(message.contains("3 consecutive"));
    }

    #[test]
    fn custom_template_overrides_default() {
        let policy = AlertPolicy {
            template_single: Some("{{ metric_name }} went {{ direction }}!".to_string()),
            ..AlertPolicy::default()
        };
        let message = render(&policy, &event(AlertKind::Anomaly, 1)).unwrap();
        assert_eq!(message, "orders went above!");
    }

    #[test]
    fn absent_values_render_as_na() {
        let mut e = event(AlertKind::Anomaly, 1);
        e.value = None;
        e.confidence_lower = None;
        let message = render(&AlertPolicy::default(), &e).unwrap();
        assert!(message.contains("value n/a"));
    }

    #[test]
    fn no_data_template() {
        let message = render(&AlertPolicy::default(), &event(AlertKind::NoData, 5)).unwrap();
        assert!(message.contains("no data since"));
        assert!(message.contains("5 missing intervals"));
    }

    #[test]
    fn invalid_template_is_an_alert_error() {
        let policy = AlertPolicy {
            template_single: Some("{{ unclosed".to_string()),
            ..AlertPolicy::default()
        };
        assert!(render(&policy, &event(AlertKind::Anomaly, 1)).is_err());
    }
}
