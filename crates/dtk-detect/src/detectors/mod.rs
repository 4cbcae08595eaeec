//! Anomaly detectors.
//!
//! Four variants share one `detect` capability on a tagged enum: MAD,
//! Z-Score, and IQR are windowed statistical detectors (with optional
//! seasonality adjustment); Manual Bounds compares against configured
//! limits with no window or warm-up.

mod iqr;
mod mad;
mod manual;
mod zscore;

pub use iqr::{IqrDetector, IqrParams};
pub use mad::{MadDetector, MadParams};
pub use manual::{ManualBoundsDetector, ManualBoundsParams};
pub use zscore::{ZScoreDetector, ZScoreParams};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

use dtk_common::{
    DetectorConfig, Direction, Error, Result, SeasonalityData, REASON_INSUFFICIENT_DATA,
    REASON_MISSING_DATA,
};

use crate::preprocess::{recent_weights, Preprocessing};
use crate::seasonality::{adjust, ComponentSpec};
use crate::stats::{normalize_weights, StatFamily};

/// One per-index detection verdict, positioned inside the window the
/// detector was given
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionPoint {
    pub index: usize,
    pub is_anomaly: bool,
    pub confidence_lower: Option<f64>,
    pub confidence_upper: Option<f64>,
    pub direction: Direction,
    pub severity: f64,
    pub metadata: serde_json::Value,
    pub reason: Option<String>,
}

impl DetectionPoint {
    fn skipped(index: usize, detector: &str, reason: &str) -> Self {
        DetectionPoint {
            index,
            is_anomaly: false,
            confidence_lower: None,
            confidence_upper: None,
            direction: Direction::None,
            severity: 0.0,
            metadata: serde_json::json!({ "detector": detector }),
            reason: Some(reason.to_string()),
        }
    }
}

/// A configured detector
#[derive(Debug, Clone)]
pub enum Detector {
    Mad(MadDetector),
    ZScore(ZScoreDetector),
    Iqr(IqrDetector),
    ManualBounds(ManualBoundsDetector),
}

impl Detector {
    /// Build a detector from its `{type, params}` declaration
    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        match config.kind.as_str() {
            "mad" => Ok(Detector::Mad(MadDetector::new(parse_params(config)?)?)),
            "z_score" | "zscore" => {
                Ok(Detector::ZScore(ZScoreDetector::new(parse_params(config)?)?))
            }
            "iqr" => Ok(Detector::Iqr(IqrDetector::new(parse_params(config)?)?)),
            "manual_bounds" | "manual" => Ok(Detector::ManualBounds(ManualBoundsDetector::new(
                parse_params(config)?,
            )?)),
            other => Err(Error::Configuration(format!(
                "unknown detector type '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Detector::Mad(_) => "mad",
            Detector::ZScore(_) => "z_score",
            Detector::Iqr(_) => "iqr",
            Detector::ManualBounds(_) => "manual_bounds",
        }
    }

    /// Stable fingerprint: detector name plus sorted non-default params.
    /// Any parameter change starts a new detection stream.
    pub fn fingerprint(&self) -> String {
        let params = match self {
            Detector::Mad(d) => non_default_params(&d.params, &MadParams::default()),
            Detector::ZScore(d) => non_default_params(&d.params, &ZScoreParams::default()),
            Detector::Iqr(d) => non_default_params(&d.params, &IqrParams::default()),
            Detector::ManualBounds(d) => {
                non_default_params(&d.params, &ManualBoundsParams::default())
            }
        };
        format!("{}|{}", self.name(), params)
    }

    /// History needed before a judged point, in datapoints
    pub fn window_size(&self) -> usize {
        match self {
            Detector::Mad(d) => d.params.window_size,
            Detector::ZScore(d) => d.params.window_size,
            Detector::Iqr(d) => d.params.window_size,
            Detector::ManualBounds(_) => 0,
        }
    }

    pub fn preprocessing(&self) -> Preprocessing {
        match self {
            Detector::Mad(d) => Preprocessing {
                input_type: d.params.input_type,
                smoothing_window: d.params.smoothing_window,
                recent_weight: d.params.recent_weight,
            },
            Detector::ZScore(d) => Preprocessing {
                input_type: d.params.input_type,
                smoothing_window: d.params.smoothing_window,
                recent_weight: d.params.recent_weight,
            },
            Detector::Iqr(d) => Preprocessing {
                input_type: d.params.input_type,
                smoothing_window: d.params.smoothing_window,
                recent_weight: d.params.recent_weight,
            },
            Detector::ManualBounds(_) => Preprocessing::default(),
        }
    }

    /// Judge `values[start_index..]` against the configuration. `values`
    /// is the preprocessed window ending at the current batch; earlier
    /// positions are history only.
    pub fn detect(
        &self,
        values: &[Option<f64>],
        seasonality: &[SeasonalityData],
        start_index: usize,
    ) -> Vec<DetectionPoint> {
        match self {
            Detector::Mad(d) => run_statistical(&d.spec(), values, seasonality, start_index),
            Detector::ZScore(d) => run_statistical(&d.spec(), values, seasonality, start_index),
            Detector::Iqr(d) => run_statistical(&d.spec(), values, seasonality, start_index),
            Detector::ManualBounds(d) => d.detect(values, start_index),
        }
    }
}

/// Build every configured detector, failing fast on the first invalid one
pub fn build_detectors(configs: &[DetectorConfig]) -> Result<Vec<Detector>> {
    configs.iter().map(Detector::from_config).collect()
}

fn parse_params<T: DeserializeOwned>(config: &DetectorConfig) -> Result<T> {
    let params = if config.params.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.params.clone()
    };
    serde_json::from_value(params).map_err(|e| {
        Error::Configuration(format!("invalid {} detector params: {}", config.kind, e))
    })
}

/// Sorted JSON object of the params that differ from their defaults
fn non_default_params<T: Serialize>(params: &T, defaults: &T) -> String {
    let current = serde_json::to_value(params).unwrap_or_default();
    let baseline = serde_json::to_value(defaults).unwrap_or_default();
    let mut diff = BTreeMap::new();
    if let (Some(current), Some(baseline)) = (current.as_object(), baseline.as_object()) {
        for (key, value) in current {
            if baseline.get(key) != Some(value) {
                diff.insert(key.clone(), value.clone());
            }
        }
    }
    serde_json::to_string(&diff).unwrap_or_else(|_| "{}".to_string())
}

/// Parameters the shared statistical driver needs, borrowed from a
/// concrete detector
pub(crate) struct StatSpec<'a> {
    pub name: &'static str,
    pub family: StatFamily,
    pub window_size: usize,
    pub threshold: f64,
    pub min_samples: usize,
    pub recent_weight: f64,
    pub components: &'a [ComponentSpec],
    pub min_samples_per_group: usize,
    pub preprocessing: Preprocessing,
}

impl StatSpec<'_> {
    fn bound_factor(&self) -> f64 {
        // IQR bounds are q1 - t*iqr / q3 + t*iqr; around the midhinge
        // that is center -/+ (0.5 + t) * iqr
        match self.family {
            StatFamily::Quartile => 0.5 + self.threshold,
            _ => self.threshold,
        }
    }

    fn severity(&self, value: f64, center: f64, scale: f64, lower: f64, upper: f64) -> f64 {
        match self.family {
            StatFamily::Quartile => {
                let past = (value - upper).max(lower - value).max(0.0);
                past / scale
            }
            _ => (value - center).abs() / scale,
        }
    }
}

pub(crate) fn run_statistical(
    spec: &StatSpec<'_>,
    values: &[Option<f64>],
    seasonality: &[SeasonalityData],
    start_index: usize,
) -> Vec<DetectionPoint> {
    let mut points = Vec::with_capacity(values.len().saturating_sub(start_index));
    for i in start_index..values.len() {
        let lo = i.saturating_sub(spec.window_size.saturating_sub(1));
        let weights = recent_weights(i - lo, spec.recent_weight);
        let mut samples: Vec<(usize, f64, f64)> = (lo..i)
            .filter_map(|j| values[j].map(|v| (j, v, weights[j - lo])))
            .collect();
        if samples.len() < spec.min_samples {
            points.push(DetectionPoint::skipped(i, spec.name, REASON_INSUFFICIENT_DATA));
            continue;
        }
        let Some(value) = values[i] else {
            points.push(DetectionPoint::skipped(i, spec.name, REASON_MISSING_DATA));
            continue;
        };

        {
            let mut pairs: Vec<(f64, f64)> =
                samples.iter().map(|(_, v, w)| (*v, *w)).collect();
            normalize_weights(&mut pairs);
            for (sample, pair) in samples.iter_mut().zip(&pairs) {
                sample.2 = pair.1;
            }
        }
        let pairs: Vec<(f64, f64)> = samples.iter().map(|(_, v, w)| (*v, *w)).collect();
        let (global_center, global_scale) = spec.family.center_scale(&pairs);

        let adjusted = if spec.components.is_empty() || seasonality.len() != values.len() {
            crate::seasonality::Adjusted {
                center: global_center,
                scale: global_scale,
                groups: Vec::new(),
            }
        } else {
            adjust(
                &samples,
                seasonality,
                i,
                spec.components,
                spec.min_samples_per_group,
                spec.family,
                global_center,
                global_scale,
            )
        };

        let factor = spec.bound_factor();
        let lower = adjusted.center - factor * adjusted.scale;
        let upper = adjusted.center + factor * adjusted.scale;
        let direction = if value > upper {
            Direction::Above
        } else if value < lower {
            Direction::Below
        } else {
            Direction::None
        };
        let severity = spec.severity(value, adjusted.center, adjusted.scale, lower, upper);

        let mut metadata = serde_json::json!({
            "detector": spec.name,
            "window_samples": pairs.len(),
            "threshold": spec.threshold,
            "global_center": global_center,
            "global_scale": global_scale,
            "adjusted_center": adjusted.center,
            "adjusted_scale": adjusted.scale,
            "preprocessing": spec.preprocessing,
        });
        if !adjusted.groups.is_empty() {
            metadata["seasonality_groups"] =
                serde_json::to_value(&adjusted.groups).unwrap_or(serde_json::Value::Null);
        }

        points.push(DetectionPoint {
            index: i,
            is_anomaly: direction != Direction::None,
            confidence_lower: Some(lower),
            confidence_upper: Some(upper),
            direction,
            severity,
            metadata,
            reason: None,
        });
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtk_common::DetectorConfig;

    fn config(kind: &str, params: serde_json::Value) -> DetectorConfig {
        DetectorConfig {
            kind: kind.to_string(),
            params,
        }
    }

    #[test]
    fn builds_all_four_kinds() {
        for kind in ["mad", "z_score", "iqr"] {
            assert!(Detector::from_config(&config(kind, serde_json::json!({}))).is_ok());
        }
        assert!(Detector::from_config(&config(
            "manual_bounds",
            serde_json::json!({"upper_bound": 10.0})
        ))
        .is_ok());
        assert!(Detector::from_config(&config("prophet", serde_json::json!({}))).is_err());
    }

    #[test]
    fn null_params_mean_defaults() {
        let detector =
            Detector::from_config(&config("mad", serde_json::Value::Null)).unwrap();
        assert_eq!(detector.fingerprint(), "mad|{}");
    }

    #[test]
    fn fingerprint_lists_only_non_default_params_sorted() {
        let detector = Detector::from_config(&config(
            "mad",
            serde_json::json!({"window_size": 50, "threshold": 4.0, "min_samples": 3}),
        ))
        .unwrap();
        // window_size 50 and min_samples 3 are the defaults
        assert_eq!(detector.fingerprint(), "mad|{\"threshold\":4.0}");
    }

    #[test]
    fn fingerprint_changes_with_params() {
        let a = Detector::from_config(&config("z_score", serde_json::json!({}))).unwrap();
        let b = Detector::from_config(&config(
            "z_score",
            serde_json::json!({"window_size": 100}),
        ))
        .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn rejects_unknown_param_keys() {
        assert!(Detector::from_config(&config(
            "mad",
            serde_json::json!({"windw_size": 10})
        ))
        .is_err());
    }

    #[test]
    fn skipped_points_carry_reasons() {
        let detector = Detector::from_config(&config(
            "mad",
            serde_json::json!({"min_samples": 3}),
        ))
        .unwrap();
        let values = vec![Some(1.0), Some(1.0), None, Some(1.0), None, Some(1.0)];
        let points = detector.detect(&values, &[], 0);
        assert_eq!(points.len(), 6);
        assert_eq!(points[0].reason.as_deref(), Some(REASON_INSUFFICIENT_DATA));
        assert_eq!(points[4].reason.as_deref(), Some(REASON_MISSING_DATA));
        assert!(points.iter().all(|p| !p.is_anomaly || p.reason.is_none()));
    }
}
