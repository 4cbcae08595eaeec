//! Interquartile-range detector.
//!
//! Bounds are `q1 - threshold*iqr` and `q3 + threshold*iqr`; severity is
//! the distance past the violated bound in IQR units. Internally the
//! statistic pair is (midhinge, IQR) so seasonality multipliers compose
//! the same way as for the other statistical detectors.

use serde::{Deserialize, Serialize};

use dtk_common::Result;

use crate::preprocess::{InputType, Preprocessing};
use crate::seasonality::ComponentSpec;
use crate::stats::StatFamily;

use super::mad::validate_stat_params;
use super::StatSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IqrParams {
    pub window_size: usize,
    pub threshold: f64,
    pub min_samples: usize,
    pub input_type: InputType,
    pub smoothing_window: usize,
    pub recent_weight: f64,
    pub seasonality_components: Vec<ComponentSpec>,
    pub min_samples_per_group: usize,
}

impl Default for IqrParams {
    fn default() -> Self {
        IqrParams {
            window_size: 50,
            threshold: 1.5,
            min_samples: 3,
            input_type: InputType::Raw,
            smoothing_window: 1,
            recent_weight: 0.0,
            seasonality_components: Vec::new(),
            min_samples_per_group: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IqrDetector {
    pub params: IqrParams,
}

impl IqrDetector {
    pub fn new(params: IqrParams) -> Result<Self> {
        validate_stat_params(
            "iqr",
            params.window_size,
            params.threshold,
            params.min_samples,
            params.smoothing_window,
            params.recent_weight,
        )?;
        Ok(IqrDetector { params })
    }

    pub(crate) fn spec(&self) -> StatSpec<'_> {
        StatSpec {
            name: "iqr",
            family: StatFamily::Quartile,
            window_size: self.params.window_size,
            threshold: self.params.threshold,
            min_samples: self.params.min_samples,
            recent_weight: self.params.recent_weight,
            components: &self.params.seasonality_components,
            min_samples_per_group: self.params.min_samples_per_group,
            preprocessing: Preprocessing {
                input_type: self.params.input_type,
                smoothing_window: self.params.smoothing_window,
                recent_weight: self.params.recent_weight,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Detector;
    use dtk_common::Direction;

    fn iqr(params: serde_json::Value) -> Detector {
        Detector::from_config(&dtk_common::DetectorConfig {
            kind: "iqr".to_string(),
            params,
        })
        .unwrap()
    }

    #[test]
    fn bounds_match_the_quartile_formula() {
        let detector = iqr(serde_json::json!({"threshold": 1.5, "min_samples": 4}));
        // Window 1..=8: q1 = 2, q3 = 6 (nearest rank), iqr = 4
        let mut values: Vec<Option<f64>> =
            (1..=8).map(|v| Some(v as f64)).collect();
        values.push(Some(13.0));
        let points = detector.detect(&values, &[], 8);
        let p = &points[0];
        // lower = 2 - 6 = -4, upper = 6 + 6 = 12
        assert!((p.confidence_lower.unwrap() - -4.0).abs() < 1e-9);
        assert!((p.confidence_upper.unwrap() - 12.0).abs() < 1e-9);
        assert!(p.is_anomaly);
        assert_eq!(p.direction, Direction::Above);
        // Severity: one unit past the upper bound, in IQR units
        assert!((p.severity - 0.25).abs() < 1e-9);
    }

    #[test]
    fn inside_bounds_has_zero_severity() {
        let detector = iqr(serde_json::json!({"min_samples": 4}));
        let mut values: Vec<Option<f64>> = (1..=8).map(|v| Some(v as f64)).collect();
        values.push(Some(5.0));
        let points = detector.detect(&values, &[], 8);
        assert!(!points[0].is_anomaly);
        assert_eq!(points[0].severity, 0.0);
    }
}
