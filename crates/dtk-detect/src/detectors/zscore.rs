//! Z-Score detector: mean / unbiased standard deviation.

use serde::{Deserialize, Serialize};

use dtk_common::Result;

use crate::preprocess::{InputType, Preprocessing};
use crate::seasonality::ComponentSpec;
use crate::stats::StatFamily;

use super::mad::validate_stat_params;
use super::StatSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZScoreParams {
    pub window_size: usize,
    pub threshold: f64,
    pub min_samples: usize,
    pub input_type: InputType,
    pub smoothing_window: usize,
    pub recent_weight: f64,
    pub seasonality_components: Vec<ComponentSpec>,
    pub min_samples_per_group: usize,
}

impl Default for ZScoreParams {
    fn default() -> Self {
        ZScoreParams {
            window_size: 50,
            threshold: 3.0,
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
pub struct ZScoreDetector {
    pub params: ZScoreParams,
}

impl ZScoreDetector {
    pub fn new(params: ZScoreParams) -> Result<Self> {
        validate_stat_params(
            "z_score",
            params.window_size,
            params.threshold,
            params.min_samples,
            params.smoothing_window,
            params.recent_weight,
        )?;
        Ok(ZScoreDetector { params })
    }

    pub(crate) fn spec(&self) -> StatSpec<'_> {
        StatSpec {
            name: "z_score",
            family: StatFamily::Moment,
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

    fn zscore(params: serde_json::Value) -> Detector {
        Detector::from_config(&dtk_common::DetectorConfig {
            kind: "z_score".to_string(),
            params,
        })
        .unwrap()
    }

    #[test]
    fn severity_is_deviation_in_sigma_units() {
        let detector = zscore(serde_json::json!({"threshold": 2.0, "min_samples": 4}));
        // History: mean 10, sample stddev 1
        let values: Vec<Option<f64>> = [9.0, 11.0, 9.0, 11.0, 10.0, 14.0]
            .iter()
            .map(|v| Some(*v))
            .collect();
        let points = detector.detect(&values, &[], 5);
        let p = &points[0];
        assert!(p.is_anomaly);
        assert_eq!(p.direction, Direction::Above);
        // (14 - 10) / ~1.0
        assert!((p.severity - 4.0).abs() < 0.2, "severity {}", p.severity);
        assert_eq!(p.metadata["detector"], "z_score");
        assert!(p.metadata["global_scale"].as_f64().unwrap() > 0.9);
    }

    #[test]
    fn low_values_flag_below() {
        let detector = zscore(serde_json::json!({"threshold": 2.0, "min_samples": 4}));
        let values: Vec<Option<f64>> = [9.0, 11.0, 9.0, 11.0, 10.0, 4.0]
            .iter()
            .map(|v| Some(*v))
            .collect();
        let points = detector.detect(&values, &[], 5);
        assert!(points[0].is_anomaly);
        assert_eq!(points[0].direction, Direction::Below);
    }
}
