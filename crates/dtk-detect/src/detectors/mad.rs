//! Median-absolute-deviation detector.
//!
//! `center = median(window)`, `scale = median(|window - center|)`; bounds
//! are `center +/- threshold * scale` and severity is the deviation in
//! scale units. The robust pair makes single outliers in the history
//! window nearly invisible to the bounds.

use serde::{Deserialize, Serialize};

use dtk_common::{Error, Result};

use crate::preprocess::{InputType, Preprocessing};
use crate::seasonality::ComponentSpec;
use crate::stats::StatFamily;

use super::StatSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MadParams {
    pub window_size: usize,
    pub threshold: f64,
    pub min_samples: usize,
    pub input_type: InputType,
    pub smoothing_window: usize,
    pub recent_weight: f64,
    pub seasonality_components: Vec<ComponentSpec>,
    pub min_samples_per_group: usize,
}

impl Default for MadParams {
    fn default() -> Self {
        MadParams {
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
pub struct MadDetector {
    pub params: MadParams,
}

impl MadDetector {
    pub fn new(params: MadParams) -> Result<Self> {
        validate_stat_params(
            "mad",
            params.window_size,
            params.threshold,
            params.min_samples,
            params.smoothing_window,
            params.recent_weight,
        )?;
        Ok(MadDetector { params })
    }

    pub(crate) fn spec(&self) -> StatSpec<'_> {
        StatSpec {
            name: "mad",
            family: StatFamily::Robust,
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

pub(crate) fn validate_stat_params(
    name: &str,
    window_size: usize,
    threshold: f64,
    min_samples: usize,
    smoothing_window: usize,
    recent_weight: f64,
) -> Result<()> {
    if window_size < 2 {
        return Err(Error::Configuration(format!(
            "{}: window_size must be >= 2",
            name
        )));
    }
    if !(threshold > 0.0) {
        return Err(Error::Configuration(format!(
            "{}: threshold must be positive",
            name
        )));
    }
    if min_samples == 0 {
        return Err(Error::Configuration(format!(
            "{}: min_samples must be >= 1",
            name
        )));
    }
    if smoothing_window == 0 {
        return Err(Error::Configuration(format!(
            "{}: smoothing_window must be >= 1",
            name
        )));
    }
    if !(0.0..=1.0).contains(&recent_weight) {
        return Err(Error::Configuration(format!(
            "{}: recent_weight must be within [0, 1]",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Detector;
    use super::*;
    use dtk_common::Direction;

    fn mad(params: serde_json::Value) -> Detector {
        Detector::from_config(&dtk_common::DetectorConfig {
            kind: "mad".to_string(),
            params,
        })
        .unwrap()
    }

    #[test]
    fn flags_spikes_against_a_robust_baseline() {
        let detector = mad(serde_json::json!({"threshold": 3.0, "min_samples": 3}));
        let values: Vec<Option<f64>> =
            [10.0, 10.0, 10.0, 10.0, 100.0, 10.0, 100.0].iter().map(|v| Some(*v)).collect();
        let points = detector.detect(&values, &[], 3);
        // Index 3: value 10 inside bounds
        assert!(!points[0].is_anomaly);
        // Index 4: the spike
        assert!(points[1].is_anomaly);
        assert_eq!(points[1].direction, Direction::Above);
        assert!(points[1].severity > 3.0);
        // Index 5: back to baseline, history now contains a spike the
        // median shrugs off
        assert!(!points[2].is_anomaly);
        assert!(points[3].is_anomaly);
    }

    #[test]
    fn zero_spread_window_collapses_bounds_to_epsilon() {
        let detector = mad(serde_json::json!({"min_samples": 3}));
        let values: Vec<Option<f64>> = vec![Some(5.0); 6];
        let points = detector.detect(&values, &[], 5);
        let p = &points[0];
        assert!(!p.is_anomaly);
        let width = p.confidence_upper.unwrap() - p.confidence_lower.unwrap();
        assert!(width < 1e-8, "width was {}", width);

        // Any deviation from a constant series is anomalous
        let mut deviated = values.clone();
        deviated[5] = Some(5.0001);
        let points = detector.detect(&deviated, &[], 5);
        assert!(points[0].is_anomaly);
    }

    #[test]
    fn detection_is_deterministic() {
        let detector = mad(serde_json::json!({"recent_weight": 0.4}));
        let values: Vec<Option<f64>> = (0..40).map(|i| Some((i % 7) as f64)).collect();
        let a = detector.detect(&values, &[], 10);
        let b = detector.detect(&values, &[], 10);
        assert_eq!(a, b);
    }

    #[test]
    fn bounds_are_ordered() {
        let detector = mad(serde_json::json!({}));
        let values: Vec<Option<f64>> = (0..30).map(|i| Some((i * 37 % 11) as f64)).collect();
        for point in detector.detect(&values, &[], 5) {
            if let (Some(lower), Some(upper)) = (point.confidence_lower, point.confidence_upper) {
                assert!(lower <= upper);
            }
        }
    }

    #[test]
    fn rejects_bad_params() {
        assert!(MadDetector::new(MadParams {
            window_size: 1,
            ..MadParams::default()
        })
        .is_err());
        assert!(MadDetector::new(MadParams {
            threshold: 0.0,
            ..MadParams::default()
        })
        .is_err());
        assert!(MadDetector::new(MadParams {
            recent_weight: 1.5,
            ..MadParams::default()
        })
        .is_err());
    }
}
