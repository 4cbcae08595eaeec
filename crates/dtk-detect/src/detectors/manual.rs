//! Manual bounds detector: fixed limits from configuration.
//!
//! No window, no warm-up, no preprocessing. At least one bound is
//! required; with both bounds severity is normalized by the band width,
//! with one bound it is the raw distance past the limit.

use serde::{Deserialize, Serialize};

use dtk_common::{Direction, Error, Result, REASON_MISSING_DATA};

use super::DetectionPoint;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManualBoundsParams {
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ManualBoundsDetector {
    pub params: ManualBoundsParams,
}

impl ManualBoundsDetector {
    pub fn new(params: ManualBoundsParams) -> Result<Self> {
        match (params.lower_bound, params.upper_bound) {
            (None, None) => {
                return Err(Error::Configuration(
                    "manual_bounds: at least one of lower_bound / upper_bound is required"
                        .to_string(),
                ))
            }
            (Some(lower), Some(upper)) if lower >= upper => {
                return Err(Error::Configuration(format!(
                    "manual_bounds: lower_bound {} must be below upper_bound {}",
                    lower, upper
                )))
            }
            _ => {}
        }
        Ok(ManualBoundsDetector { params })
    }

    pub fn detect(&self, values: &[Option<f64>], start_index: usize) -> Vec<DetectionPoint> {
        let lower = self.params.lower_bound;
        let upper = self.params.upper_bound;
        let metadata = serde_json::json!({
            "detector": "manual_bounds",
            "lower_bound": lower,
            "upper_bound": upper,
        });

        let mut points = Vec::with_capacity(values.len().saturating_sub(start_index));
        for i in start_index..values.len() {
            let Some(value) = values[i] else {
                points.push(DetectionPoint::skipped(i, "manual_bounds", REASON_MISSING_DATA));
                continue;
            };
            let direction = if upper.map(|u| value > u).unwrap_or(false) {
                Direction::Above
            } else if lower.map(|l| value < l).unwrap_or(false) {
                Direction::Below
            } else {
                Direction::None
            };
            let distance = match direction {
                Direction::Above => value - upper.unwrap_or(value),
                Direction::Below => lower.unwrap_or(value) - value,
                Direction::None => 0.0,
            };
            let severity = match (lower, upper) {
                (Some(lower), Some(upper)) => distance / (upper - lower),
                _ => distance,
            };
            points.push(DetectionPoint {
                index: i,
                is_anomaly: direction != Direction::None,
                confidence_lower: lower,
                confidence_upper: upper,
                direction,
                severity,
                metadata: metadata.clone(),
                reason: None,
            });
        }
        points
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_at_least_one_bound() {
        assert!(ManualBoundsDetector::new(ManualBoundsParams::default()).is_err());
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(ManualBoundsDetector::new(ManualBoundsParams {
            lower_bound: Some(10.0),
            upper_bound: Some(5.0),
        })
        .is_err());
    }

    #[test]
    fn both_bounds_normalize_severity_by_band_width() {
        let detector = ManualBoundsDetector::new(ManualBoundsParams {
            lower_bound: Some(0.0),
            upper_bound: Some(10.0),
        })
        .unwrap();
        let points = detector.detect(&[Some(5.0), Some(15.0), Some(-2.5), None], 0);
        assert!(!points[0].is_anomaly);
        assert_eq!(points[0].severity, 0.0);

        assert_eq!(points[1].direction, Direction::Above);
        assert!((points[1].severity - 0.5).abs() < 1e-12);

        assert_eq!(points[2].direction, Direction::Below);
        assert!((points[2].severity - 0.25).abs() < 1e-12);

        assert_eq!(points[3].reason.as_deref(), Some(REASON_MISSING_DATA));
    }

    #[test]
    fn single_bound_uses_raw_distance() {
        let detector = ManualBoundsDetector::new(ManualBoundsParams {
            lower_bound: None,
            upper_bound: Some(100.0),
        })
        .unwrap();
        let points = detector.detect(&[Some(140.0), Some(50.0)], 0);
        assert!(points[0].is_anomaly);
        assert_eq!(points[0].severity, 40.0);
        assert_eq!(points[0].confidence_lower, None);
        assert_eq!(points[0].confidence_upper, Some(100.0));
        assert!(!points[1].is_anomaly);
    }
}
