//! Input preprocessing applied before a detector sees the window.
//!
//! Order: input transformation, then smoothing. Recent weighting is not an
//! array transform; it parameterizes the weighted statistics inside the
//! detectors (see [`recent_weights`]).

use serde::{Deserialize, Serialize};

/// Transformation of the raw value series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Raw,
    /// First difference: `y[i] = x[i] - x[i-1]`
    Diff,
    /// Relative change: `y[i] = (x[i] - x[i-1]) / x[i-1]`
    PctChange,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Raw => "raw",
            InputType::Diff => "diff",
            InputType::PctChange => "pct_change",
        }
    }
}

/// Preprocessing configuration a detector carries
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Preprocessing {
    pub input_type: InputType,
    pub smoothing_window: usize,
    pub recent_weight: f64,
}

impl Default for Preprocessing {
    fn default() -> Self {
        Preprocessing {
            input_type: InputType::Raw,
            smoothing_window: 1,
            recent_weight: 0.0,
        }
    }
}

fn diff(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let y = if i == 0 {
            None
        } else {
            match (values[i - 1], values[i]) {
                (Some(prev), Some(cur)) => Some(cur - prev),
                _ => None,
            }
        };
        out.push(y);
    }
    out
}

fn pct_change(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let y = if i == 0 {
            None
        } else {
            match (values[i - 1], values[i]) {
                (Some(prev), Some(cur)) if prev != 0.0 => Some((cur - prev) / prev),
                _ => None,
            }
        };
        out.push(y);
    }
    out
}

fn smooth(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if values[i].is_none() {
            // Smoothing never fabricates datapoints
            out.push(None);
            continue;
        }
        let lo = i.saturating_sub(window - 1);
        let finite: Vec<f64> = values[lo..=i].iter().filter_map(|v| *v).collect();
        if finite.is_empty() {
            out.push(None);
        } else {
            out.push(Some(finite.iter().sum::<f64>() / finite.len() as f64));
        }
    }
    out
}

/// Apply input transformation and trailing-mean smoothing
pub fn apply(values: &[Option<f64>], input_type: InputType, smoothing_window: usize) -> Vec<Option<f64>> {
    let transformed = match input_type {
        InputType::Raw => values.to_vec(),
        InputType::Diff => diff(values),
        InputType::PctChange => pct_change(values),
    };
    if smoothing_window <= 1 {
        transformed
    } else {
        smooth(&transformed, smoothing_window)
    }
}

/// Per-position raw weights for a window of `len` positions: the trailing
/// 20% band weighs `1 + w`, the leading 80% band `1 - w`. `w = 0` is
/// uniform; `w = 1` zeroes out the leading band. Normalization to the
/// finite-sample count happens inside the statistics helpers.
pub fn recent_weights(len: usize, recent_weight: f64) -> Vec<f64> {
    if len == 0 {
        return Vec::new();
    }
    let trailing = len.div_ceil(5);
    let cut = len - trailing;
    (0..len)
        .map(|i| {
            if i >= cut {
                1.0 + recent_weight
            } else {
                1.0 - recent_weight
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_is_identity() {
        let v = vec![Some(1.0), None, Some(3.0)];
        assert_eq!(apply(&v, InputType::Raw, 1), v);
    }

    #[test]
    fn diff_drops_first_and_gaps() {
        let v = vec![Some(1.0), Some(3.0), None, Some(10.0), Some(4.0)];
        assert_eq!(
            apply(&v, InputType::Diff, 1),
            vec![None, Some(2.0), None, None, Some(-6.0)]
        );
    }

    #[test]
    fn diff_inverts_cumulative_sum() {
        let increments = [2.0, -1.0, 5.0, 0.5];
        let mut cumulative = vec![Some(0.0)];
        let mut total = 0.0;
        for inc in increments {
            total += inc;
            cumulative.push(Some(total));
        }
        let diffed = apply(&cumulative, InputType::Diff, 1);
        let recovered: Vec<f64> = diffed.into_iter().skip(1).map(|v| v.unwrap()).collect();
        assert_eq!(recovered, increments);
    }

    #[test]
    fn pct_change_guards_zero_denominator() {
        let v = vec![Some(10.0), Some(15.0), Some(0.0), Some(5.0)];
        assert_eq!(
            apply(&v, InputType::PctChange, 1),
            vec![None, Some(0.5), Some(-1.0), None]
        );
    }

    #[test]
    fn smoothing_is_trailing_mean_of_finite() {
        let v = vec![Some(1.0), Some(3.0), None, Some(5.0)];
        let smoothed = apply(&v, InputType::Raw, 2);
        assert_eq!(smoothed[0], Some(1.0));
        assert_eq!(smoothed[1], Some(2.0));
        // Absent stays absent
        assert_eq!(smoothed[2], None);
        // Window [None, Some(5.0)] has one finite value
        assert_eq!(smoothed[3], Some(5.0));
    }

    #[test]
    fn zero_recent_weight_is_uniform() {
        assert_eq!(recent_weights(10, 0.0), vec![1.0; 10]);
    }

    #[test]
    fn recent_weights_band_split() {
        let w = recent_weights(10, 0.5);
        assert_eq!(&w[..8], &[0.5; 8]);
        assert_eq!(&w[8..], &[1.5; 2]);
        // Short windows still get a trailing band
        let w = recent_weights(3, 1.0);
        assert_eq!(w, vec![0.0, 0.0, 2.0]);
    }
}
