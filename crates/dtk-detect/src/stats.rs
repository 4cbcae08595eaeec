//! Weighted statistics shared by the detectors.
//!
//! Samples are `(value, weight)` pairs over the finite values of a window.
//! Weights are normalized so they sum to the sample count, which keeps the
//! unbiased standard deviation identical to the classic formula under
//! uniform weights.

/// Floor applied to every scale estimate so zero-spread windows still
/// produce a finite interval
pub const EPSILON: f64 = 1e-10;

/// Scale weights so they sum to the sample count
pub fn normalize_weights(samples: &mut [(f64, f64)]) {
    let total: f64 = samples.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        for sample in samples.iter_mut() {
            sample.1 = 1.0;
        }
        return;
    }
    let factor = samples.len() as f64 / total;
    for sample in samples.iter_mut() {
        sample.1 *= factor;
    }
}

pub fn weighted_mean(samples: &[(f64, f64)]) -> f64 {
    let total: f64 = samples.iter().map(|(_, w)| w).sum();
    if total == 0.0 {
        return 0.0;
    }
    samples.iter().map(|(v, w)| v * w).sum::<f64>() / total
}

/// Unbiased weighted standard deviation (denominator `W - 1`)
pub fn weighted_std(samples: &[(f64, f64)]) -> f64 {
    let total: f64 = samples.iter().map(|(_, w)| w).sum();
    if total <= 1.0 {
        return 0.0;
    }
    let mean = weighted_mean(samples);
    let sum_sq: f64 = samples.iter().map(|(v, w)| w * (v - mean) * (v - mean)).sum();
    (sum_sq / (total - 1.0)).sqrt()
}

/// Inverted-CDF weighted quantile: the smallest sample whose cumulative
/// weight reaches `q * total`. With uniform weights this is the classic
/// nearest-rank percentile. Deterministic for identical inputs.
pub fn weighted_quantile(samples: &[(f64, f64)], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<(f64, f64)> = samples.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    let target = q * total - 1e-12;
    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= target {
            return *value;
        }
    }
    sorted[sorted.len() - 1].0
}

pub fn weighted_median(samples: &[(f64, f64)]) -> f64 {
    weighted_quantile(samples, 0.5)
}

/// Median absolute deviation around `center`
pub fn weighted_mad(samples: &[(f64, f64)], center: f64) -> f64 {
    let deviations: Vec<(f64, f64)> = samples
        .iter()
        .map(|(v, w)| ((v - center).abs(), *w))
        .collect();
    weighted_median(&deviations)
}

/// The statistic pair a detector family is built on. The seasonality
/// adjuster reuses the same family for per-group statistics so group
/// multipliers stay comparable to the global pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatFamily {
    /// median / median absolute deviation
    Robust,
    /// mean / unbiased standard deviation
    Moment,
    /// midhinge / interquartile range
    Quartile,
}

impl StatFamily {
    /// Compute (center, scale) over weighted samples; scale is
    /// epsilon-floored
    pub fn center_scale(&self, samples: &[(f64, f64)]) -> (f64, f64) {
        let (center, scale) = match self {
            StatFamily::Robust => {
                let center = weighted_median(samples);
                (center, weighted_mad(samples, center))
            }
            StatFamily::Moment => (weighted_mean(samples), weighted_std(samples)),
            StatFamily::Quartile => {
                let q1 = weighted_quantile(samples, 0.25);
                let q3 = weighted_quantile(samples, 0.75);
                ((q1 + q3) / 2.0, q3 - q1)
            }
        };
        (center, scale.max(EPSILON))
    }
}
