//! Distances between scalar feature values.

use std::fmt;

/// A distance between two values of the same scalar feature, in `[0, 1]`.
pub trait FeatureErrorFunction: fmt::Debug + Send + Sync {
    fn error_between(&self, a: f64, b: f64) -> f64;
}

/// `|a - b| / max(|a|, |b|)`; zero when both are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedDifference;

impl FeatureErrorFunction for NormalizedDifference {
    fn error_between(&self, a: f64, b: f64) -> f64 {
        let scale = a.abs().max(b.abs());
        if scale <= f64::EPSILON {
            return 0.0;
        }
        ((a - b).abs() / scale).min(1.0)
    }
}

/// Boolean features stored as `0.0`/`1.0`: zero when both agree, one
/// otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceMismatch;

impl FeatureErrorFunction for PresenceMismatch {
    fn error_between(&self, a: f64, b: f64) -> f64 {
        if (a >= 0.5) == (b >= 0.5) { 0.0 } else { 1.0 }
    }
}
