//! Match factors: independently weighted comparisons between an unknown
//! outline and one catalog outline.
//!
//! A [`MatchFactor`] pairs a weight and the feature points/features it
//! reads with one [`FactorComparison`]:
//!
//! - [`OutlineComparison`]: registration plus an outline error function;
//! - [`RatioComparison`]: Mahalanobis distance between ratio vectors;
//! - [`FeatureComparison`]: distance between one scalar feature.
//!
//! Factors never see each other's errors. The pipeline collects raw
//! errors from every factor and only combines them once the whole
//! catalog has been seen.

use std::fmt;
use std::sync::Arc;

use crate::error_fn::{MeanSquaredSegmentError, OutlineErrorFunction};
use crate::feature_error::{FeatureErrorFunction, NormalizedDifference, PresenceMismatch};
use crate::outline::{FeaturePointType, FeatureType, Outline};
use crate::ratio::RatioStatistics;
use crate::registration::{Anchored, Registration, RegistrationStrategy};
use crate::types::EngineError;

/// Raw outcome of one factor on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorOutcome {
    /// Unscaled error; only comparable with the same factor's errors on
    /// other candidates.
    pub error: f64,
    /// Aligned contours, for factors that register outlines.
    pub registration: Option<Registration>,
}

impl FactorOutcome {
    #[must_use]
    pub const fn scalar(error: f64) -> Self {
        Self {
            error,
            registration: None,
        }
    }
}

/// One way of comparing two outlines.
pub trait FactorComparison: fmt::Debug + Send + Sync {
    /// # Errors
    ///
    /// Returns an error when either outline lacks what the comparison
    /// needs or the comparison itself fails.
    fn compare(&self, unknown: &Outline, candidate: &Outline)
    -> Result<FactorOutcome, EngineError>;
}

/// Outline registration followed by an outline error function.
#[derive(Debug)]
pub struct OutlineComparison {
    /// Feature points used as begin, tip and end anchors.
    pub control: [FeaturePointType; 3],
    /// Feature point some strategies try in place of the end anchor.
    pub alternate_end: Option<FeaturePointType>,
    pub strategy: Box<dyn RegistrationStrategy>,
    pub metric: Box<dyn OutlineErrorFunction>,
}

impl OutlineComparison {
    fn anchored<'a>(&self, outline: &'a Outline) -> Result<Anchored<'a>, EngineError> {
        Ok(Anchored {
            contour: outline.contour(),
            points: outline.control_points(self.control)?,
            alternate_end: self.alternate_end.and_then(|k| outline.feature_point(k)),
        })
    }
}

impl FactorComparison for OutlineComparison {
    fn compare(
        &self,
        unknown: &Outline,
        candidate: &Outline,
    ) -> Result<FactorOutcome, EngineError> {
        let registration = self.strategy.register(
            self.anchored(unknown)?,
            self.anchored(candidate)?,
            self.metric.as_ref(),
        )?;
        Ok(FactorOutcome {
            error: registration.error,
            registration: Some(registration),
        })
    }
}

/// Mahalanobis distance between ratio vectors, using statistics computed
/// once over the catalog.
#[derive(Debug, Clone)]
pub struct RatioComparison {
    pub statistics: Arc<RatioStatistics>,
}

impl FactorComparison for RatioComparison {
    fn compare(
        &self,
        unknown: &Outline,
        candidate: &Outline,
    ) -> Result<FactorOutcome, EngineError> {
        let spec = self.statistics.spec();
        let a = spec.ratios(unknown)?;
        let b = spec.ratios(candidate)?;
        Ok(FactorOutcome::scalar(self.statistics.distance(&a, &b)?))
    }
}

/// Distance between one scalar feature of each outline.
#[derive(Debug)]
pub struct FeatureComparison {
    pub feature: FeatureType,
    pub function: Box<dyn FeatureErrorFunction>,
}

impl FactorComparison for FeatureComparison {
    fn compare(
        &self,
        unknown: &Outline,
        candidate: &Outline,
    ) -> Result<FactorOutcome, EngineError> {
        let a = unknown.require_feature(self.feature)?;
        let b = candidate.require_feature(self.feature)?;
        Ok(FactorOutcome::scalar(self.function.error_between(a, b)))
    }
}

/// A weighted comparison with declared dependencies.
#[derive(Debug)]
pub struct MatchFactor {
    weight: f64,
    point_dependencies: Vec<FeaturePointType>,
    feature_dependencies: Vec<FeatureType>,
    comparison: Box<dyn FactorComparison>,
}

impl MatchFactor {
    #[must_use]
    pub fn new(
        weight: f64,
        point_dependencies: Vec<FeaturePointType>,
        feature_dependencies: Vec<FeatureType>,
        comparison: Box<dyn FactorComparison>,
    ) -> Self {
        Self {
            weight,
            point_dependencies,
            feature_dependencies,
            comparison,
        }
    }

    /// Registration-based factor anchored on `control`. The alternate end
    /// anchor, if any, is used when present and is not a dependency.
    #[must_use]
    pub fn outline(weight: f64, comparison: OutlineComparison) -> Self {
        let deps = comparison.control.to_vec();
        Self::new(weight, deps, Vec::new(), Box::new(comparison))
    }

    /// Ratio factor; depends on every landmark its statistics read.
    #[must_use]
    pub fn ratio(weight: f64, statistics: Arc<RatioStatistics>) -> Self {
        let deps = statistics.spec().dependencies();
        Self::new(
            weight,
            deps,
            Vec::new(),
            Box::new(RatioComparison { statistics }),
        )
    }

    /// Scalar feature factor.
    #[must_use]
    pub fn feature(
        weight: f64,
        feature: FeatureType,
        function: Box<dyn FeatureErrorFunction>,
    ) -> Self {
        Self::new(
            weight,
            Vec::new(),
            vec![feature],
            Box::new(FeatureComparison { feature, function }),
        )
    }

    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    #[must_use]
    pub fn point_dependencies(&self) -> &[FeaturePointType] {
        &self.point_dependencies
    }

    #[must_use]
    pub fn feature_dependencies(&self) -> &[FeatureType] {
        &self.feature_dependencies
    }

    /// Check that `outline` carries everything this factor reads.
    ///
    /// # Errors
    ///
    /// Returns the first missing feature point or feature.
    pub fn check_dependencies(&self, outline: &Outline) -> Result<(), EngineError> {
        if let Some(&missing) = self
            .point_dependencies
            .iter()
            .find(|&&k| outline.feature_point(k).is_none())
        {
            return Err(EngineError::MissingFeaturePoint(missing));
        }
        if let Some(&missing) = self
            .feature_dependencies
            .iter()
            .find(|&&k| outline.feature(k).is_none())
        {
            return Err(EngineError::MissingFeature(missing));
        }
        Ok(())
    }

    /// Run the comparison after checking both outlines' dependencies.
    ///
    /// # Errors
    ///
    /// Returns dependency errors or whatever the comparison reports.
    pub fn compare(
        &self,
        unknown: &Outline,
        candidate: &Outline,
    ) -> Result<FactorOutcome, EngineError> {
        self.check_dependencies(unknown)?;
        self.check_dependencies(candidate)?;
        self.comparison.compare(unknown, candidate)
    }
}

/// Factor sets used by the catalogue workflows.
pub mod presets {
    use std::sync::Arc;

    use super::{
        FeatureType, MatchFactor, MeanSquaredSegmentError, NormalizedDifference,
        OutlineComparison, PresenceMismatch,
    };
    use crate::outline::FeaturePointType::{
        BottomLipProtrusion, LeadingEdgeBegin, Nasion, Notch, PointOfInflection, Tip, UpperLip,
    };
    use crate::pipeline::Catalog;
    use crate::ratio::{RatioSpec, RatioStatistics};
    use crate::registration::ControlPointJitter;
    use crate::types::{EngineError, MatchConfig};

    pub const BEAR_OUTLINE_WEIGHT: f64 = 0.55;
    pub const BEAR_BROW_WEIGHT: f64 = 0.1;
    pub const BEAR_MOUTH_DENT_WEIGHT: f64 = 0.05;
    pub const BEAR_RATIO_WEIGHT: f64 = 0.35;
    pub const BEAR_DESIRED_RATIOS: usize = 5;

    /// One outline factor using the configured registration method.
    #[must_use]
    pub fn dorsal_fin(config: &MatchConfig) -> Vec<MatchFactor> {
        let method = config.registration;
        vec![MatchFactor::outline(
            1.0,
            OutlineComparison {
                control: [LeadingEdgeBegin, Tip, PointOfInflection],
                alternate_end: None,
                strategy: method.strategy(config),
                metric: method.metric(),
            },
        )]
    }

    /// Ratio landmarks for bear muzzles.
    #[must_use]
    pub fn bear_ratio_spec() -> RatioSpec {
        RatioSpec {
            benchmark: (Tip, Notch),
            landmarks: vec![Tip, Nasion, Notch, UpperLip, PointOfInflection],
            pairs: None,
            desired_ratios: BEAR_DESIRED_RATIOS,
        }
    }

    /// Outline, brow curvature, mouth dent and ratio factors.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InsufficientCatalog`] when the catalog has
    /// too few fully landmarked outlines for ratio statistics.
    pub fn bear(config: &MatchConfig, catalog: &Catalog) -> Result<Vec<MatchFactor>, EngineError> {
        let statistics = RatioStatistics::from_catalog(
            bear_ratio_spec(),
            catalog.candidates().iter().map(|c| &c.outline),
        )?;
        Ok(vec![
            MatchFactor::outline(
                BEAR_OUTLINE_WEIGHT,
                OutlineComparison {
                    control: [Nasion, Tip, PointOfInflection],
                    alternate_end: Some(BottomLipProtrusion),
                    strategy: Box::new(ControlPointJitter::new(config.error_range)),
                    metric: Box::new(MeanSquaredSegmentError),
                },
            ),
            MatchFactor::feature(
                BEAR_BROW_WEIGHT,
                FeatureType::BrowCurvature,
                Box::new(NormalizedDifference),
            ),
            MatchFactor::feature(
                BEAR_MOUTH_DENT_WEIGHT,
                FeatureType::HasMouthDent,
                Box::new(PresenceMismatch),
            ),
            MatchFactor::ratio(BEAR_RATIO_WEIGHT, Arc::new(statistics)),
        ])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::contour::Contour;
    use crate::outline::FeatureSetType;
    use crate::registration::{ErrorRange, FixedThreePoint};
    use crate::types::{MatchConfig, Point};

    fn fin(shift: f64) -> Outline {
        let pts: Vec<Point> = (0..60)
            .map(|i| {
                let t = f64::from(i);
                if i <= 30 {
                    Point::new(t + shift, 100.0 - t * 3.0)
                } else {
                    Point::new(t + shift, t.mul_add(2.0, -50.0))
                }
            })
            .collect();
        let mut o = Outline::new(Contour::new(pts), FeatureSetType::DorsalFin);
        o.set_feature_point(FeaturePointType::LeadingEdgeBegin, 0).unwrap();
        o.set_feature_point(FeaturePointType::LeadingEdgeEnd, 10).unwrap();
        o.set_feature_point(FeaturePointType::Tip, 30).unwrap();
        o.set_feature_point(FeaturePointType::Notch, 40).unwrap();
        o.set_feature_point(FeaturePointType::PointOfInflection, 59).unwrap();
        o
    }

    #[test]
    fn outline_factor_aligns_shifted_fin() {
        let factor = MatchFactor::outline(
            1.0,
            OutlineComparison {
                control: [
                    FeaturePointType::LeadingEdgeBegin,
                    FeaturePointType::Tip,
                    FeaturePointType::PointOfInflection,
                ],
                alternate_end: None,
                strategy: Box::new(FixedThreePoint {
                    range: ErrorRange::Full,
                }),
                metric: Box::new(MeanSquaredSegmentError),
            },
        );
        let outcome = factor.compare(&fin(0.0), &fin(7.0)).unwrap();
        assert!(outcome.error < 1e-9);
        assert!(outcome.registration.is_some());
    }

    #[test]
    fn missing_point_is_reported_before_comparing() {
        let factors = presets::dorsal_fin(&MatchConfig::default());
        let bare = Outline::new(fin(0.0).into_contour(), FeatureSetType::DorsalFin);
        assert!(matches!(
            factors[0].compare(&fin(0.0), &bare),
            Err(EngineError::MissingFeaturePoint(
                FeaturePointType::LeadingEdgeBegin
            ))
        ));
    }

    #[test]
    fn feature_factor_uses_feature_values() {
        let factor = MatchFactor::feature(
            0.1,
            FeatureType::HasMouthDent,
            Box::new(PresenceMismatch),
        );
        let mut a = fin(0.0);
        let mut b = fin(0.0);
        assert!(matches!(
            factor.compare(&a, &b),
            Err(EngineError::MissingFeature(FeatureType::HasMouthDent))
        ));
        a.set_feature(FeatureType::HasMouthDent, 1.0);
        b.set_feature(FeatureType::HasMouthDent, 0.0);
        let outcome = factor.compare(&a, &b).unwrap();
        assert!((outcome.error - 1.0).abs() < 1e-12);
        assert!(outcome.registration.is_none());
        assert_eq!(factor.feature_dependencies(), &[FeatureType::HasMouthDent]);
    }

    #[test]
    fn alternate_end_is_not_a_hard_dependency() {
        let factor = MatchFactor::outline(
            1.0,
            OutlineComparison {
                control: [
                    FeaturePointType::Nasion,
                    FeaturePointType::Tip,
                    FeaturePointType::PointOfInflection,
                ],
                alternate_end: Some(FeaturePointType::BottomLipProtrusion),
                strategy: Box::new(FixedThreePoint {
                    range: ErrorRange::Full,
                }),
                metric: Box::new(MeanSquaredSegmentError),
            },
        );
        assert_eq!(factor.point_dependencies().len(), 3);
        assert!(
            !factor
                .point_dependencies()
                .contains(&FeaturePointType::BottomLipProtrusion)
        );
    }
}
