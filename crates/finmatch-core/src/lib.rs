//! finmatch-core: outline matching for photo-identification (sans-IO).
//!
//! Takes traced outlines of dorsal fins or bear muzzles and ranks a
//! catalog of known individuals against an unknown one:
//! contour finalization -> optional edge refinement -> registration ->
//! error functions -> per-factor rescale -> ranked results.
//!
//! This crate has **no I/O dependencies**: it works on in-memory images
//! and structs. Reading catalogs and writing reports lives in
//! `finmatch-cli`; rendering lives in `finmatch-export`.

pub mod contour;
pub mod diagnostics;
pub mod edge;
pub mod error_fn;
pub mod factor;
pub mod feature_error;
pub mod mapping;
pub mod outline;
pub mod pipeline;
pub mod ratio;
pub mod refine;
pub mod registration;
pub mod results;
pub mod snake;
pub mod types;
pub mod worker;

pub use contour::{Contour, finalize_trace};
pub use diagnostics::{Clock, RunDiagnostics, SystemClock};
pub use edge::{CannyEdgeDetector, EdgeChannel, EdgeDetector, EdgeMaps};
pub use factor::{MatchFactor, presets};
pub use outline::{ControlPoints, FeaturePointType, FeatureSetType, FeatureType, Outline};
pub use pipeline::{Candidate, Catalog, CategoryFilter, MatchPipeline, RunState};
pub use refine::EdgeRefiner;
pub use registration::{ErrorRange, Registration, RegistrationMethod};
pub use results::{MatchResult, MatchResultSet, SortKey};
pub use types::{
    Dimensions, EngineError, MatchConfig, Point, PointType, SnakeConfig, TraceConfig, Window,
};
pub use worker::RunControl;

/// Match `unknown` against every candidate of `catalog` in one call.
///
/// Equivalent to building a [`MatchPipeline`] and driving it with
/// [`worker::drive`] without pause or cancel.
///
/// # Errors
///
/// Returns [`EngineError::NoFactors`] for an empty factor list,
/// missing feature point errors for an unknown outline the factors
/// cannot read, and [`EngineError::NoCandidates`] when no candidate
/// produced a result.
pub fn match_catalog(
    unknown: Outline,
    catalog: Catalog,
    factors: Vec<MatchFactor>,
    filter: &CategoryFilter,
) -> Result<MatchResultSet, EngineError> {
    let pipeline = MatchPipeline::new(unknown, catalog, factors)?;
    worker::drive(&pipeline, filter, &RunControl::new(), |_| {})?;
    pipeline.into_result_set()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Two-sided fin with the tip at index 30.
    fn fin(dx: f64, bump: f64) -> Outline {
        let points: Vec<Point> = (0..60)
            .map(|i| {
                let t = f64::from(i);
                let y = if i <= 30 {
                    100.0 - t * 3.0
                } else {
                    t.mul_add(2.0, -50.0) + bump * (t - 30.0).sin()
                };
                Point::new(t + dx, y)
            })
            .collect();
        let mut o = Outline::new(Contour::new(points), FeatureSetType::DorsalFin);
        o.set_feature_point(FeaturePointType::LeadingEdgeBegin, 0).unwrap();
        o.set_feature_point(FeaturePointType::LeadingEdgeEnd, 10).unwrap();
        o.set_feature_point(FeaturePointType::Tip, 30).unwrap();
        o.set_feature_point(FeaturePointType::Notch, 40).unwrap();
        o.set_feature_point(FeaturePointType::PointOfInflection, 59).unwrap();
        o
    }

    fn candidate(id: &str, outline: Outline) -> Candidate {
        Candidate {
            position: 0,
            id: id.to_owned(),
            name: String::new(),
            damage: "Nicks".to_owned(),
            date: String::new(),
            location: String::new(),
            image: String::new(),
            outline,
        }
    }

    #[test]
    fn identical_fin_ranks_first() {
        let config = MatchConfig {
            registration: RegistrationMethod::Original3Point,
            ..MatchConfig::default()
        };
        let catalog = Catalog::new(vec![
            candidate("FAR", fin(0.0, 6.0)),
            candidate("SAME", fin(12.0, 0.0)),
            candidate("NEAR", fin(0.0, 2.0)),
        ]);
        let set = match_catalog(
            fin(0.0, 0.0),
            catalog,
            presets::dorsal_fin(&config),
            &CategoryFilter::All,
        )
        .unwrap();
        let ids: Vec<&str> = set.results().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["SAME", "NEAR", "FAR"]);
        assert!(set.results()[0].error < 1e-9);
        assert!(set.results()[0].unknown_contour.is_some());
    }
}
