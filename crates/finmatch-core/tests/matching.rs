//! Integration tests: finalize raw traces, match them against a catalog,
//! and round-trip the results report.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use finmatch_core::registration::{RegistrationStrategy, TrimOptimal};
use finmatch_core::{
    Candidate, Catalog, CategoryFilter, Contour, ErrorRange, FeaturePointType, FeatureSetType,
    FeatureType, MatchConfig, MatchPipeline, MatchResultSet, Outline, Point, RegistrationMethod,
    RunControl, TraceConfig, finalize_trace, match_catalog, presets, worker,
};

/// Open trace along three sides of a square, 40 points per side.
fn square_trace() -> Contour {
    let mut pts = Vec::new();
    for i in 0..40 {
        pts.push(Point::new(0.0, 200.0 - f64::from(i) * 5.0));
    }
    for i in 0..40 {
        pts.push(Point::new(f64::from(i) * 5.0, 0.0));
    }
    for i in 0..40 {
        pts.push(Point::new(200.0, f64::from(i) * 5.0));
    }
    Contour::new(pts)
}

fn fin_outline(contour: Contour) -> Outline {
    let last = contour.len() - 1;
    let tip = contour.len() / 2;
    let mut o = Outline::new(contour, FeatureSetType::DorsalFin);
    o.set_feature_point(FeaturePointType::LeadingEdgeBegin, 0).unwrap();
    o.set_feature_point(FeaturePointType::Tip, tip).unwrap();
    o.set_feature_point(FeaturePointType::PointOfInflection, last).unwrap();
    o
}

fn candidate(id: &str, damage: &str, outline: Outline) -> Candidate {
    Candidate {
        position: 0,
        id: id.to_owned(),
        name: format!("{id} name"),
        damage: damage.to_owned(),
        date: "2024-06-01".to_owned(),
        location: "North Bay".to_owned(),
        image: format!("{id}.jpg"),
        outline,
    }
}

#[test]
fn finalized_trace_is_normalized_and_evenly_spaced() {
    let config = TraceConfig::default();
    let finished = finalize_trace(&square_trace(), &config).unwrap();

    let tip = finished.points()[finished.len() / 2];
    let base = finished.first().unwrap().midpoint(*finished.last().unwrap());
    // Resampling moves the pseudo-tip slightly; the scale is what was applied.
    assert!((tip.distance(base) - config.normalized_length).abs() < 3.0 * config.knot_spacing);
    assert!(finished.scale() > 1.0);

    for w in finished.points().windows(2) {
        let d = w[0].distance(w[1]);
        assert!(
            (d - config.knot_spacing).abs() < 1e-6,
            "uneven spacing {d}"
        );
    }
}

#[test]
fn trim_optimal_tip_aligns_shifted_copy() {
    let finished = finalize_trace(&square_trace(), &TraceConfig::default()).unwrap();
    let unknown = fin_outline(finished.clone());
    let shifted = fin_outline(finished.scaled(1.0, 5.0, 0.0));

    let config = MatchConfig {
        registration: RegistrationMethod::TrimOptimalTip,
        ..MatchConfig::default()
    };
    let strategy = TrimOptimal {
        move_tip: true,
        vary_trims: false,
        step_budget: config.optimal_step_budget,
        range: ErrorRange::Full,
    };
    fn anchor(o: &Outline) -> finmatch_core::registration::Anchored<'_> {
        finmatch_core::registration::Anchored::new(
            o.contour(),
            o.control_points([
                FeaturePointType::LeadingEdgeBegin,
                FeaturePointType::Tip,
                FeaturePointType::PointOfInflection,
            ])
            .unwrap(),
        )
    }
    let metric = config.registration.metric();
    let registration = strategy
        .register(anchor(&unknown), anchor(&shifted), metric.as_ref())
        .unwrap();
    assert!(registration.error < 1e-6, "error {}", registration.error);

    let set = match_catalog(
        unknown,
        Catalog::new(vec![candidate("S", "Nicks", shifted)]),
        presets::dorsal_fin(&config),
        &CategoryFilter::All,
    )
    .unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.results()[0].rank, Some(1));
}

/// Fin with a trailing edge notch of the given depth.
fn notched_fin(depth: f64) -> Outline {
    let pts: Vec<Point> = (0..90)
        .map(|i| {
            let t = f64::from(i);
            if i <= 45 {
                Point::new(t * 2.0, 150.0 - t * 3.0)
            } else {
                let dent = depth * (-(t - 65.0).powi(2) / 20.0).exp();
                Point::new(90.0 + (t - 45.0) * 0.5 - dent, (t - 45.0) * 3.4)
            }
        })
        .collect();
    fin_outline(Contour::new(pts))
}

fn fin_catalog() -> Catalog {
    Catalog::new(vec![
        candidate("DEEP", "Nicks", notched_fin(12.0)),
        candidate("SAME", "Nicks", notched_fin(4.0)),
        candidate("SMOOTH", "Missing Tip", notched_fin(0.0)),
        candidate("SHALLOW", "Nicks", notched_fin(2.0)),
    ])
}

#[test]
fn report_round_trip_restores_aligned_contours() {
    let unknown = notched_fin(4.0);
    let catalog = fin_catalog();
    let config = MatchConfig {
        registration: RegistrationMethod::Original3Point,
        ..MatchConfig::default()
    };
    let mut set = match_catalog(
        unknown.clone(),
        catalog.clone(),
        presets::dorsal_fin(&config),
        &CategoryFilter::All,
    )
    .unwrap();
    set.unknown_id = "SAME".to_owned();
    set.unknown_file = "unknown.json".to_owned();
    set.database_file = "catalog.json".to_owned();
    assert_eq!(set.find_rank("same"), Some(1));

    let text = set.to_report();
    assert!(text.contains("The ID is ranked 1"));

    let mut loaded = MatchResultSet::from_report(&text).unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded.results()[0].id, "SAME");
    loaded.restore_contours(&unknown, &catalog).unwrap();

    let best = &loaded.results()[0];
    assert_eq!(best.name, "SAME name");
    let mapped = best.unknown_contour.as_ref().unwrap();
    let target = best.candidate_contour.as_ref().unwrap();
    for (a, b) in mapped.points().iter().zip(target.points()) {
        assert!(a.distance(*b) < 1e-6);
    }
}

#[test]
fn category_filter_limits_the_run() {
    let config = MatchConfig::default();
    let pipeline = MatchPipeline::new(notched_fin(4.0), fin_catalog(), presets::dorsal_fin(&config))
        .unwrap();
    let mut progress = Vec::new();
    worker::drive(
        &pipeline,
        &CategoryFilter::only(["missing tip"]),
        &RunControl::new(),
        |p| progress.push(p),
    )
    .unwrap();
    assert_eq!(progress.len(), 4);
    let diagnostics = pipeline.diagnostics();
    assert_eq!(diagnostics.skipped, 3);
    let set = pipeline.into_result_set().unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.results()[0].id, "SMOOTH");
}

/// Muzzle profile; `k` varies its proportions.
fn muzzle(k: u32) -> Outline {
    let kf = f64::from(k);
    let pts: Vec<Point> = (0..80)
        .map(|i| {
            let t = f64::from(i);
            let lift =
                20.0 * (t / 80.0 * std::f64::consts::PI).sin() * 0.05f64.mul_add(kf, 1.0);
            let ripple = 0.4 * kf * (t * 0.2).cos();
            Point::new(t * 2.0, lift + ripple + 0.1 * kf * t)
        })
        .collect();
    let mut o = Outline::new(Contour::new(pts), FeatureSetType::Bear);
    o.set_feature_point(FeaturePointType::Nasion, 5).unwrap();
    o.set_feature_point(FeaturePointType::Tip, 30).unwrap();
    o.set_feature_point(FeaturePointType::Notch, 40).unwrap();
    o.set_feature_point(FeaturePointType::UpperLip, 50).unwrap();
    o.set_feature_point(FeaturePointType::BottomLipProtrusion, 65).unwrap();
    o.set_feature_point(FeaturePointType::PointOfInflection, 75).unwrap();
    o.set_feature(FeatureType::BrowCurvature, 0.1 * kf);
    o.set_feature(FeatureType::HasMouthDent, f64::from(k % 2));
    o
}

#[test]
fn bear_preset_ranks_the_same_bear_first() {
    let catalog = Catalog::new(
        (0..6)
            .map(|k| candidate(&format!("BEAR-{k}"), "Adult", muzzle(k)))
            .collect(),
    );
    let factors = presets::bear(&MatchConfig::default(), &catalog).unwrap();
    assert_eq!(factors.len(), 4);

    let unknown = {
        let source = muzzle(3);
        let mut moved = Outline::new(
            source.contour().scaled(1.0, 40.0, -7.0),
            FeatureSetType::Bear,
        );
        for (kind, index) in source.feature_points() {
            moved.set_feature_point(kind, index).unwrap();
        }
        for kind in [FeatureType::BrowCurvature, FeatureType::HasMouthDent] {
            moved.set_feature(kind, source.feature(kind).unwrap());
        }
        moved
    };

    let set = match_catalog(unknown, catalog, factors, &CategoryFilter::All).unwrap();
    assert_eq!(set.len(), 6);
    assert_eq!(set.results()[0].id, "BEAR-3");
    assert!(set.results()[0].error < 1e-6);
    assert!(set.results().iter().all(|r| r.raw_errors.len() == 4));
    assert!(set.results()[0].confidence > set.results()[5].confidence);
}

#[test]
fn bear_preset_needs_a_catalog() {
    let catalog = Catalog::new(vec![candidate("ONLY", "Adult", muzzle(0))]);
    assert!(matches!(
        presets::bear(&MatchConfig::default(), &catalog),
        Err(finmatch_core::EngineError::InsufficientCatalog)
    ));
}
