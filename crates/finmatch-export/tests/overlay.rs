//! Integration test: match a small fin catalog and export the best
//! result as an SVG overlay and the whole set as JSON.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use finmatch_core::{
    Candidate, Catalog, CategoryFilter, Contour, FeaturePointType, FeatureSetType, MatchConfig,
    Outline, Point, match_catalog, presets,
};
use finmatch_export::{SvgMetadata, to_overlay_svg, to_summary_json};

fn fin(lean: f64) -> Outline {
    let pts: Vec<Point> = (0..50)
        .map(|i| {
            let t = f64::from(i);
            if i <= 25 {
                Point::new(t * (2.0 + lean), 100.0 - t * 4.0)
            } else {
                Point::new(25.0f64.mul_add(2.0 + lean, (t - 25.0) * 0.8), (t - 25.0) * 4.0)
            }
        })
        .collect();
    let mut o = Outline::new(Contour::new(pts), FeatureSetType::DorsalFin);
    o.set_feature_point(FeaturePointType::LeadingEdgeBegin, 0).unwrap();
    o.set_feature_point(FeaturePointType::Tip, 25).unwrap();
    o.set_feature_point(FeaturePointType::PointOfInflection, 49).unwrap();
    o
}

#[test]
fn best_match_exports_to_svg_and_json() {
    let catalog = Catalog::new(
        [0.0, 0.3, 0.8]
            .into_iter()
            .enumerate()
            .map(|(i, lean)| Candidate {
                position: 0,
                id: format!("F-{i}"),
                name: String::new(),
                damage: "Nicks".to_owned(),
                date: String::new(),
                location: String::new(),
                image: String::new(),
                outline: fin(lean),
            })
            .collect(),
    );
    let set = match_catalog(
        fin(0.3),
        catalog,
        presets::dorsal_fin(&MatchConfig::default()),
        &CategoryFilter::All,
    )
    .expect("match should succeed");
    let best = &set.results()[0];
    assert_eq!(best.id, "F-1");

    let svg = to_overlay_svg(
        best,
        &SvgMetadata {
            title: Some("unknown vs F-1"),
            ..SvgMetadata::default()
        },
    );
    assert!(svg.contains("<svg"));
    assert_eq!(svg.matches("<path").count(), 2);
    assert!(svg.contains("</svg>"));

    let json = to_summary_json(&set).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["results"].as_array().unwrap().len(), 3);
    assert_eq!(value["results"][0]["id"], "F-1");
}
