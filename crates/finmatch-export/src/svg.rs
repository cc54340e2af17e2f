//! SVG overlay of one match result.
//!
//! Draws the catalog outline and the unknown outline mapped into its
//! frame as two `<path>` elements, with circles on the registration
//! anchors of each. Document construction, XML escaping and path data
//! formatting come from the [`svg`] crate.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use svg::Document;
use svg::node::element::path::Data;
use svg::node::element::{Circle, Description, Element, Group, Path, Title};
use svg::node::{Node, Text, Value};

use finmatch_core::{Contour, ControlPoints, MatchResult};

/// Blank border around the outlines, in contour units.
const MARGIN: f64 = 10.0;
const CANDIDATE_STROKE: &str = "#1f5fbf";
const UNKNOWN_STROKE: &str = "#d0312d";
const ANCHOR_RADIUS: f64 = 2.5;

/// Metadata to embed in the SVG document.
///
/// When present, a `<title>` and/or `<desc>` element is emitted right
/// after the opening `<svg>` tag. Text is XML-escaped by the `svg` crate.
#[derive(Debug, Clone, Default)]
pub struct SvgMetadata<'a> {
    /// Emitted as `<title>`. Typically the two IDs being compared.
    pub title: Option<&'a str>,

    /// Emitted as `<desc>`.
    pub description: Option<&'a str>,

    /// Serialized match configuration, embedded under `<metadata>` in a
    /// namespaced `<finmatch:config>` element.
    pub config_json: Option<&'a str>,
}

/// Build an SVG path `d` attribute from a contour.
///
/// Uses `M` for the first point and `L` for the rest. Returns an empty
/// string for contours with fewer than 2 points.
///
/// # Examples
///
/// ```
/// use finmatch_core::Contour;
/// use finmatch_export::build_path_data;
///
/// let contour = Contour::from_xy(&[(10.0, 20.0), (30.0, 40.0)]);
/// assert_eq!(build_path_data(&contour), "M10,20 L30,40");
/// ```
#[must_use]
pub fn build_path_data(contour: &Contour) -> String {
    let points = contour.points();
    if points.len() < 2 {
        return String::new();
    }

    let first = &points[0];
    let mut data = Data::new().move_to((first.x, first.y));
    for p in &points[1..] {
        data = data.line_to((p.x, p.y));
    }
    String::from(Value::from(data))
}

/// Union of the bounding boxes of `contours`, as `(min_x, min_y, max_x, max_y)`.
fn joint_bounds<'a>(contours: impl IntoIterator<Item = &'a Contour>) -> Option<(f64, f64, f64, f64)> {
    contours
        .into_iter()
        .filter_map(Contour::bounds)
        .map(|r| (r.min().x, r.min().y, r.max().x, r.max().y))
        .reduce(|a, b| (a.0.min(b.0), a.1.min(b.1), a.2.max(b.2), a.3.max(b.3)))
}

fn outline_path(contour: &Contour, stroke: &str, id: &str) -> Option<Path> {
    let d = build_path_data(contour);
    (!d.is_empty()).then(|| {
        Path::new()
            .set("id", id)
            .set("d", d)
            .set("fill", "none")
            .set("stroke", stroke)
            .set("stroke-width", 1)
    })
}

fn anchor_markers(contour: &Contour, anchors: ControlPoints, stroke: &str, id: &str) -> Group {
    let mut group = Group::new().set("id", id);
    for (label, index) in ["begin", "tip", "end"].into_iter().zip(anchors.as_array()) {
        let Ok(p) = contour.point(index) else {
            continue;
        };
        group = group.add(
            Circle::new()
                .set("cx", p.x)
                .set("cy", p.y)
                .set("r", ANCHOR_RADIUS)
                .set("fill", stroke)
                .set("data-anchor", label)
                .set("data-index", index),
        );
    }
    group
}

/// Serialize one result's aligned outlines into an SVG document.
///
/// The `viewBox` is the joint bounding box of both outlines plus a
/// margin. A result without aligned contours produces an empty document.
#[must_use]
pub fn to_overlay_svg(result: &MatchResult, metadata: &SvgMetadata<'_>) -> String {
    let contours = [
        result.candidate_contour.as_ref(),
        result.unknown_contour.as_ref(),
    ];
    let (min_x, min_y, max_x, max_y) =
        joint_bounds(contours.into_iter().flatten()).unwrap_or((0.0, 0.0, 0.0, 0.0));
    let (x, y) = (min_x - MARGIN, min_y - MARGIN);
    let (w, h) = (
        2.0f64.mul_add(MARGIN, max_x - min_x),
        2.0f64.mul_add(MARGIN, max_y - min_y),
    );

    let mut doc = Document::new()
        .set("width", w)
        .set("height", h)
        .set("viewBox", (x, y, w, h));

    if let Some(title) = metadata.title {
        doc = doc.add(Title::new(title));
    }
    if let Some(description) = metadata.description {
        doc = doc.add(Description::new().add(Text::new(description)));
    }
    if let Some(config_json) = metadata.config_json {
        let mut config_el = Element::new("finmatch:config");
        config_el.assign("xmlns:finmatch", "https://finmatch.dev/ns/1");
        config_el.append(Text::new(config_json));
        let mut metadata_el = Element::new("metadata");
        metadata_el.append(config_el);
        doc = doc.add(metadata_el);
    }

    if let Some(candidate) = &result.candidate_contour {
        if let Some(path) = outline_path(candidate, CANDIDATE_STROKE, "candidate") {
            doc = doc.add(path);
        }
        if let Some(anchors) = result.candidate_points {
            doc = doc.add(anchor_markers(
                candidate,
                anchors,
                CANDIDATE_STROKE,
                "candidate-anchors",
            ));
        }
    }
    if let Some(unknown) = &result.unknown_contour {
        if let Some(path) = outline_path(unknown, UNKNOWN_STROKE, "unknown") {
            doc = doc.add(path);
        }
        if let Some(anchors) = result.unknown_points {
            doc = doc.add(anchor_markers(
                unknown,
                anchors,
                UNKNOWN_STROKE,
                "unknown-anchors",
            ));
        }
    }

    // The svg crate omits the XML declaration, so we prepend it.
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use finmatch_core::Point;

    use super::*;

    fn result(with_contours: bool) -> MatchResult {
        let candidate: Contour = (0..6).map(|i| Point::new(f64::from(i) * 10.0, 5.0)).collect();
        let unknown: Contour = (0..6).map(|i| Point::new(f64::from(i) * 10.0, 7.0)).collect();
        MatchResult {
            id: "F-01".to_owned(),
            name: String::new(),
            damage: String::new(),
            date: String::new(),
            location: String::new(),
            image: String::new(),
            position: 0,
            raw_errors: vec![0.5],
            error: 0.5,
            confidence: 0.5,
            rank: Some(1),
            unknown_points: Some(ControlPoints::new(0, 2, 5)),
            candidate_points: Some(ControlPoints::new(0, 3, 5)),
            unknown_contour: with_contours.then_some(unknown),
            candidate_contour: with_contours.then_some(candidate),
        }
    }

    #[test]
    fn build_path_data_short_contours_are_empty() {
        assert_eq!(build_path_data(&Contour::default()), "");
        assert_eq!(build_path_data(&Contour::from_xy(&[(5.0, 5.0)])), "");
    }

    #[test]
    fn build_path_data_three_points() {
        let contour = Contour::from_xy(&[(10.0, 15.0), (12.5, 18.3), (14.0, 20.1)]);
        assert_eq!(build_path_data(&contour), "M10,15 L12.5,18.3 L14,20.1");
    }

    #[test]
    fn overlay_has_both_outlines_and_anchors() {
        let svg = to_overlay_svg(&result(true), &SvgMetadata::default());
        assert!(svg.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert_eq!(svg.matches("<path").count(), 2);
        assert!(svg.contains(CANDIDATE_STROKE));
        assert!(svg.contains(UNKNOWN_STROKE));
        assert_eq!(svg.matches("<circle").count(), 6);
        assert!(svg.contains(r#"data-anchor="tip""#));
    }

    #[test]
    fn view_box_covers_both_outlines_with_margin() {
        let svg = to_overlay_svg(&result(true), &SvgMetadata::default());
        assert!(svg.contains(r#"viewBox="-10 -5 70 22""#), "{svg}");
    }

    #[test]
    fn result_without_contours_has_no_paths() {
        let svg = to_overlay_svg(&result(false), &SvgMetadata::default());
        assert!(svg.contains("<svg"));
        assert!(!svg.contains("<path"));
        assert!(!svg.contains("<circle"));
    }

    #[test]
    fn metadata_is_escaped() {
        let meta = SvgMetadata {
            title: Some("F-01 <vs> F-02"),
            description: Some("error & rank"),
            config_json: Some(r#"{"trim_steps":3}"#),
        };
        let svg = to_overlay_svg(&result(true), &meta);
        assert!(svg.contains("<title>F-01 &lt;vs&gt; F-02</title>"));
        assert!(svg.contains("error &amp; rank"));
        assert!(svg.contains("<finmatch:config"));
        assert!(svg.contains("xmlns:finmatch="));
    }
}
