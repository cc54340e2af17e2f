//! Outline distance metrics.
//!
//! Both metrics compare two contours that are already in the same frame
//! (see [`crate::mapping`]) over spans delimited by [`ControlPoints`].
//! Each outline is split at its tip into a leading span
//! (`begin..=tip`) and a trailing span (`tip..=end`), and every span is
//! compared only with its counterpart on the other outline, so a point
//! on one fin's leading edge can never be matched to the other fin's
//! trailing edge.

use std::fmt;

use geo::{Area, Closest, ClosestPoint, Line, Triangle};
use rstar::RTree;
use rstar::primitives::GeomWithData;

use crate::contour::Contour;
use crate::outline::ControlPoints;
use crate::types::Point;

/// A distance between two aligned outlines over their matched spans.
///
/// Lower is more similar; identical spans score zero.
pub trait OutlineErrorFunction: fmt::Debug + Send + Sync {
    /// Distance between span `a_span` of `a` and span `b_span` of `b`.
    fn error_between(
        &self,
        a: &Contour,
        a_span: ControlPoints,
        b: &Contour,
        b_span: ControlPoints,
    ) -> f64;
}

/// Mean of squared distances from each point of `a` to the nearest
/// position on the corresponding polyline span of `b`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredSegmentError;

/// Area enclosed between the two outlines divided by the compared arc
/// length, i.e. their mean separation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AreaBetweenError;

type IndexedSegment = GeomWithData<Line<f64>, usize>;

/// Clamp a span to the contour and split it at the tip.
fn split_spans(contour: &Contour, span: ControlPoints) -> [&[Point]; 2] {
    let pts = contour.points();
    let Some(last) = pts.len().checked_sub(1) else {
        return [&[], &[]];
    };
    let end = span.end.min(last);
    let tip = span.tip.min(end);
    let begin = span.begin.min(tip);
    [&pts[begin..=tip], &pts[tip..=end]]
}

fn point_to_geo(p: Point) -> geo::Point<f64> {
    geo::Point::new(p.x, p.y)
}

fn closest_coord_on_line(line: &Line<f64>, query: &geo::Point<f64>) -> geo::Coord<f64> {
    match line.closest_point(query) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => p.into(),
        Closest::Indeterminate => line.start,
    }
}

/// Sum of squared distances from each `a` point to polyline `b`, and the
/// number of points summed.
fn squared_distances_to_polyline(a: &[Point], b: &[Point]) -> (f64, usize) {
    match b {
        [] => (0.0, 0),
        [only] => (a.iter().map(|p| p.distance_squared(*only)).sum(), a.len()),
        _ => {
            let segments: Vec<IndexedSegment> = b
                .windows(2)
                .enumerate()
                .map(|(i, w)| GeomWithData::new(Line::new(w[0], w[1]), i))
                .collect();
            let tree = RTree::bulk_load(segments);
            let mut sum = 0.0;
            let mut count = 0;
            for &p in a {
                let query = point_to_geo(p);
                if let Some(nearest) = tree.nearest_neighbor(&query) {
                    let on_b = closest_coord_on_line(nearest.geom(), &query);
                    let dx = on_b.x - p.x;
                    let dy = on_b.y - p.y;
                    sum += dx.mul_add(dx, dy * dy);
                    count += 1;
                }
            }
            (sum, count)
        }
    }
}

impl OutlineErrorFunction for MeanSquaredSegmentError {
    #[allow(clippy::cast_precision_loss)]
    fn error_between(
        &self,
        a: &Contour,
        a_span: ControlPoints,
        b: &Contour,
        b_span: ControlPoints,
    ) -> f64 {
        let a_parts = split_spans(a, a_span);
        let b_parts = split_spans(b, b_span);
        let (sum, count) = a_parts
            .iter()
            .zip(&b_parts)
            .map(|(pa, pb)| squared_distances_to_polyline(pa, pb))
            .fold((0.0, 0), |acc, (s, c)| (acc.0 + s, acc.1 + c));
        if count == 0 {
            return f64::INFINITY;
        }
        sum / count as f64
    }
}

fn polyline_length(pts: &[Point]) -> f64 {
    pts.windows(2).map(|w| w[0].distance(w[1])).sum()
}

/// `samples` points spread evenly by arc length along `pts`, including
/// both ends.
fn sample_by_arc_length(pts: &[Point], samples: usize) -> Vec<Point> {
    let total = polyline_length(pts);
    if pts.len() < 2 || samples < 2 || total <= 0.0 {
        return pts.first().map_or_else(Vec::new, |&p| vec![p; samples.max(1)]);
    }
    let mut out = Vec::with_capacity(samples);
    let mut seg = 0;
    let mut walked = 0.0;
    for k in 0..samples {
        #[allow(clippy::cast_precision_loss)]
        let target = total * k as f64 / (samples - 1) as f64;
        while seg + 2 < pts.len() && walked + pts[seg].distance(pts[seg + 1]) < target {
            walked += pts[seg].distance(pts[seg + 1]);
            seg += 1;
        }
        let (p, q) = (pts[seg], pts[seg + 1]);
        let len = p.distance(q);
        let t = if len > 0.0 {
            ((target - walked) / len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out.push(Point::new((q.x - p.x).mul_add(t, p.x), (q.y - p.y).mul_add(t, p.y)));
    }
    out
}

/// Area swept between two spans after pairing them point for point.
fn area_between_spans(a: &[Point], b: &[Point]) -> f64 {
    let samples = a.len().max(b.len());
    if samples < 2 {
        return 0.0;
    }
    let sa = sample_by_arc_length(a, samples);
    let sb = sample_by_arc_length(b, samples);
    let mut area = 0.0;
    for k in 0..samples - 1 {
        let (a0, a1, b0, b1) = (sa[k], sa[k + 1], sb[k], sb[k + 1]);
        area += Triangle::new(a0.into(), a1.into(), b1.into()).unsigned_area();
        area += Triangle::new(a0.into(), b1.into(), b0.into()).unsigned_area();
    }
    area
}

impl OutlineErrorFunction for AreaBetweenError {
    fn error_between(
        &self,
        a: &Contour,
        a_span: ControlPoints,
        b: &Contour,
        b_span: ControlPoints,
    ) -> f64 {
        let a_parts = split_spans(a, a_span);
        let b_parts = split_spans(b, b_span);
        let area: f64 = a_parts
            .iter()
            .zip(&b_parts)
            .map(|(pa, pb)| area_between_spans(pa, pb))
            .sum();
        let length: f64 = b_parts.iter().map(|pb| polyline_length(pb)).sum();
        if length <= 0.0 {
            return f64::INFINITY;
        }
        area / length
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn arch(offset_y: f64) -> Contour {
        (0..=40)
            .map(|i| {
                let x = f64::from(i) * 2.5;
                let y = (f64::from(i) - 20.0).abs().mul_add(-4.0, 100.0) + offset_y;
                Point::new(x, y)
            })
            .collect()
    }

    const SPAN: ControlPoints = ControlPoints::new(0, 20, 40);

    #[test]
    fn identical_outlines_have_zero_error() {
        let a = arch(0.0);
        assert!(MeanSquaredSegmentError.error_between(&a, SPAN, &a, SPAN) < 1e-12);
        assert!(AreaBetweenError.error_between(&a, SPAN, &a, SPAN) < 1e-9);
    }

    #[test]
    fn mean_squared_grows_with_offset() {
        let a = arch(0.0);
        let near = MeanSquaredSegmentError.error_between(&arch(1.0), SPAN, &a, SPAN);
        let far = MeanSquaredSegmentError.error_between(&arch(3.0), SPAN, &a, SPAN);
        assert!(near > 0.0);
        assert!(far > near);
    }

    #[test]
    fn projection_uses_segments_not_vertices() {
        // Point halfway along a segment, offset by 1 perpendicular.
        let b = Contour::from_xy(&[(0.0, 0.0), (10.0, 0.0), (20.0, 0.0)]);
        let a = Contour::from_xy(&[(0.0, 1.0), (5.0, 1.0), (10.0, 1.0), (15.0, 1.0), (20.0, 1.0)]);
        let err = MeanSquaredSegmentError.error_between(
            &a,
            ControlPoints::new(0, 2, 4),
            &b,
            ControlPoints::new(0, 1, 2),
        );
        assert!((err - 1.0).abs() < 1e-12);
    }

    #[test]
    fn area_error_is_mean_separation_for_parallel_lines() {
        let b = Contour::from_xy(&[(0.0, 0.0), (10.0, 0.0), (20.0, 0.0)]);
        let a = Contour::from_xy(&[(0.0, 2.0), (10.0, 2.0), (20.0, 2.0)]);
        let span = ControlPoints::new(0, 1, 2);
        let err = AreaBetweenError.error_between(&a, span, &b, span);
        assert!((err - 2.0).abs() < 1e-9);
    }

    #[test]
    fn area_error_ignores_point_density() {
        let b = Contour::from_xy(&[(0.0, 0.0), (20.0, 0.0), (40.0, 0.0)]);
        let a: Contour = (0..=40).map(|i| Point::new(f64::from(i), 3.0)).collect();
        let err = AreaBetweenError.error_between(
            &a,
            ControlPoints::new(0, 20, 40),
            &b,
            ControlPoints::new(0, 1, 2),
        );
        assert!((err - 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_contour_is_infinitely_far() {
        let a = arch(0.0);
        let empty = Contour::default();
        assert!(
            MeanSquaredSegmentError
                .error_between(&empty, SPAN, &a, SPAN)
                .is_infinite()
        );
    }

    #[test]
    fn arc_length_sampling_hits_ends() {
        let pts = [Point::new(0.0, 0.0), Point::new(3.0, 0.0), Point::new(3.0, 4.0)];
        let s = sample_by_arc_length(&pts, 8);
        assert_eq!(s.len(), 8);
        assert!(s[0].distance(pts[0]) < 1e-12);
        assert!(s[7].distance(pts[2]) < 1e-12);
        assert!(s[3].distance(Point::new(3.0, 0.0)) < 1e-12);
    }
}
