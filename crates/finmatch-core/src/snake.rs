//! Greedy active contour ("snake") step.
//!
//! Each interior point looks at every integer offset within
//! `search_radius` of its current position and moves to the one with the
//! lowest weighted energy:
//!
//! - continuity: how far the distance to the previous point strays from
//!   the contour's mean spacing;
//! - linearity: squared discrete second derivative at the point;
//! - edge: negated gradient magnitude under the point.
//!
//! Each term is normalised over the neighbourhood being searched so the
//! weights are comparable regardless of image contrast or contour scale.
//! Endpoints stay fixed; they belong to the trace, not to the image.

use image::GrayImage;

use crate::contour::Contour;
use crate::types::{EnergyWeights, Point};

/// Per-candidate raw energy terms.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    position: Point,
    is_current: bool,
    continuity: f64,
    linearity: f64,
    edge: f64,
}

fn magnitude_at(magnitude: &GrayImage, p: Point) -> Option<f64> {
    let (x, y) = (p.x.round(), p.y.round());
    if x < 0.0 || y < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (x, y) = (x as u32, y as u32);
    magnitude
        .get_pixel_checked(x, y)
        .map(|px| f64::from(px.0[0]))
}

fn mean_spacing(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let total: f64 = points.windows(2).map(|w| w[0].distance(w[1])).sum();
    #[allow(clippy::cast_precision_loss)]
    let segments = (points.len() - 1) as f64;
    total / segments
}

/// Move every interior point of `contour` one greedy step downhill.
///
/// Coordinates are pixels of `magnitude`; offsets that fall outside the
/// image are not considered. Returns the number of points that moved.
pub fn move_contour(
    contour: &mut Contour,
    magnitude: &GrayImage,
    search_radius: u32,
    weights: &EnergyWeights,
) -> usize {
    let mut points = contour.points().to_vec();
    if points.len() < 3 {
        return 0;
    }
    let spacing = mean_spacing(&points);
    let r = i32::try_from(search_radius).unwrap_or(i32::MAX);

    let mut moved = 0;
    let mut candidates = Vec::new();
    for i in 1..points.len() - 1 {
        let (prev, current, next) = (points[i - 1], points[i], points[i + 1]);
        candidates.clear();
        for dy in -r..=r {
            for dx in -r..=r {
                let position = Point {
                    x: current.x + f64::from(dx),
                    y: current.y + f64::from(dy),
                    kind: current.kind,
                };
                let Some(edge) = magnitude_at(magnitude, position) else {
                    continue;
                };
                let bend_x = 2.0f64.mul_add(-position.x, prev.x) + next.x;
                let bend_y = 2.0f64.mul_add(-position.y, prev.y) + next.y;
                candidates.push(Candidate {
                    position,
                    is_current: dx == 0 && dy == 0,
                    continuity: (spacing - position.distance(prev)).abs(),
                    linearity: bend_x.mul_add(bend_x, bend_y * bend_y),
                    edge,
                });
            }
        }
        let best = lowest_energy(&candidates, weights);
        if let Some(best) = best {
            points[i] = best;
            moved += 1;
        }
    }

    *contour = Contour::with_scale(points, contour.scale());
    moved
}

/// Position of the lowest-energy candidate, or `None` when staying put
/// is at least as good.
fn lowest_energy(candidates: &[Candidate], weights: &EnergyWeights) -> Option<Point> {
    let max_of = |f: fn(&Candidate) -> f64| candidates.iter().map(f).fold(0.0_f64, f64::max);
    let max_continuity = max_of(|c| c.continuity);
    let max_linearity = max_of(|c| c.linearity);
    let max_edge = max_of(|c| c.edge);
    let min_edge = candidates.iter().map(|c| c.edge).fold(f64::INFINITY, f64::min);
    let edge_range = max_edge - min_edge;

    let normalise = |v: f64, max: f64| if max > 0.0 { v / max } else { 0.0 };
    let energy = |c: &Candidate| {
        let edge = if edge_range > 0.0 {
            (min_edge - c.edge) / edge_range
        } else {
            0.0
        };
        weights.edge.mul_add(
            edge,
            weights.continuity.mul_add(
                normalise(c.continuity, max_continuity),
                weights.linearity * normalise(c.linearity, max_linearity),
            ),
        )
    };

    let mut best: Option<(f64, &Candidate)> = None;
    for c in candidates {
        let e = energy(c);
        let better = best.is_none_or(|(best_e, _)| e < best_e || (c.is_current && e <= best_e));
        if better {
            best = Some((e, c));
        }
    }
    best.filter(|(_, c)| !c.is_current).map(|(_, c)| c.position)
}
