//! Ordered-point contours and the geometry operations on them.
//!
//! A [`Contour`] is the traced boundary of a fin or muzzle: an ordered,
//! open polyline plus a `scale` recording how many stored units
//! correspond to one image pixel. Tracing tools hand over a raw,
//! irregular polyline; [`finalize_trace`] turns it into the canonical
//! form every other stage expects:
//!
//! 1. [`Contour::normalize`] scales the points so the pseudo-tip to
//!    pseudo-base distance is a fixed length.
//! 2. [`Contour::remove_knots`] drops bunched points and hairpin turns.
//! 3. [`Contour::resample`] re-walks the curve with evenly spaced points.
//!
//! Resampling and knot removal both reject edges whose bearing changes
//! by more than a turn-angle threshold relative to the previous kept
//! edge. Bearings come from `atan2`, so the change is wraparound
//! corrected into `[0, 180]` before comparison.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{EngineError, Point, PointType, TraceConfig, bearing_change};

/// Distances closer than this are treated as equal when deciding
/// whether a point lies exactly on the resampling circle.
const GEOMETRY_EPSILON: f64 = 1e-9;

const fn unit_scale() -> f64 {
    1.0
}

/// An ordered sequence of points with a pixels-to-units scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contour {
    points: Vec<Point>,
    /// Stored units per image pixel. `1.0` means the points are in pixel
    /// coordinates.
    #[serde(default = "unit_scale")]
    scale: f64,
}

impl Default for Contour {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FromIterator<Point> for Contour {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Contour {
    /// Create a contour in pixel coordinates.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self { points, scale: 1.0 }
    }

    /// Create a contour whose points are already scaled.
    #[must_use]
    pub const fn with_scale(points: Vec<Point>, scale: f64) -> Self {
        Self { points, scale }
    }

    /// Build a contour from `(x, y)` pairs.
    #[must_use]
    pub fn from_xy(coords: &[(f64, f64)]) -> Self {
        coords.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    #[must_use]
    pub fn first(&self) -> Option<&Point> {
        self.points.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Point> {
        self.points.last()
    }

    #[must_use]
    pub const fn scale(&self) -> f64 {
        self.scale
    }

    pub const fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    /// The point at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IndexOutOfRange`] past the end.
    pub fn point(&self, index: usize) -> Result<Point, EngineError> {
        self.points
            .get(index)
            .copied()
            .ok_or(EngineError::IndexOutOfRange {
                index,
                len: self.len(),
            })
    }

    /// Append a point.
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Insert a point before `index` (`index == len` appends).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IndexOutOfRange`] if `index > len`.
    pub fn insert_point(&mut self, index: usize, point: Point) -> Result<(), EngineError> {
        if index > self.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        self.points.insert(index, point);
        Ok(())
    }

    /// Remove and return the point at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IndexOutOfRange`] past the end.
    pub fn remove_point(&mut self, index: usize) -> Result<Point, EngineError> {
        if index >= self.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok(self.points.remove(index))
    }

    /// Drop up to `count` points from the front.
    pub fn pop_front(&mut self, count: usize) {
        let count = count.min(self.len());
        self.points.drain(..count);
    }

    /// Drop up to `count` points from the back.
    pub fn pop_tail(&mut self, count: usize) {
        let keep = self.len().saturating_sub(count);
        self.points.truncate(keep);
    }

    /// Mark the points at `indices` as feature points and every other
    /// point as normal. Out-of-range indices are ignored.
    pub fn tag_feature_points(&mut self, indices: &[usize]) {
        for p in &mut self.points {
            p.kind = PointType::Normal;
        }
        for &i in indices {
            if let Some(p) = self.points.get_mut(i) {
                p.kind = PointType::Feature;
            }
        }
    }

    /// Sum of edge lengths; `closed` adds the edge from the last point
    /// back to the first.
    #[must_use]
    pub fn total_length(&self, closed: bool) -> f64 {
        let open: f64 = self
            .points
            .windows(2)
            .map(|w| w[0].distance(w[1]))
            .sum();
        match (closed, self.points.first(), self.points.last()) {
            (true, Some(&first), Some(&last)) if self.len() > 2 => open + last.distance(first),
            _ => open,
        }
    }

    /// Axis-aligned bounding box, or `None` when empty.
    #[must_use]
    pub fn bounds(&self) -> Option<geo::Rect<f64>> {
        let first = self.points.first()?;
        let (mut min, mut max) = ((first.x, first.y), (first.x, first.y));
        for p in &self.points[1..] {
            min = (min.0.min(p.x), min.1.min(p.y));
            max = (max.0.max(p.x), max.1.max(p.y));
        }
        Some(geo::Rect::new(
            geo::Coord { x: min.0, y: min.1 },
            geo::Coord { x: max.0, y: max.1 },
        ))
    }

    /// Index of the stored point nearest to `(x, y)`, comparing in raw
    /// stored coordinates.
    fn nearest_index(&self, x: f64, y: f64) -> Option<usize> {
        let target = Point::new(x, y);
        self.points
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.distance_squared(target)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Index of the point nearest to the pixel position `(x, y)`.
    ///
    /// Stored points are divided by the contour's scale before the
    /// comparison, so `(x, y)` is always in image pixels. Returns `None`
    /// for an empty contour.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn find_closest_point(&self, x: f64, y: f64) -> Option<usize> {
        if self.scale == 1.0 || self.scale == 0.0 {
            return self.nearest_index(x, y);
        }
        self.nearest_index(x * self.scale, y * self.scale)
    }

    /// Scale every point so the pseudo-tip (the point at index `len / 2`)
    /// lies exactly `target_length` from the pseudo-base (midpoint of the
    /// two end points). Returns the factor applied; the contour's scale is
    /// multiplied by the same factor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DegenerateContour`] for fewer than two points
    /// or when the pseudo-tip coincides with the pseudo-base.
    pub fn normalize(&mut self, target_length: f64) -> Result<f64, EngineError> {
        let (Some(&first), Some(&last)) = (self.points.first(), self.points.last()) else {
            return Err(EngineError::DegenerateContour);
        };
        if self.len() < 2 {
            return Err(EngineError::DegenerateContour);
        }
        let tip = self.points[self.len() / 2];
        let base = first.midpoint(last);
        let dist = tip.distance(base);
        if dist <= GEOMETRY_EPSILON {
            return Err(EngineError::DegenerateContour);
        }

        let factor = target_length / dist;
        for p in &mut self.points {
            p.x *= factor;
            p.y *= factor;
        }
        self.scale *= factor;
        debug!(factor, points = self.len(), "normalized contour");
        Ok(factor)
    }

    /// Divide every point by the scale and reset the scale to one, so the
    /// points are back in image pixels.
    #[allow(clippy::float_cmp)]
    pub fn apply_scale(&mut self) {
        if self.scale == 1.0 || self.scale == 0.0 {
            return;
        }
        for p in &mut self.points {
            p.x /= self.scale;
            p.y /= self.scale;
        }
        self.scale = 1.0;
    }

    /// A copy with every point multiplied by `factor` and then offset.
    ///
    /// Contours with fewer than three points are copied unchanged.
    #[must_use]
    pub fn scaled(&self, factor: f64, x_offset: f64, y_offset: f64) -> Self {
        if self.len() < 3 {
            return self.clone();
        }
        let points = self
            .points
            .iter()
            .map(|p| Point {
                x: p.x.mul_add(factor, x_offset),
                y: p.y.mul_add(factor, y_offset),
                kind: p.kind,
            })
            .collect();
        Self::with_scale(points, self.scale * factor)
    }

    /// Mirror the contour around the vertical centre line of an image of
    /// the given pixel width.
    pub fn flip_horizontally(&mut self, image_width: f64) {
        let width = image_width * self.scale;
        for p in &mut self.points {
            p.x = (p.x - width).abs();
        }
    }

    /// Translate into the coordinate frame of a pixel window, dropping
    /// points that fall outside it.
    pub fn crop(&mut self, left: f64, top: f64, right: f64, bottom: f64) {
        let scale = self.scale;
        self.points.retain_mut(|p| {
            let (x, y) = (p.x / scale, p.y / scale);
            if x < left || x > right || y < top || y > bottom {
                return false;
            }
            p.x = (x - left) * scale;
            p.y = (y - top) * scale;
            true
        });
    }

    /// Translate so the bounding box's minimum corner is the origin.
    pub fn clip_to_bounds(&mut self) {
        if let Some(rect) = self.bounds() {
            let min = rect.min();
            for p in &mut self.points {
                p.x -= min.x;
                p.y -= min.y;
            }
        }
    }

    /// Insert a point next to its nearest neighbour, on whichever side
    /// keeps the contour ordered. Returns the index of the new point.
    pub fn add_point_in_order(&mut self, x: f64, y: f64) -> usize {
        let new = Point::new(x, y);
        let Some(position) = self.nearest_index(x, y) else {
            self.points.push(new);
            return 0;
        };
        let last = self.len() - 1;
        if last == 0 {
            self.points.push(new);
            return 1;
        }

        let faces = |from: Point, toward: Point| {
            let (ax, ay) = (toward.x - from.x, toward.y - from.y);
            let (bx, by) = (new.x - from.x, new.y - from.y);
            ax.mul_add(bx, ay * by) > 0.0
        };

        let index = if position == 0 {
            if faces(self.points[0], self.points[1]) {
                1
            } else {
                0
            }
        } else if position == last {
            if faces(self.points[last], self.points[last - 1]) {
                last
            } else {
                last + 1
            }
        } else if new.distance_squared(self.points[position - 1])
            < new.distance_squared(self.points[position + 1])
        {
            position
        } else {
            position + 1
        };
        self.points.insert(index, new);
        index
    }

    /// Resample with the default turn-angle limit. See [`Self::resample`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] unless `spacing` is positive.
    pub fn evenly_space(&self, spacing: f64) -> Result<Self, EngineError> {
        self.resample(spacing, TraceConfig::DEFAULT_MAX_TURN_ANGLE, false)
    }

    /// Resample as a closed loop, wrapping back to the first point and
    /// accepting any turn. See [`Self::resample`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] unless `spacing` is positive.
    pub fn evenly_space_closed(&self, spacing: f64) -> Result<Self, EngineError> {
        self.resample(spacing, TraceConfig::CLOSED_LOOP_TURN_ANGLE, true)
    }

    /// Walk the polyline placing a new point every `spacing` units.
    ///
    /// Each accepted point is the centre of a circle of radius `spacing`;
    /// the next output point is where that circle first crosses the
    /// remaining input polyline. A crossing whose edge turns more than
    /// `max_turn_angle` degrees from the previous output edge is skipped
    /// and the walk moves on to the next input point. The first output
    /// point is the first input point and the first edge is unrestricted.
    ///
    /// Inputs with fewer than three points are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] unless `spacing` is a
    /// positive finite number.
    #[allow(clippy::too_many_lines)]
    pub fn resample(
        &self,
        spacing: f64,
        max_turn_angle: f64,
        closed_loop: bool,
    ) -> Result<Self, EngineError> {
        if !spacing.is_finite() || spacing <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "resample spacing must be positive, got {spacing}"
            )));
        }
        let src = &self.points;
        let n = src.len();
        if n < 3 {
            return Ok(self.clone());
        }

        let mut out = vec![Point::new(src[0].x, src[0].y)];
        // Circle centre: the last accepted output point.
        let mut cc = out[0];
        // Start of the input edge currently intersected with the circle.
        let mut vs = cc;
        let mut vs_at_centre = true;
        let mut idx = 1;
        let mut wrapped = false;
        let mut prev_bearing: Option<f64> = None;

        let turn_ok = |prev: Option<f64>, bearing: f64| {
            prev.is_none_or(|prev| bearing_change(prev, bearing) <= max_turn_angle)
        };

        loop {
            if idx == n {
                if closed_loop && !wrapped {
                    wrapped = true;
                    idx = 0;
                } else {
                    break;
                }
            }
            let p = src[idx];
            let t_len = cc.distance(p);

            if (t_len - spacing).abs() <= GEOMETRY_EPSILON {
                // p sits on the circle.
                let bearing = cc.bearing_to(p);
                if turn_ok(prev_bearing, bearing) {
                    let q = Point::new(p.x, p.y);
                    out.push(q);
                    prev_bearing = Some(bearing);
                    cc = q;
                }
                vs = cc;
                vs_at_centre = true;
                idx += 1;
            } else if t_len > spacing {
                let q = if vs_at_centre {
                    let r = spacing / t_len;
                    Point::new((p.x - cc.x).mul_add(r, cc.x), (p.y - cc.y).mul_add(r, cc.y))
                } else {
                    circle_crossing(cc, spacing, vs, p)
                };
                let bearing = cc.bearing_to(q);
                if turn_ok(prev_bearing, bearing) {
                    out.push(q);
                    prev_bearing = Some(bearing);
                    cc = q;
                    vs = q;
                    vs_at_centre = true;
                    continue;
                }
                if vs_at_centre {
                    idx += 1;
                } else {
                    vs = cc;
                    vs_at_centre = true;
                }
            } else {
                // p is inside the circle: extend the edge.
                vs = p;
                vs_at_centre = false;
                idx += 1;
            }

            if wrapped && idx == 1 {
                break;
            }
        }

        debug!(
            input = n,
            output = out.len(),
            spacing,
            closed_loop,
            "resampled contour"
        );
        Ok(Self::with_scale(out, self.scale))
    }

    /// Remove bunched points and hairpin turns with the default
    /// turn-angle limit. See [`Self::remove_knots_with_turn_limit`].
    pub fn remove_knots(&mut self, spacing: f64) -> usize {
        self.remove_knots_with_turn_limit(spacing, TraceConfig::DEFAULT_MAX_TURN_ANGLE)
    }

    /// Remove knots in two linear passes and return how many points were
    /// dropped.
    ///
    /// 1. Any point closer than `spacing - 1` to the previous kept point
    ///    is removed.
    /// 2. Any point whose incoming edge turns more than `max_turn_angle`
    ///    degrees from the previous kept edge, or that has ended up closer
    ///    than `spacing - 1` to its predecessor, is removed.
    ///
    /// Every kept edge therefore satisfies both limits with respect to
    /// its predecessor, which makes a second call a no-op.
    pub fn remove_knots_with_turn_limit(&mut self, spacing: f64, max_turn_angle: f64) -> usize {
        let before = self.len();
        if before < 2 {
            return 0;
        }
        let min_gap = spacing - 1.0;

        let mut kept: Option<Point> = None;
        self.points.retain(|&p| {
            if kept.is_some_and(|k| p.distance(k) < min_gap) {
                return false;
            }
            kept = Some(p);
            true
        });

        let mut kept: Option<Point> = None;
        let mut prev_bearing: Option<f64> = None;
        self.points.retain(|&to| {
            let Some(from) = kept else {
                kept = Some(to);
                return true;
            };
            let bearing = from.bearing_to(to);
            let too_sharp =
                prev_bearing.is_some_and(|prev| bearing_change(prev, bearing) > max_turn_angle);
            if too_sharp || to.distance(from) < min_gap {
                return false;
            }
            kept = Some(to);
            prev_bearing = Some(bearing);
            true
        });

        let removed = before - self.len();
        if removed > 0 {
            debug!(removed, remaining = self.len(), "removed knots");
        }
        removed
    }

    /// Keep only the span between the points nearest to `start` and `end`,
    /// reversing it if `end` comes first, then put the exact `start` and
    /// `end` points at the two ends.
    ///
    /// Targets are compared in stored coordinates. Returns `false` (and
    /// leaves the contour untouched) when the contour is empty.
    #[must_use = "returns false when nothing could be trimmed"]
    pub fn trim_and_reorder(&mut self, start: Point, end: Point) -> bool {
        let (Some(start_pos), Some(end_pos)) = (
            self.nearest_index(start.x, start.y),
            self.nearest_index(end.x, end.y),
        ) else {
            return false;
        };

        let reverse = end_pos < start_pos;
        let (lo, hi) = if reverse {
            (end_pos, start_pos)
        } else {
            (start_pos, end_pos)
        };
        self.points.truncate(hi + 1);
        self.points.drain(..lo);
        if reverse {
            self.points.reverse();
        }
        self.points.insert(0, start);
        self.points.push(end);
        true
    }
}

/// Point where the edge `vs -> p` leaves the circle of radius `radius`
/// around `centre`, for `vs` inside the circle and `p` outside it.
///
/// A negative discriminant cannot happen for that configuration; if
/// rounding produces one anyway the midpoint of the edge is used.
fn circle_crossing(centre: Point, radius: f64, vs: Point, p: Point) -> Point {
    let (vx, vy) = (p.x - vs.x, p.y - vs.y);
    let (wx, wy) = (vs.x - centre.x, vs.y - centre.y);
    let a = vx.mul_add(vx, vy * vy);
    let b = 2.0 * wx.mul_add(vx, wy * vy);
    let c = radius.mul_add(-radius, wx.mul_add(wx, wy * wy));
    let disc = b.mul_add(b, -4.0 * a * c);

    let t = if disc < 0.0 || a <= GEOMETRY_EPSILON {
        warn!(disc, a, "negative radical in circle crossing, using edge midpoint");
        0.5
    } else {
        let root = disc.sqrt();
        let t1 = (-b + root) / (2.0 * a);
        let t2 = (-b - root) / (2.0 * a);
        if (0.0..=1.0).contains(&t1) { t1 } else { t2.clamp(0.0, 1.0) }
    };
    Point::new(vx.mul_add(t, vs.x), vy.mul_add(t, vs.y))
}

/// Bring a freshly traced contour into canonical form: normalize, then
/// remove knots and resample (open traces) or resample as a loop
/// (closed traces).
///
/// # Errors
///
/// Returns [`EngineError::InvalidConfig`] for a bad `config`,
/// [`EngineError::EmptyContour`] for an empty trace, and
/// [`EngineError::DegenerateContour`] when it cannot be normalized.
pub fn finalize_trace(contour: &Contour, config: &TraceConfig) -> Result<Contour, EngineError> {
    config.validate()?;
    if contour.is_empty() {
        return Err(EngineError::EmptyContour);
    }
    let mut working = contour.clone();
    working.normalize(config.normalized_length)?;
    let finished = if config.closed_loop {
        working.resample(config.knot_spacing, config.turn_angle(), true)?
    } else {
        working.remove_knots_with_turn_limit(config.knot_spacing, config.max_turn_angle);
        working.resample(config.knot_spacing, config.max_turn_angle, false)?
    };
    debug!(
        raw = contour.len(),
        finished = finished.len(),
        "finalized trace"
    );
    Ok(finished)
}
