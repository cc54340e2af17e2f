//! Outlines: a contour plus named anatomical anchors and scalar features.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contour::Contour;
use crate::types::{EngineError, Point};

/// Named anchor positions on a traced outline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeaturePointType {
    LeadingEdgeBegin,
    LeadingEdgeEnd,
    Notch,
    Tip,
    PointOfInflection,
    Nasion,
    UpperLip,
    BottomLipProtrusion,
    Eye,
    NasalLateralCommissure,
}

/// Scalar or boolean features measured on an outline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureType {
    /// Curvature of the brow between nasion and forehead.
    BrowCurvature,
    /// `1.0` when the mouth shows a dent, `0.0` otherwise.
    HasMouthDent,
}

/// Which kind of animal outline this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FeatureSetType {
    #[default]
    DorsalFin,
    Bear,
}

impl FeatureSetType {
    /// Feature points whose indices must increase along the contour, in
    /// order. The first pair may coincide.
    #[must_use]
    pub const fn anatomical_order(self) -> &'static [FeaturePointType] {
        match self {
            Self::DorsalFin => &[
                FeaturePointType::LeadingEdgeBegin,
                FeaturePointType::LeadingEdgeEnd,
                FeaturePointType::Tip,
                FeaturePointType::Notch,
                FeaturePointType::PointOfInflection,
            ],
            Self::Bear => &[],
        }
    }
}

/// Three anchor indices into a contour: where the compared span begins,
/// its tip, and where it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPoints {
    pub begin: usize,
    pub tip: usize,
    pub end: usize,
}

impl ControlPoints {
    #[must_use]
    pub const fn new(begin: usize, tip: usize, end: usize) -> Self {
        Self { begin, tip, end }
    }

    /// `begin < tip < end`.
    #[must_use]
    pub const fn is_ordered(self) -> bool {
        self.begin < self.tip && self.tip < self.end
    }

    /// `true` when every index is inside a contour of `len` points.
    #[must_use]
    pub const fn fits(self, len: usize) -> bool {
        self.begin < len && self.tip < len && self.end < len
    }

    #[must_use]
    pub const fn as_array(self) -> [usize; 3] {
        [self.begin, self.tip, self.end]
    }
}

/// A traced outline with its anatomical anchors.
///
/// Deserialization replays every anchor through
/// [`Outline::set_feature_point`], so out-of-range or out-of-order anchors
/// in a stored outline are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OutlineRecord")]
pub struct Outline {
    contour: Contour,
    #[serde(default)]
    feature_set: FeatureSetType,
    #[serde(default)]
    feature_points: BTreeMap<FeaturePointType, usize>,
    #[serde(default)]
    features: BTreeMap<FeatureType, f64>,
}

/// Unchecked mirror of [`Outline`] as it appears on disk.
#[derive(Deserialize)]
struct OutlineRecord {
    contour: Contour,
    #[serde(default)]
    feature_set: FeatureSetType,
    #[serde(default)]
    feature_points: BTreeMap<FeaturePointType, usize>,
    #[serde(default)]
    features: BTreeMap<FeatureType, f64>,
}

impl TryFrom<OutlineRecord> for Outline {
    type Error = EngineError;

    fn try_from(record: OutlineRecord) -> Result<Self, Self::Error> {
        let mut outline = Self::new(record.contour, record.feature_set);
        for (kind, index) in record.feature_points {
            outline.set_feature_point(kind, index)?;
        }
        outline.features = record.features;
        Ok(outline)
    }
}

impl Outline {
    /// An outline with no anchors yet.
    #[must_use]
    pub const fn new(contour: Contour, feature_set: FeatureSetType) -> Self {
        Self {
            contour,
            feature_set,
            feature_points: BTreeMap::new(),
            features: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn contour(&self) -> &Contour {
        &self.contour
    }

    #[must_use]
    pub fn into_contour(self) -> Contour {
        self.contour
    }

    #[must_use]
    pub const fn feature_set(&self) -> FeatureSetType {
        self.feature_set
    }

    /// Anchor index for `kind`, if set.
    #[must_use]
    pub fn feature_point(&self, kind: FeaturePointType) -> Option<usize> {
        self.feature_points.get(&kind).copied()
    }

    /// Anchor index for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingFeaturePoint`] when unset.
    pub fn require_feature_point(&self, kind: FeaturePointType) -> Result<usize, EngineError> {
        self.feature_point(kind)
            .ok_or(EngineError::MissingFeaturePoint(kind))
    }

    /// Contour coordinate of the anchor for `kind`, if set.
    #[must_use]
    pub fn feature_point_coordinate(&self, kind: FeaturePointType) -> Option<Point> {
        self.feature_point(kind)
            .and_then(|i| self.contour.points().get(i).copied())
    }

    /// All anchors in key order.
    pub fn feature_points(&self) -> impl Iterator<Item = (FeaturePointType, usize)> + '_ {
        self.feature_points.iter().map(|(&k, &v)| (k, v))
    }

    #[must_use]
    pub fn contains_all_feature_points(&self, kinds: &[FeaturePointType]) -> bool {
        kinds.iter().all(|k| self.feature_points.contains_key(k))
    }

    /// Set the anchor for `kind`, checking it lies on the contour and
    /// respects the anatomical order of any anchors already set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IndexOutOfRange`] or
    /// [`EngineError::FeaturePointOrder`]; the outline is unchanged on
    /// error.
    pub fn set_feature_point(
        &mut self,
        kind: FeaturePointType,
        index: usize,
    ) -> Result<(), EngineError> {
        if index >= self.contour.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.contour.len(),
            });
        }
        let chain = self.feature_set.anatomical_order();
        if let Some(position) = chain.iter().position(|&k| k == kind) {
            for (other_position, &other) in chain.iter().enumerate() {
                let Some(other_index) = self.feature_point(other) else {
                    continue;
                };
                // Only the leading-edge pair may share an index.
                let may_coincide = position.min(other_position) == 0
                    && position.max(other_position) == 1;
                let ordered = match other_position.cmp(&position) {
                    std::cmp::Ordering::Less => {
                        other_index < index || (may_coincide && other_index == index)
                    }
                    std::cmp::Ordering::Greater => {
                        other_index > index || (may_coincide && other_index == index)
                    }
                    std::cmp::Ordering::Equal => true,
                };
                if !ordered {
                    return Err(EngineError::FeaturePointOrder { point: kind, index });
                }
            }
        }
        self.feature_points.insert(kind, index);
        self.retag();
        Ok(())
    }

    /// Scalar feature value, if set.
    #[must_use]
    pub fn feature(&self, kind: FeatureType) -> Option<f64> {
        self.features.get(&kind).copied()
    }

    /// Scalar feature value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingFeature`] when unset.
    pub fn require_feature(&self, kind: FeatureType) -> Result<f64, EngineError> {
        self.feature(kind).ok_or(EngineError::MissingFeature(kind))
    }

    pub fn set_feature(&mut self, kind: FeatureType, value: f64) {
        self.features.insert(kind, value);
    }

    #[must_use]
    pub fn contains_all_features(&self, kinds: &[FeatureType]) -> bool {
        kinds.iter().all(|k| self.features.contains_key(k))
    }

    /// Resolve three named anchors into indices.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingFeaturePoint`] for the first one
    /// that is unset.
    pub fn control_points(&self, kinds: [FeaturePointType; 3]) -> Result<ControlPoints, EngineError> {
        Ok(ControlPoints::new(
            self.require_feature_point(kinds[0])?,
            self.require_feature_point(kinds[1])?,
            self.require_feature_point(kinds[2])?,
        ))
    }

    /// Locate dorsal-fin anchors from the contour shape alone.
    ///
    /// * begin and point of inflection are the two ends;
    /// * the tip is the point farthest from the begin/end chord;
    /// * the leading-edge end is the point farthest from the begin/tip
    ///   chord;
    /// * the notch is the point deepest inside the tip/end chord, on the
    ///   same side as the leading edge.
    ///
    /// Existing anchors are replaced.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingFeaturePoint`] for feature sets that
    /// cannot be rediscovered, and [`EngineError::DegenerateContour`] for
    /// contours with fewer than five points.
    pub fn rediscover_feature_points(&mut self) -> Result<(), EngineError> {
        if self.feature_set != FeatureSetType::DorsalFin {
            return Err(EngineError::MissingFeaturePoint(FeaturePointType::Nasion));
        }
        let pts = self.contour.points();
        let n = pts.len();
        if n < 5 {
            return Err(EngineError::DegenerateContour);
        }
        let last = n - 1;

        let tip = farthest_from_chord(pts, 0, last, 1..last).unwrap_or(n / 2);
        let tip = tip.clamp(2, last - 2);
        let le_end = farthest_from_chord(pts, 0, tip, 1..tip).unwrap_or(0);

        // Side of the tip/end chord the fin body lies on.
        let body_side = signed_offset(pts[tip], pts[last], pts[0]).signum();
        let notch = (tip + 1..last)
            .map(|i| (i, signed_offset(pts[tip], pts[last], pts[i]) * body_side))
            .filter(|&(_, depth)| depth > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map_or(usize::midpoint(tip, last).max(tip + 1), |(i, _)| i);

        self.feature_points = BTreeMap::from([
            (FeaturePointType::LeadingEdgeBegin, 0),
            (FeaturePointType::LeadingEdgeEnd, le_end),
            (FeaturePointType::Tip, tip),
            (FeaturePointType::Notch, notch),
            (FeaturePointType::PointOfInflection, last),
        ]);
        self.retag();
        debug!(tip, notch, le_end, "rediscovered dorsal fin feature points");
        Ok(())
    }

    fn retag(&mut self) {
        let indices: Vec<usize> = self.feature_points.values().copied().collect();
        self.contour.tag_feature_points(&indices);
    }
}

/// Signed perpendicular offset of `p` from the line `a -> b`, scaled by
/// the chord length.
fn signed_offset(a: Point, b: Point, p: Point) -> f64 {
    (b.x - a.x).mul_add(p.y - a.y, -((b.y - a.y) * (p.x - a.x)))
}

fn farthest_from_chord(
    pts: &[Point],
    from: usize,
    to: usize,
    range: std::ops::Range<usize>,
) -> Option<usize> {
    range
        .map(|i| (i, signed_offset(pts[from], pts[to], pts[i]).abs()))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// A triangular fin: up the leading edge to a tip, down a trailing
    /// edge with a notch dipping toward the body.
    fn fin() -> Outline {
        let mut pts = Vec::new();
        for i in 0..=20 {
            pts.push(Point::new(f64::from(i) * 2.0, 100.0 - f64::from(i) * 5.0));
        }
        for i in 1..=20 {
            let t = f64::from(i);
            let dip = if (8..=12).contains(&i) { 6.0 } else { 0.0 };
            pts.push(Point::new(40.0 + t * 1.0 - dip, t * 5.0));
        }
        Outline::new(Contour::new(pts), FeatureSetType::DorsalFin)
    }

    #[test]
    fn set_feature_point_checks_range() {
        let mut o = fin();
        let err = o.set_feature_point(FeaturePointType::Tip, 500).unwrap_err();
        assert!(matches!(err, EngineError::IndexOutOfRange { .. }));
    }

    #[test]
    fn set_feature_point_checks_order() {
        let mut o = fin();
        o.set_feature_point(FeaturePointType::Tip, 20).unwrap();
        let err = o
            .set_feature_point(FeaturePointType::PointOfInflection, 10)
            .unwrap_err();
        assert!(matches!(err, EngineError::FeaturePointOrder { .. }));
        o.set_feature_point(FeaturePointType::LeadingEdgeBegin, 0)
            .unwrap();
        o.set_feature_point(FeaturePointType::LeadingEdgeEnd, 0)
            .unwrap();
        assert_eq!(o.feature_point(FeaturePointType::LeadingEdgeEnd), Some(0));
    }

    #[test]
    fn feature_points_are_tagged_on_contour() {
        let mut o = fin();
        o.set_feature_point(FeaturePointType::Tip, 20).unwrap();
        assert_eq!(
            o.contour().points()[20].kind,
            crate::types::PointType::Feature
        );
    }

    #[test]
    fn control_points_report_missing_anchor() {
        let o = fin();
        let err = o
            .control_points([
                FeaturePointType::LeadingEdgeBegin,
                FeaturePointType::Tip,
                FeaturePointType::PointOfInflection,
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingFeaturePoint(FeaturePointType::LeadingEdgeBegin)
        ));
    }

    #[test]
    fn rediscovery_finds_tip_and_notch() {
        let mut o = fin();
        o.rediscover_feature_points().unwrap();
        assert_eq!(o.feature_point(FeaturePointType::Tip), Some(20));
        let notch = o.feature_point(FeaturePointType::Notch).unwrap();
        assert!((28..=32).contains(&notch), "notch at {notch}");
        assert_eq!(
            o.feature_point(FeaturePointType::PointOfInflection),
            Some(40)
        );
        let cp = o
            .control_points([
                FeaturePointType::LeadingEdgeBegin,
                FeaturePointType::Tip,
                FeaturePointType::PointOfInflection,
            ])
            .unwrap();
        assert!(cp.is_ordered());
    }

    #[test]
    fn rediscovery_unsupported_for_bears() {
        let mut o = Outline::new(fin().into_contour(), FeatureSetType::Bear);
        assert!(o.rediscover_feature_points().is_err());
    }

    #[test]
    fn features_round_trip_through_json() {
        let mut o = fin();
        o.set_feature(FeatureType::BrowCurvature, 0.25);
        o.set_feature_point(FeaturePointType::Tip, 20).unwrap();
        let json = serde_json::to_string(&o).unwrap();
        let back: Outline = serde_json::from_str(&json).unwrap();
        assert_eq!(back, o);
        assert!(back.contains_all_features(&[FeatureType::BrowCurvature]));
        assert!(!back.contains_all_features(&[FeatureType::HasMouthDent]));
    }

    #[test]
    fn stored_anchors_are_checked_on_load() {
        let mut value = serde_json::to_value(fin()).unwrap();

        value["feature_points"] = serde_json::json!({
            "LeadingEdgeBegin": 2,
            "Tip": 9999,
            "PointOfInflection": 0,
        });
        let err = serde_json::from_value::<Outline>(value.clone()).unwrap_err();
        assert!(err.to_string().contains("9999"), "{err}");

        value["feature_points"] = serde_json::json!({
            "LeadingEdgeBegin": 30,
            "Tip": 20,
        });
        assert!(serde_json::from_value::<Outline>(value.clone()).is_err());

        value["feature_points"] = serde_json::json!({
            "LeadingEdgeBegin": 0,
            "Tip": 20,
            "PointOfInflection": 40,
        });
        let loaded: Outline = serde_json::from_value(value).unwrap();
        assert_eq!(loaded.feature_point(FeaturePointType::Tip), Some(20));
    }
}
