//! Affine mapping of one contour onto another from three point
//! correspondences.
//!
//! Registration places the unknown outline into the frame of a catalog
//! outline by pinning three anchors (typically begin, tip, end) to
//! their counterparts. Three non-collinear pairs determine a unique
//! affine transform, solved here as `M = D * S⁻¹` with homogeneous
//! coordinates in the columns of `S` (source) and `D` (destination).

use nalgebra::{Matrix3, Vector3};

use crate::contour::Contour;
use crate::types::{EngineError, Point};

/// An affine transform of the plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMap {
    matrix: Matrix3<f64>,
}

impl AffineMap {
    /// The transform that leaves points unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Solve for the transform taking each `src[i]` to `dst[i]`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DegenerateContour`] when the source points
    /// are collinear (or coincide) so no unique transform exists.
    pub fn from_correspondences(src: [Point; 3], dst: [Point; 3]) -> Result<Self, EngineError> {
        let homogeneous = |p: [Point; 3]| {
            Matrix3::new(
                p[0].x, p[1].x, p[2].x, //
                p[0].y, p[1].y, p[2].y, //
                1.0, 1.0, 1.0,
            )
        };
        let s = homogeneous(src);
        let inverse = s.try_inverse().ok_or(EngineError::DegenerateContour)?;
        Ok(Self {
            matrix: homogeneous(dst) * inverse,
        })
    }

    /// Map one point; its tag is preserved.
    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        let v = self.matrix * Vector3::new(p.x, p.y, 1.0);
        Point {
            x: v.x,
            y: v.y,
            kind: p.kind,
        }
    }

    /// Map every point of a contour into a new contour.
    #[must_use]
    pub fn map_contour(&self, contour: &Contour) -> Contour {
        Contour::with_scale(
            contour.points().iter().map(|&p| self.apply(p)).collect(),
            contour.scale(),
        )
    }
}

/// Map `contour` so the points at `src` land on the coordinates `dst`.
///
/// # Errors
///
/// Returns [`EngineError::IndexOutOfRange`] for an anchor outside the
/// contour and [`EngineError::DegenerateContour`] when the anchors are
/// collinear.
pub fn map_contour(
    contour: &Contour,
    src: [usize; 3],
    dst: [Point; 3],
) -> Result<Contour, EngineError> {
    let src = [
        contour.point(src[0])?,
        contour.point(src[1])?,
        contour.point(src[2])?,
    ];
    Ok(AffineMap::from_correspondences(src, dst)?.map_contour(contour))
}
