//! Shared types for the finmatch engine: points, configuration, errors.

use serde::{Deserialize, Serialize};

use crate::edge::EdgeChannel;
use crate::outline::{FeaturePointType, FeatureType};
use crate::registration::{ErrorRange, RegistrationMethod};

/// Re-export `GrayImage` so downstream crates can pass edge maps around
/// without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage` so downstream crates can hand source photos to
/// the edge refiner without depending on `image` directly.
pub use image::RgbaImage;

/// Classification tag carried by every contour point.
///
/// Only [`PointType::Feature`] has meaning to the engine; the other
/// variants are editing state owned by whatever tool produced the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PointType {
    #[default]
    Normal,
    Feature,
    Moving,
    FeatureMoving,
    Chopping,
    Flagged,
}

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
    /// Editing/feature tag.
    #[serde(default)]
    pub kind: PointType,
}

impl Point {
    /// Create a new untagged point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            kind: PointType::Normal,
        }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Bearing of the edge `self -> to` in degrees, in `(-180, 180]`.
    #[must_use]
    pub fn bearing_to(self, to: Self) -> f64 {
        (to.y - self.y).atan2(to.x - self.x).to_degrees()
    }

    /// Midpoint between two points (untagged).
    #[must_use]
    pub fn midpoint(self, other: Self) -> Self {
        Self::new(f64::midpoint(self.x, other.x), f64::midpoint(self.y, other.y))
    }
}

impl From<Point> for geo::Coord<f64> {
    fn from(p: Point) -> Self {
        Self { x: p.x, y: p.y }
    }
}

/// Absolute difference between two bearings in degrees, corrected for
/// the wraparound at ±180 so the result lies in `[0, 180]`.
#[must_use]
pub fn bearing_change(previous: f64, current: f64) -> f64 {
    let diff = (previous - current).abs() % 360.0;
    if diff > 180.0 { 360.0 - diff } else { diff }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Rectangular region of an image, inclusive of `left`/`top` and
/// exclusive of `right`/`bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Window {
    /// The whole image.
    #[must_use]
    pub const fn full(dimensions: Dimensions) -> Self {
        Self {
            left: 0,
            top: 0,
            right: dimensions.width,
            bottom: dimensions.height,
        }
    }

    /// Clamp the window to the given image dimensions.
    #[must_use]
    pub fn clamp_to(self, dimensions: Dimensions) -> Self {
        let right = self.right.min(dimensions.width);
        let bottom = self.bottom.min(dimensions.height);
        Self {
            left: self.left.min(right),
            top: self.top.min(bottom),
            right,
            bottom,
        }
    }

    #[must_use]
    pub const fn width(self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    #[must_use]
    pub const fn height(self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Settings applied when a freshly traced contour is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Spacing used for knot removal and even resampling, in normalized
    /// units.
    pub knot_spacing: f64,

    /// Distance from pseudo-tip to pseudo-base after normalization.
    pub normalized_length: f64,

    /// Largest allowed bearing change between consecutive edges, in
    /// degrees.
    pub max_turn_angle: f64,

    /// Resample as a closed loop (wraps back to the first point and
    /// allows any turn angle).
    pub closed_loop: bool,
}

impl TraceConfig {
    pub const DEFAULT_KNOT_SPACING: f64 = 3.0;
    pub const DEFAULT_NORMALIZED_LENGTH: f64 = 600.0;
    pub const DEFAULT_MAX_TURN_ANGLE: f64 = 150.0;
    /// Turn-angle threshold used for closed loops, which never rejects.
    pub const CLOSED_LOOP_TURN_ANGLE: f64 = 360.0;

    /// Effective turn-angle threshold for the configured mode.
    #[must_use]
    pub const fn turn_angle(&self) -> f64 {
        if self.closed_loop {
            Self::CLOSED_LOOP_TURN_ANGLE
        } else {
            self.max_turn_angle
        }
    }

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.knot_spacing.is_nan() || self.knot_spacing <= 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "knot_spacing must exceed 1.0, got {}",
                self.knot_spacing
            )));
        }
        if self.normalized_length.is_nan() || self.normalized_length <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "normalized_length must be positive, got {}",
                self.normalized_length
            )));
        }
        if !(0.0..=360.0).contains(&self.max_turn_angle) || self.max_turn_angle == 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "max_turn_angle must be in (0, 360], got {}",
                self.max_turn_angle
            )));
        }
        Ok(())
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            knot_spacing: Self::DEFAULT_KNOT_SPACING,
            normalized_length: Self::DEFAULT_NORMALIZED_LENGTH,
            max_turn_angle: Self::DEFAULT_MAX_TURN_ANGLE,
            closed_loop: false,
        }
    }
}

/// Relative weights of the three active-contour energy terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyWeights {
    /// Penalty for deviating from the average neighbour spacing.
    pub continuity: f64,
    /// Penalty for local bending.
    pub linearity: f64,
    /// Reward for sitting on strong edge magnitude.
    pub edge: f64,
}

impl EnergyWeights {
    pub const DEFAULT_CONTINUITY: f64 = 9.0;
    pub const DEFAULT_LINEARITY: f64 = 3.0;
    pub const DEFAULT_EDGE: f64 = 1.5;
}

impl Default for EnergyWeights {
    fn default() -> Self {
        Self {
            continuity: Self::DEFAULT_CONTINUITY,
            linearity: Self::DEFAULT_LINEARITY,
            edge: Self::DEFAULT_EDGE,
        }
    }
}

/// Configuration for snapping a rough trace onto image edges.
///
/// # Canny threshold invariants
///
/// `canny_low` and `canny_high` are fractions in `(0, 1]`: the high
/// threshold is a fraction of the strongest thinned gradient and the low
/// threshold a fraction of the high one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnakeConfig {
    pub weights: EnergyWeights,

    /// Total iteration budget across all scales.
    pub max_iterations: u32,

    /// Half-width of the square neighbourhood searched per point, in
    /// pixels of the current scale.
    pub search_radius: u32,

    /// First (coarsest) scale, as a percentage of full resolution. The
    /// scale doubles after every pass until it exceeds 100.
    pub start_ratio: u32,

    /// Desired number of points in the evenly spaced working contour.
    pub target_points: usize,

    /// Lower bound on the working contour spacing.
    pub min_spacing: f64,

    /// Refinement is refused for contours with fewer points than this,
    /// and for edge maps with fewer edge pixels.
    pub min_contour_points: usize,

    /// Gaussian blur sigma applied before gradient computation.
    pub gaussian_std_dev: f32,

    pub canny_low: f32,
    pub canny_high: f32,

    /// Which image channel feeds edge detection.
    pub channel: EdgeChannel,
}

impl SnakeConfig {
    pub const DEFAULT_MAX_ITERATIONS: u32 = 300;
    pub const DEFAULT_SEARCH_RADIUS: u32 = 3;
    pub const DEFAULT_START_RATIO: u32 = 25;
    pub const DEFAULT_TARGET_POINTS: usize = 200;
    pub const DEFAULT_MIN_SPACING: f64 = 3.0;
    pub const DEFAULT_MIN_CONTOUR_POINTS: usize = 100;
    pub const DEFAULT_GAUSSIAN_STD_DEV: f32 = 1.5;
    pub const DEFAULT_CANNY_LOW: f32 = 0.15;
    pub const DEFAULT_CANNY_HIGH: f32 = 0.85;

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), EngineError> {
        let w = self.weights;
        if w.continuity < 0.0 || w.linearity < 0.0 || w.edge < 0.0 {
            return Err(EngineError::InvalidConfig(
                "energy weights must be non-negative".to_owned(),
            ));
        }
        if self.start_ratio == 0 || self.start_ratio > 100 {
            return Err(EngineError::InvalidConfig(format!(
                "start_ratio must be in 1..=100, got {}",
                self.start_ratio
            )));
        }
        if self.target_points == 0 {
            return Err(EngineError::InvalidConfig(
                "target_points must be positive".to_owned(),
            ));
        }
        if self.min_spacing.is_nan() || self.min_spacing <= 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "min_spacing must exceed 1.0, got {}",
                self.min_spacing
            )));
        }
        if self.gaussian_std_dev.is_nan() || self.gaussian_std_dev <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "gaussian_std_dev must be positive, got {}",
                self.gaussian_std_dev
            )));
        }
        let valid_fraction = |t: f32| t > 0.0 && t <= 1.0;
        if !valid_fraction(self.canny_low) || !valid_fraction(self.canny_high) {
            return Err(EngineError::InvalidConfig(format!(
                "canny thresholds must be in (0, 1], got {} / {}",
                self.canny_low, self.canny_high
            )));
        }
        Ok(())
    }
}

impl Default for SnakeConfig {
    fn default() -> Self {
        Self {
            weights: EnergyWeights::default(),
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            search_radius: Self::DEFAULT_SEARCH_RADIUS,
            start_ratio: Self::DEFAULT_START_RATIO,
            target_points: Self::DEFAULT_TARGET_POINTS,
            min_spacing: Self::DEFAULT_MIN_SPACING,
            min_contour_points: Self::DEFAULT_MIN_CONTOUR_POINTS,
            gaussian_std_dev: Self::DEFAULT_GAUSSIAN_STD_DEV,
            canny_low: Self::DEFAULT_CANNY_LOW,
            canny_high: Self::DEFAULT_CANNY_HIGH,
            channel: EdgeChannel::default(),
        }
    }
}

/// Configuration for a matching run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Registration strategy used by outline factors.
    pub registration: RegistrationMethod,

    /// Whether the reported outline error covers the whole outline or
    /// only the trimmed span chosen by registration.
    pub error_range: ErrorRange,

    /// Maximum number of hill-climb moves for the trim-optimal methods.
    pub optimal_step_budget: u32,

    /// Fraction of the leading edge dropped per step by trim-fixed-percent.
    pub trim_percent: f64,

    /// Number of trim steps tried on each side by trim-fixed-percent.
    pub trim_steps: u32,
}

impl MatchConfig {
    pub const DEFAULT_OPTIMAL_STEP_BUDGET: u32 = 100;
    pub const DEFAULT_TRIM_PERCENT: f64 = 0.1;
    pub const DEFAULT_TRIM_STEPS: u32 = 3;

    /// Check parameter ranges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.trim_percent.is_nan() || self.trim_percent <= 0.0 || self.trim_percent >= 1.0 {
            return Err(EngineError::InvalidConfig(format!(
                "trim_percent must be in (0, 1), got {}",
                self.trim_percent
            )));
        }
        if self.optimal_step_budget == 0 {
            return Err(EngineError::InvalidConfig(
                "optimal_step_budget must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            registration: RegistrationMethod::default(),
            error_range: ErrorRange::default(),
            optimal_step_budget: Self::DEFAULT_OPTIMAL_STEP_BUDGET,
            trim_percent: Self::DEFAULT_TRIM_PERCENT,
            trim_steps: Self::DEFAULT_TRIM_STEPS,
        }
    }
}

/// Errors produced by the engine.
///
/// Uses custom `Serialize`/`Deserialize` because `image::ImageError`
/// does not implement serde traits. The `ImageDecode` variant is
/// serialized as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Failed to decode an input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// An operation that needs points was given an empty contour.
    #[error("contour has no points")]
    EmptyContour,

    /// A point index was outside the contour.
    #[error("point index {index} out of range for contour of {len} points")]
    IndexOutOfRange { index: usize, len: usize },

    /// Pseudo-tip and pseudo-base coincide, or too few points to define
    /// them.
    #[error("contour is degenerate and cannot be normalized")]
    DegenerateContour,

    /// A required feature point is not set on the outline.
    #[error("outline is missing feature point {0:?}")]
    MissingFeaturePoint(FeaturePointType),

    /// A required scalar feature is not set on the outline.
    #[error("outline is missing feature {0:?}")]
    MissingFeature(FeatureType),

    /// Feature point indices are not in anatomical order.
    #[error("feature point {point:?} at index {index} is out of anatomical order")]
    FeaturePointOrder {
        point: FeaturePointType,
        index: usize,
    },

    /// Too little data for edge refinement.
    #[error("contour too small to refine: {points} points, {required} required")]
    InsufficientContour { points: usize, required: usize },

    /// Too few complete catalog entries to build ratio statistics.
    #[error("catalog has too few complete outlines for ratio statistics")]
    InsufficientCatalog,

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline was built with no match factors.
    #[error("no match factors configured")]
    NoFactors,

    /// Category filtering eliminated every catalog entry.
    #[error("no candidates in selected categories")]
    NoCandidates,

    /// The run was cancelled.
    #[error("match run cancelled")]
    Cancelled,

    /// A results report could not be parsed.
    #[error("results report line {line}: {reason}")]
    ReportParse { line: usize, reason: String },
}

/// Serde-compatible proxy for `EngineError`.
#[derive(Serialize, Deserialize)]
enum EngineErrorProxy {
    ImageDecode(String),
    EmptyContour,
    IndexOutOfRange { index: usize, len: usize },
    DegenerateContour,
    MissingFeaturePoint(FeaturePointType),
    MissingFeature(FeatureType),
    FeaturePointOrder {
        point: FeaturePointType,
        index: usize,
    },
    InsufficientContour { points: usize, required: usize },
    InsufficientCatalog,
    InvalidConfig(String),
    NoFactors,
    NoCandidates,
    Cancelled,
    ReportParse { line: usize, reason: String },
}

impl Serialize for EngineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::ImageDecode(e) => EngineErrorProxy::ImageDecode(e.to_string()),
            Self::EmptyContour => EngineErrorProxy::EmptyContour,
            Self::IndexOutOfRange { index, len } => EngineErrorProxy::IndexOutOfRange {
                index: *index,
                len: *len,
            },
            Self::DegenerateContour => EngineErrorProxy::DegenerateContour,
            Self::MissingFeaturePoint(p) => EngineErrorProxy::MissingFeaturePoint(*p),
            Self::MissingFeature(f) => EngineErrorProxy::MissingFeature(*f),
            Self::FeaturePointOrder { point, index } => EngineErrorProxy::FeaturePointOrder {
                point: *point,
                index: *index,
            },
            Self::InsufficientContour { points, required } => {
                EngineErrorProxy::InsufficientContour {
                    points: *points,
                    required: *required,
                }
            }
            Self::InsufficientCatalog => EngineErrorProxy::InsufficientCatalog,
            Self::InvalidConfig(s) => EngineErrorProxy::InvalidConfig(s.clone()),
            Self::NoFactors => EngineErrorProxy::NoFactors,
            Self::NoCandidates => EngineErrorProxy::NoCandidates,
            Self::Cancelled => EngineErrorProxy::Cancelled,
            Self::ReportParse { line, reason } => EngineErrorProxy::ReportParse {
                line: *line,
                reason: reason.clone(),
            },
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EngineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = EngineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            // The typed image error cannot be rebuilt; keep its message.
            EngineErrorProxy::ImageDecode(msg) => {
                Self::InvalidConfig(format!("image decode error: {msg}"))
            }
            EngineErrorProxy::EmptyContour => Self::EmptyContour,
            EngineErrorProxy::IndexOutOfRange { index, len } => {
                Self::IndexOutOfRange { index, len }
            }
            EngineErrorProxy::DegenerateContour => Self::DegenerateContour,
            EngineErrorProxy::MissingFeaturePoint(p) => Self::MissingFeaturePoint(p),
            EngineErrorProxy::MissingFeature(f) => Self::MissingFeature(f),
            EngineErrorProxy::FeaturePointOrder { point, index } => {
                Self::FeaturePointOrder { point, index }
            }
            EngineErrorProxy::InsufficientContour { points, required } => {
                Self::InsufficientContour { points, required }
            }
            EngineErrorProxy::InsufficientCatalog => Self::InsufficientCatalog,
            EngineErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            EngineErrorProxy::NoFactors => Self::NoFactors,
            EngineErrorProxy::NoCandidates => Self::NoCandidates,
            EngineErrorProxy::Cancelled => Self::Cancelled,
            EngineErrorProxy::ReportParse { line, reason } => Self::ReportParse { line, reason },
        })
    }
}
