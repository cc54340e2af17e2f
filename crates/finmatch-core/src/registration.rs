//! Registration: aligning an unknown outline to a catalog outline.
//!
//! Every strategy works the same way at its core: choose three anchor
//! indices on each contour, map the unknown contour affinely so its
//! anchors land on the candidate's anchors ([`crate::mapping`]), then
//! score the overlap with an [`OutlineErrorFunction`]. Strategies differ
//! in how they search for the anchors:
//!
//! | strategy | search |
//! |----------|--------|
//! | [`FixedThreePoint`] | none: the traced anchors are used as-is |
//! | [`TrimFixedPercent`] | drops fixed fractions of either leading edge |
//! | [`TrimOptimal`] | hill-climbs the tip (and optionally both trims) |
//! | [`ControlPointJitter`] | grid search around each anchor, plus an alternate end |
//!
//! A strategy never mutates its inputs; the returned [`Registration`]
//! owns freshly mapped contours.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contour::Contour;
use crate::error_fn::{AreaBetweenError, MeanSquaredSegmentError, OutlineErrorFunction};
use crate::mapping::AffineMap;
use crate::outline::{ControlPoints, FeaturePointType};
use crate::types::{EngineError, MatchConfig};

/// Smallest number of points kept between neighbouring anchors while
/// searching.
const MIN_SPAN_POINTS: usize = 2;

/// Errors closer than this count as no improvement.
const IMPROVEMENT_EPSILON: f64 = 1e-12;

/// Selectable registration strategies for outline factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationMethod {
    /// Fixed three-point mapping.
    Original3Point,
    /// Leading-edge trims in fixed steps.
    TrimFixedPercent,
    /// Hill-climb over tip and both trims.
    TrimOptimalTotal,
    /// Hill-climb over the tip only.
    #[default]
    TrimOptimalTip,
    /// Like [`Self::TrimOptimalTotal`] scored by area between outlines.
    TrimOptimalArea,
}

impl RegistrationMethod {
    /// Build the strategy for this method.
    #[must_use]
    pub fn strategy(self, config: &MatchConfig) -> Box<dyn RegistrationStrategy> {
        let range = config.error_range;
        match self {
            Self::Original3Point => Box::new(FixedThreePoint { range }),
            Self::TrimFixedPercent => Box::new(TrimFixedPercent {
                percent: config.trim_percent,
                steps: config.trim_steps,
                range,
            }),
            Self::TrimOptimalTotal | Self::TrimOptimalArea => Box::new(TrimOptimal {
                move_tip: true,
                vary_trims: true,
                step_budget: config.optimal_step_budget,
                range,
            }),
            Self::TrimOptimalTip => Box::new(TrimOptimal {
                move_tip: true,
                vary_trims: false,
                step_budget: config.optimal_step_budget,
                range,
            }),
        }
    }

    /// The outline metric this method scores with.
    #[must_use]
    pub fn metric(self) -> Box<dyn OutlineErrorFunction> {
        match self {
            Self::TrimOptimalArea => Box::new(AreaBetweenError),
            _ => Box::new(MeanSquaredSegmentError),
        }
    }
}

/// Which points the reported outline error covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorRange {
    /// Every point of both outlines, split at the chosen tips.
    #[default]
    Full,
    /// Only the span between the chosen begin and end anchors.
    Trimmed,
}

/// One side of a registration: a contour and its anchors.
#[derive(Debug, Clone, Copy)]
pub struct Anchored<'a> {
    pub contour: &'a Contour,
    pub points: ControlPoints,
    /// Replacement for `points.end` tried by strategies that support it.
    pub alternate_end: Option<usize>,
}

impl<'a> Anchored<'a> {
    #[must_use]
    pub const fn new(contour: &'a Contour, points: ControlPoints) -> Self {
        Self {
            contour,
            points,
            alternate_end: None,
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let len = self.contour.len();
        for index in self
            .points
            .as_array()
            .into_iter()
            .chain(self.alternate_end)
        {
            if index >= len {
                return Err(EngineError::IndexOutOfRange { index, len });
            }
        }
        if !self.points.is_ordered() {
            return Err(EngineError::FeaturePointOrder {
                point: FeaturePointType::Tip,
                index: self.points.tip,
            });
        }
        Ok(())
    }
}

/// Outcome of aligning two outlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// The unknown contour mapped into the candidate's frame.
    pub unknown: Contour,
    /// The candidate contour (unchanged copy).
    pub candidate: Contour,
    pub error: f64,
    /// Anchors used on the unknown contour.
    pub unknown_points: ControlPoints,
    /// Anchors used on the candidate contour.
    pub candidate_points: ControlPoints,
}

/// A way of finding the correspondence between two outlines.
pub trait RegistrationStrategy: fmt::Debug + Send + Sync {
    /// Align `unknown` to `candidate` and score the result.
    ///
    /// # Errors
    ///
    /// Returns an error when the anchors are out of range or unordered,
    /// or when no valid mapping exists.
    fn register(
        &self,
        unknown: Anchored<'_>,
        candidate: Anchored<'_>,
        metric: &dyn OutlineErrorFunction,
    ) -> Result<Registration, EngineError>;
}

/// Map `unknown` by its anchors onto `candidate`'s anchors and score the
/// anchored spans.
fn evaluate(
    unknown: &Contour,
    u_cp: ControlPoints,
    candidate: &Contour,
    c_cp: ControlPoints,
    metric: &dyn OutlineErrorFunction,
) -> Result<(Contour, f64), EngineError> {
    let src = [
        unknown.point(u_cp.begin)?,
        unknown.point(u_cp.tip)?,
        unknown.point(u_cp.end)?,
    ];
    let dst = [
        candidate.point(c_cp.begin)?,
        candidate.point(c_cp.tip)?,
        candidate.point(c_cp.end)?,
    ];
    let mapped = AffineMap::from_correspondences(src, dst)?.map_contour(unknown);
    let error = metric.error_between(&mapped, u_cp, candidate, c_cp);
    Ok((mapped, error))
}

/// Turn the best search state into a [`Registration`], rescoring over
/// the full outlines when asked to.
fn finish(
    range: ErrorRange,
    mapped: Contour,
    trimmed_error: f64,
    u_cp: ControlPoints,
    candidate: &Contour,
    c_cp: ControlPoints,
    metric: &dyn OutlineErrorFunction,
) -> Registration {
    let error = match range {
        ErrorRange::Trimmed => trimmed_error,
        ErrorRange::Full => {
            let full = |len: usize, tip: usize| ControlPoints::new(0, tip, len.saturating_sub(1));
            metric.error_between(
                &mapped,
                full(mapped.len(), u_cp.tip),
                candidate,
                full(candidate.len(), c_cp.tip),
            )
        }
    };
    Registration {
        unknown: mapped,
        candidate: candidate.clone(),
        error,
        unknown_points: u_cp,
        candidate_points: c_cp,
    }
}

/// Anchors used exactly as traced.
#[derive(Debug, Clone, Copy)]
pub struct FixedThreePoint {
    pub range: ErrorRange,
}

impl RegistrationStrategy for FixedThreePoint {
    fn register(
        &self,
        unknown: Anchored<'_>,
        candidate: Anchored<'_>,
        metric: &dyn OutlineErrorFunction,
    ) -> Result<Registration, EngineError> {
        unknown.validate()?;
        candidate.validate()?;
        let (mapped, error) = evaluate(
            unknown.contour,
            unknown.points,
            candidate.contour,
            candidate.points,
            metric,
        )?;
        Ok(finish(
            self.range,
            mapped,
            error,
            unknown.points,
            candidate.contour,
            candidate.points,
            metric,
        ))
    }
}

/// Drop `percent` of one outline's leading edge at a time, up to `steps`
/// times per side, keeping the alignment with the lowest error.
#[derive(Debug, Clone, Copy)]
pub struct TrimFixedPercent {
    pub percent: f64,
    pub steps: u32,
    pub range: ErrorRange,
}

impl TrimFixedPercent {
    /// Begin indices tried on one side, untrimmed first.
    fn begins(&self, cp: ControlPoints) -> Vec<usize> {
        let leading = cp.tip - cp.begin;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let step = ((leading as f64) * self.percent).round().max(1.0) as usize;
        (0..=self.steps as usize)
            .map(|k| cp.begin + k * step)
            .take_while(|&b| b + MIN_SPAN_POINTS <= cp.tip)
            .collect()
    }
}

impl RegistrationStrategy for TrimFixedPercent {
    fn register(
        &self,
        unknown: Anchored<'_>,
        candidate: Anchored<'_>,
        metric: &dyn OutlineErrorFunction,
    ) -> Result<Registration, EngineError> {
        unknown.validate()?;
        candidate.validate()?;
        let (u0, c0) = (unknown.points, candidate.points);

        let mut trials = vec![(u0, c0)];
        for b in self.begins(u0).into_iter().skip(1) {
            trials.push((ControlPoints { begin: b, ..u0 }, c0));
        }
        for b in self.begins(c0).into_iter().skip(1) {
            trials.push((u0, ControlPoints { begin: b, ..c0 }));
        }

        let mut best: Option<(Contour, f64, ControlPoints, ControlPoints)> = None;
        for (u_cp, c_cp) in trials {
            let (mapped, error) =
                evaluate(unknown.contour, u_cp, candidate.contour, c_cp, metric)?;
            if best.as_ref().is_none_or(|b| error < b.1) {
                best = Some((mapped, error, u_cp, c_cp));
            }
        }
        let (mapped, error, u_cp, c_cp) = best.ok_or(EngineError::EmptyContour)?;
        debug!(error, u_begin = u_cp.begin, c_begin = c_cp.begin, "trim-fixed-percent done");
        Ok(finish(
            self.range,
            mapped,
            error,
            u_cp,
            candidate.contour,
            c_cp,
            metric,
        ))
    }
}

/// Discrete local search over anchor offsets.
///
/// Starting from the traced anchors, every move tries `±step` on each
/// free parameter, takes the best improving neighbour, and halves the
/// step when no neighbour improves. The search stops at step one with
/// no improvement or when `step_budget` moves have been made.
///
/// Free parameters are the unknown's tip (`move_tip`), plus the begin
/// and end of both outlines (`vary_trims`).
#[derive(Debug, Clone, Copy)]
pub struct TrimOptimal {
    pub move_tip: bool,
    pub vary_trims: bool,
    pub step_budget: u32,
    pub range: ErrorRange,
}

/// Search state: signed offsets from the traced anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Offsets {
    u_tip: isize,
    u_begin: isize,
    u_end: isize,
    c_begin: isize,
    c_end: isize,
}

impl Offsets {
    fn with(mut self, param: usize, delta: isize) -> Self {
        match param {
            0 => self.u_tip += delta,
            1 => self.u_begin += delta,
            2 => self.u_end += delta,
            3 => self.c_begin += delta,
            _ => self.c_end += delta,
        }
        self
    }
}

fn shift(index: usize, delta: isize, len: usize) -> Option<usize> {
    let shifted = index.checked_add_signed(delta)?;
    (shifted < len).then_some(shifted)
}

fn spaced(cp: ControlPoints) -> bool {
    cp.begin + MIN_SPAN_POINTS <= cp.tip && cp.tip + MIN_SPAN_POINTS <= cp.end
}

impl TrimOptimal {
    fn free_params(&self) -> Vec<usize> {
        let mut params = Vec::new();
        if self.move_tip {
            params.push(0);
        }
        if self.vary_trims {
            params.extend([1, 2, 3, 4]);
        }
        params
    }

    fn anchors(
        unknown: &Anchored<'_>,
        candidate: &Anchored<'_>,
        o: Offsets,
    ) -> Option<(ControlPoints, ControlPoints)> {
        let (u, c) = (unknown.points, candidate.points);
        let (ul, cl) = (unknown.contour.len(), candidate.contour.len());
        let u_cp = ControlPoints::new(
            shift(u.begin, o.u_begin, ul)?,
            shift(u.tip, o.u_tip, ul)?,
            shift(u.end, o.u_end, ul)?,
        );
        let c_cp = ControlPoints::new(
            shift(c.begin, o.c_begin, cl)?,
            c.tip,
            shift(c.end, o.c_end, cl)?,
        );
        (spaced(u_cp) && spaced(c_cp)).then_some((u_cp, c_cp))
    }
}

impl RegistrationStrategy for TrimOptimal {
    fn register(
        &self,
        unknown: Anchored<'_>,
        candidate: Anchored<'_>,
        metric: &dyn OutlineErrorFunction,
    ) -> Result<Registration, EngineError> {
        unknown.validate()?;
        candidate.validate()?;
        let (mut u_cp, mut c_cp) = (unknown.points, candidate.points);
        let (mut mapped, mut error) =
            evaluate(unknown.contour, u_cp, candidate.contour, c_cp, metric)?;

        let params = self.free_params();
        let mut state = Offsets::default();
        let mut step = (unknown.contour.len() / 50).max(1).cast_signed();
        let mut moves = 0;
        while moves < self.step_budget && !params.is_empty() {
            moves += 1;
            let mut best_move = None;
            for &param in &params {
                for delta in [-step, step] {
                    let trial = state.with(param, delta);
                    let Some((tu, tc)) = Self::anchors(&unknown, &candidate, trial) else {
                        continue;
                    };
                    let Ok((trial_mapped, trial_error)) =
                        evaluate(unknown.contour, tu, candidate.contour, tc, metric)
                    else {
                        continue;
                    };
                    let current_best = best_move.as_ref().map_or(error, |b: &(_, _, _, _, f64)| b.4);
                    if trial_error < current_best - IMPROVEMENT_EPSILON {
                        best_move = Some((trial, tu, tc, trial_mapped, trial_error));
                    }
                }
            }
            match best_move {
                Some((trial, tu, tc, trial_mapped, trial_error)) => {
                    state = trial;
                    u_cp = tu;
                    c_cp = tc;
                    mapped = trial_mapped;
                    error = trial_error;
                }
                None if step > 1 => step /= 2,
                None => break,
            }
        }
        debug!(
            error,
            moves,
            u_tip = u_cp.tip,
            u_begin = u_cp.begin,
            c_begin = c_cp.begin,
            "trim-optimal search done"
        );
        Ok(finish(
            self.range,
            mapped,
            error,
            u_cp,
            candidate.contour,
            c_cp,
            metric,
        ))
    }
}

/// Grid search of small shifts around each of the unknown's anchors,
/// optionally also with the alternate end anchor on both sides.
///
/// Shifts are multiples of `jump_fraction` of the unknown contour's
/// length (at least one point), up to `radius` multiples either way.
/// With `leading_edge_only` the end anchor stays fixed.
#[derive(Debug, Clone, Copy)]
pub struct ControlPointJitter {
    pub jump_fraction: f64,
    pub radius: u32,
    pub leading_edge_only: bool,
    pub try_alternate_end: bool,
    pub range: ErrorRange,
}

impl ControlPointJitter {
    pub const DEFAULT_JUMP_FRACTION: f64 = 0.01;
    pub const DEFAULT_RADIUS: u32 = 2;

    /// Default bear settings with the given error range.
    #[must_use]
    pub const fn new(range: ErrorRange) -> Self {
        Self {
            jump_fraction: Self::DEFAULT_JUMP_FRACTION,
            radius: Self::DEFAULT_RADIUS,
            leading_edge_only: true,
            try_alternate_end: true,
            range,
        }
    }
}

/// `base` with each anchor moved by `steps[i] * jump`, if the result is
/// still inside the contour and well spaced.
fn jittered(
    base: ControlPoints,
    steps: [isize; 3],
    jump: isize,
    len: usize,
) -> Option<ControlPoints> {
    let cp = ControlPoints::new(
        shift(base.begin, steps[0] * jump, len)?,
        shift(base.tip, steps[1] * jump, len)?,
        shift(base.end, steps[2] * jump, len)?,
    );
    spaced(cp).then_some(cp)
}

impl RegistrationStrategy for ControlPointJitter {
    fn register(
        &self,
        unknown: Anchored<'_>,
        candidate: Anchored<'_>,
        metric: &dyn OutlineErrorFunction,
    ) -> Result<Registration, EngineError> {
        unknown.validate()?;
        candidate.validate()?;
        let len = unknown.contour.len();
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let jump = ((len as f64) * self.jump_fraction).round().max(1.0) as isize;
        let r = isize::try_from(self.radius).unwrap_or(0);
        let end_range = if self.leading_edge_only { 0..=0 } else { -r..=r };

        let mut bases = vec![(unknown.points, candidate.points)];
        if self.try_alternate_end
            && let (Some(ua), Some(ca)) = (unknown.alternate_end, candidate.alternate_end)
        {
            bases.push((
                ControlPoints {
                    end: ua,
                    ..unknown.points
                },
                ControlPoints {
                    end: ca,
                    ..candidate.points
                },
            ));
        }

        let mut best: Option<(Contour, f64, ControlPoints, ControlPoints)> = None;
        for (u_base, c_cp) in bases {
            if !spaced(c_cp) {
                continue;
            }
            for db in -r..=r {
                for dt in -r..=r {
                    for de in end_range.clone() {
                        let Some(u_cp) = jittered(u_base, [db, dt, de], jump, len) else {
                            continue;
                        };
                        let Ok((mapped, error)) =
                            evaluate(unknown.contour, u_cp, candidate.contour, c_cp, metric)
                        else {
                            continue;
                        };
                        if best.as_ref().is_none_or(|b| error < b.1) {
                            best = Some((mapped, error, u_cp, c_cp));
                        }
                    }
                }
            }
        }
        let (mapped, error, u_cp, c_cp) = best.ok_or(EngineError::DegenerateContour)?;
        debug!(error, ?u_cp, ?c_cp, "control-point jitter done");
        Ok(finish(
            self.range,
            mapped,
            error,
            u_cp,
            candidate.contour,
            c_cp,
            metric,
        ))
    }
}
