//! Catalog matching, one candidate per call.
//!
//! A [`MatchPipeline`] compares an unknown [`Outline`] against every
//! [`Candidate`] of a [`Catalog`]. Callers drive it by calling
//! [`match_single_individual`](MatchPipeline::match_single_individual)
//! until it reports progress `1.0`:
//!
//! ```text
//! Idle ──▶ Running ──▶ Finalizing ──▶ Complete
//!             │
//!             └──▶ Cancelled
//! ```
//!
//! Each call claims the next catalog index under the run lock, evaluates
//! every factor without holding the lock, then records the outcome. The
//! call that records the last candidate rescales every factor over the
//! whole population and combines the scaled errors into one score per
//! candidate.
//!
//! The pipeline takes `&self` throughout, so several threads may drive
//! one run; index allocation and result recording stay serialized.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diagnostics::{Clock, FactorDiagnostics, RunDiagnostics, SystemClock, duration_ms};
use crate::factor::MatchFactor;
use crate::outline::{FeaturePointType, FeatureType, Outline};
use crate::results::{MatchResult, MatchResultSet};
use crate::types::EngineError;

/// One previously identified individual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Zero-based position in the catalog. Assigned by [`Catalog`].
    #[serde(default)]
    pub position: usize,
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Damage category; what [`CategoryFilter`] selects on.
    #[serde(default)]
    pub damage: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub location: String,
    /// Image reference for display.
    #[serde(default)]
    pub image: String,
    pub outline: Outline,
}

/// The population searched by a match run.
///
/// Serializes as a plain list of candidates. Positions are renumbered on
/// construction so they always equal list indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Candidate>", into = "Vec<Candidate>")]
pub struct Catalog {
    candidates: Vec<Candidate>,
}

impl From<Vec<Candidate>> for Catalog {
    fn from(mut candidates: Vec<Candidate>) -> Self {
        for (i, c) in candidates.iter_mut().enumerate() {
            c.position = i;
        }
        Self { candidates }
    }
}

impl From<Catalog> for Vec<Candidate> {
    fn from(catalog: Catalog) -> Self {
        catalog.candidates
    }
}

impl Catalog {
    #[must_use]
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self::from(candidates)
    }

    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&Candidate> {
        self.candidates.get(position)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Which damage categories take part in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CategoryFilter {
    #[default]
    All,
    /// Lower-cased category names.
    Only(BTreeSet<String>),
}

impl CategoryFilter {
    /// Only the named categories, compared case-insensitively.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Only(
            names
                .into_iter()
                .map(|n| n.as_ref().to_lowercase())
                .collect(),
        )
    }

    #[must_use]
    pub fn admits(&self, category: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(&category.to_lowercase()),
        }
    }
}

/// Lifecycle of a match run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Finalizing,
    Complete,
    Cancelled,
}

#[derive(Debug, Default)]
struct RunShared {
    state: RunState,
    next: usize,
    started: Duration,
    results: Vec<MatchResult>,
    diagnostics: RunDiagnostics,
}

/// A match run of one unknown outline against a catalog.
#[derive(Debug)]
pub struct MatchPipeline {
    unknown: Outline,
    catalog: Catalog,
    factors: Vec<MatchFactor>,
    clock: Box<dyn Clock>,
    shared: Mutex<RunShared>,
}

impl MatchPipeline {
    /// Set up a run.
    ///
    /// When the unknown outline lacks a feature point some factor reads,
    /// its feature points are rediscovered from the contour first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoFactors`] for an empty factor list, and
    /// the missing feature point or feature when the unknown outline
    /// cannot satisfy the factors even after rediscovery.
    pub fn new(
        mut unknown: Outline,
        catalog: Catalog,
        factors: Vec<MatchFactor>,
    ) -> Result<Self, EngineError> {
        if factors.is_empty() {
            return Err(EngineError::NoFactors);
        }
        let (points, features) = dependencies(&factors);
        if !unknown.contains_all_feature_points(&points) || !unknown.contains_all_features(&features)
        {
            warn!("unknown outline is missing feature points; rediscovering");
            unknown.rediscover_feature_points()?;
        }
        for factor in &factors {
            factor.check_dependencies(&unknown)?;
        }

        let diagnostics = RunDiagnostics {
            candidates: catalog.len(),
            ..RunDiagnostics::default()
        };
        Ok(Self {
            unknown,
            catalog,
            factors,
            clock: Box::new(SystemClock::default()),
            shared: Mutex::new(RunShared {
                diagnostics,
                ..RunShared::default()
            }),
        })
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn unknown(&self) -> &Outline {
        &self.unknown
    }

    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn factors(&self) -> &[MatchFactor] {
        &self.factors
    }

    fn lock(&self) -> MutexGuard<'_, RunShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.lock().state
    }

    /// Snapshot of the run's diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> RunDiagnostics {
        self.lock().diagnostics.clone()
    }

    /// Fraction of the catalog processed, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        progress_of(&self.lock(), self.catalog.len())
    }

    /// Stop the run at the next candidate boundary. A completed run is
    /// left alone.
    pub fn cancel(&self) {
        let mut shared = self.lock();
        if shared.state != RunState::Complete {
            info!(processed = shared.diagnostics.processed, "match run cancelled");
            shared.state = RunState::Cancelled;
        }
    }

    /// Process the next catalog candidate and return overall progress.
    ///
    /// Candidates whose category `filter` rejects are skipped. A
    /// candidate on which any factor fails is logged and left out of the
    /// results. Once every candidate has been processed the scores are
    /// rescaled and `1.0` is returned; further calls keep returning
    /// `1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] once the run has been
    /// cancelled.
    pub fn match_single_individual(&self, filter: &CategoryFilter) -> Result<f64, EngineError> {
        let total = self.catalog.len();
        let index = {
            let mut shared = self.lock();
            match shared.state {
                RunState::Cancelled => return Err(EngineError::Cancelled),
                RunState::Complete | RunState::Finalizing => return Ok(1.0),
                RunState::Idle => {
                    info!(candidates = total, factors = self.factors.len(), "match run started");
                    shared.started = self.clock.now();
                    shared.state = RunState::Running;
                }
                RunState::Running => {}
            }
            if shared.next >= total {
                if shared.diagnostics.processed >= total {
                    self.finalize(&mut shared);
                    return Ok(1.0);
                }
                // Remaining candidates are being evaluated by other callers.
                return Ok(progress_of(&shared, total));
            }
            let index = shared.next;
            shared.next += 1;
            index
        };

        let candidate = &self.catalog.candidates[index];
        let outcome = filter
            .admits(&candidate.damage)
            .then(|| self.evaluate(index));

        let mut shared = self.lock();
        shared.diagnostics.processed += 1;
        match outcome {
            None => {
                debug!(id = %candidate.id, category = %candidate.damage, "candidate filtered out");
                shared.diagnostics.skipped += 1;
            }
            Some(Ok(result)) => shared.results.push(result),
            Some(Err(e)) => {
                warn!(id = %candidate.id, error = %e, "candidate could not be compared");
                shared.diagnostics.failed += 1;
            }
        }

        if shared.diagnostics.processed >= total && shared.state == RunState::Running {
            self.finalize(&mut shared);
            return Ok(1.0);
        }
        Ok(progress_of(&shared, total))
    }

    /// Run every factor against the candidate at `index`.
    fn evaluate(&self, index: usize) -> Result<MatchResult, EngineError> {
        let candidate = &self.catalog.candidates[index];
        let mut raw_errors = Vec::with_capacity(self.factors.len());
        let mut registration = None;
        for factor in &self.factors {
            let outcome = factor.compare(&self.unknown, &candidate.outline)?;
            raw_errors.push(outcome.error);
            if registration.is_none() {
                registration = outcome.registration;
            }
        }
        Ok(MatchResult::new(candidate, raw_errors, registration))
    }

    /// Rescale every factor over the recorded results and combine.
    fn finalize(&self, shared: &mut RunShared) {
        shared.state = RunState::Finalizing;
        let factors = rescale(&self.factors, &mut shared.results);
        shared.diagnostics.factors = factors;
        shared.diagnostics.elapsed = self.clock.now().saturating_sub(shared.started);
        shared.state = RunState::Complete;
        info!(
            matched = shared.results.len(),
            skipped = shared.diagnostics.skipped,
            failed = shared.diagnostics.failed,
            elapsed_ms = duration_ms(shared.diagnostics.elapsed),
            "match run complete"
        );
    }

    /// Ranked results of the run.
    ///
    /// A run that was cancelled or not driven to the end is rescaled
    /// over the candidates it did process.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoCandidates`] when no candidate produced a
    /// result.
    pub fn into_result_set(self) -> Result<MatchResultSet, EngineError> {
        let mut shared = self.shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        if shared.results.is_empty() {
            return Err(EngineError::NoCandidates);
        }
        if shared.state != RunState::Complete {
            shared.diagnostics.factors = rescale(&self.factors, &mut shared.results);
            shared.diagnostics.elapsed = self.clock.now().saturating_sub(shared.started);
        }
        let mut set = MatchResultSet::default();
        let ms = duration_ms(shared.diagnostics.elapsed);
        set.match_time_ms = (ms > 0.0).then_some(ms);
        for result in shared.results {
            set.push(result);
        }
        set.sort();
        Ok(set)
    }
}

fn progress_of(shared: &RunShared, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let fraction = shared.diagnostics.processed as f64 / total as f64;
    fraction.min(1.0)
}

fn dependencies(factors: &[MatchFactor]) -> (Vec<FeaturePointType>, Vec<FeatureType>) {
    let points: BTreeSet<_> = factors
        .iter()
        .flat_map(|f| f.point_dependencies().iter().copied())
        .collect();
    let features: BTreeSet<_> = factors
        .iter()
        .flat_map(|f| f.feature_dependencies().iter().copied())
        .collect();
    (points.into_iter().collect(), features.into_iter().collect())
}

/// Per-factor rescale, then combined error and confidence per result.
///
/// Each factor's raw errors are scaled by `1 / (max - min)` with `min`
/// clamped to at most zero; a factor whose errors are all equal gets a
/// scale of zero. A non-finite raw error contributes the factor's full
/// weight.
fn rescale(factors: &[MatchFactor], results: &mut [MatchResult]) -> Vec<FactorDiagnostics> {
    let figures: Vec<FactorDiagnostics> = factors
        .iter()
        .enumerate()
        .map(|(k, factor)| {
            let finite = results
                .iter()
                .filter_map(|r| r.raw_errors.get(k).copied())
                .filter(|e| e.is_finite());
            let (min, max) = finite.fold((0.0_f64, f64::NEG_INFINITY), |(lo, hi), e| {
                (lo.min(e), hi.max(e))
            });
            let range = max - min;
            let scale = if range > 0.0 { 1.0 / range } else { 0.0 };
            FactorDiagnostics {
                weight: factor.weight(),
                min_raw: min,
                max_raw: max.max(min),
                scale,
            }
        })
        .collect();

    for result in results.iter_mut() {
        let error: f64 = figures
            .iter()
            .zip(&result.raw_errors)
            .map(|(f, &raw)| {
                if raw.is_finite() {
                    f.weight * f.scale * raw
                } else {
                    f.weight
                }
            })
            .sum();
        result.error = error;
        result.confidence = (1.0 - error).max(0.0);
    }
    figures
}
