//! Match run diagnostics: counts, per-factor error ranges, timing.
//!
//! Every [`MatchPipeline`](crate::pipeline::MatchPipeline) keeps a
//! [`RunDiagnostics`] up to date as candidates are processed, and fills
//! in the per-factor rescale figures when the run completes.
//!
//! Time is read through the [`Clock`] trait so tests can drive it.
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Monotonic time source.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Rescale figures for one factor, in pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDiagnostics {
    pub weight: f64,
    /// Smallest raw error seen, clamped to at most zero.
    pub min_raw: f64,
    pub max_raw: f64,
    /// `1 / (max_raw - min_raw)`, or zero when every error was equal.
    pub scale: f64,
}

/// Diagnostics for one match run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Catalog size.
    pub candidates: usize,
    /// Candidates taken off the queue (including skipped and failed).
    pub processed: usize,
    /// Candidates excluded by the category filter.
    pub skipped: usize,
    /// Candidates whose factors failed; they are left out of the results.
    pub failed: usize,
    /// Filled in when the run completes.
    pub factors: Vec<FactorDiagnostics>,
    /// Wall-clock time from the first candidate to completion (seconds).
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
}

impl RunDiagnostics {
    /// Candidates that produced a result.
    #[must_use]
    pub const fn matched(&self) -> usize {
        self.processed.saturating_sub(self.skipped + self.failed)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Match Run Diagnostics\n{}", "=".repeat(60)));
        lines.push(format!(
            "Candidates: {}  processed: {}  matched: {}  skipped: {}  failed: {}",
            self.candidates,
            self.processed,
            self.matched(),
            self.skipped,
            self.failed,
        ));
        lines.push(format!("Elapsed: {:.3}ms", duration_ms(self.elapsed)));
        lines.push(String::new());

        lines.push(format!(
            "{:<8} {:>8} {:>12} {:>12} {:>12}",
            "Factor", "Weight", "Min raw", "Max raw", "Scale"
        ));
        lines.push("-".repeat(56));
        for (i, f) in self.factors.iter().enumerate() {
            lines.push(format!(
                "{i:<8} {:>8.3} {:>12.4} {:>12.4} {:>12.6}",
                f.weight, f.min_raw, f.max_raw, f.scale
            ));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
