//! Ranked match results and the tab-delimited results report.
//!
//! # Report format
//!
//! ```text
//! Results for ID: <unknown id>
//! fin FILE: <traced unknown file>
//!  db FILE: <catalog file>
//! The ID is ranked <n>            (or: ID does not match any in the results list.)
//! Match Time: <ms>                (only when known, followed by a blank line)
//!  Rank\tError\tID\tDBPosit\tunkBegin\tunkTip\tunkEnd\tdbBegin\tdbTip\tdbEnd\tDamage
//! ____________...
//!   1\t0.12\tID\t<1-based position>\t<six anchor indices>\t<damage>
//! ```
//!
//! Anchor indices of results without a registration are written as `-1`.

use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::contour::Contour;
use crate::mapping::map_contour;
use crate::outline::{ControlPoints, Outline};
use crate::pipeline::{Candidate, Catalog};
use crate::registration::Registration;
use crate::types::EngineError;

const HEADER_PREFIX: &str = "Results for ID:";
const COLUMN_HEADER: &str =
    " Rank\tError\tID\tDBPosit\tunkBegin\tunkTip\tunkEnd\tdbBegin\tdbTip\tdbEnd\tDamage";
const SEPARATOR_CHAR: char = '_';
const SEPARATOR_WIDTH: usize = 69;
const MATCH_TIME_PREFIX: &str = "Match Time:";
/// Fewer lines than this cannot hold a report header.
const MIN_REPORT_LINES: usize = 6;

/// Field a result set can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortKey {
    #[default]
    Error,
    Name,
    IdCode,
    Damage,
    Date,
    Location,
}

/// One catalog candidate's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub id: String,
    pub name: String,
    pub damage: String,
    pub date: String,
    pub location: String,
    pub image: String,
    /// Zero-based catalog position.
    pub position: usize,
    /// Unscaled error of every factor, in pipeline order.
    pub raw_errors: Vec<f64>,
    /// Combined, rescaled error.
    pub error: f64,
    pub confidence: f64,
    /// One-based rank; only meaningful after sorting by error.
    pub rank: Option<usize>,
    pub unknown_points: Option<ControlPoints>,
    pub candidate_points: Option<ControlPoints>,
    /// The unknown contour mapped into the candidate's frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_contour: Option<Contour>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_contour: Option<Contour>,
}

impl MatchResult {
    /// A result for `candidate` with raw errors and no combined score yet.
    #[must_use]
    pub fn new(
        candidate: &Candidate,
        raw_errors: Vec<f64>,
        registration: Option<Registration>,
    ) -> Self {
        let (unknown_points, candidate_points, unknown_contour, candidate_contour) =
            registration.map_or((None, None, None, None), |r| {
                (
                    Some(r.unknown_points),
                    Some(r.candidate_points),
                    Some(r.unknown),
                    Some(r.candidate),
                )
            });
        Self {
            id: candidate.id.clone(),
            name: candidate.name.clone(),
            damage: candidate.damage.clone(),
            date: candidate.date.clone(),
            location: candidate.location.clone(),
            image: candidate.image.clone(),
            position: candidate.position,
            raw_errors,
            error: 0.0,
            confidence: 0.0,
            rank: None,
            unknown_points,
            candidate_points,
            unknown_contour,
            candidate_contour,
        }
    }

    fn sort_field(&self, key: SortKey) -> &str {
        match key {
            SortKey::Error => "",
            SortKey::Name => &self.name,
            SortKey::IdCode => &self.id,
            SortKey::Damage => &self.damage,
            SortKey::Date => &self.date,
            SortKey::Location => &self.location,
        }
    }
}

/// Results of one match run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResultSet {
    pub unknown_id: String,
    pub unknown_file: String,
    pub database_file: String,
    /// Run duration in milliseconds, when known.
    pub match_time_ms: Option<f64>,
    results: Vec<MatchResult>,
    last_sort: Option<SortKey>,
}

impl MatchResultSet {
    #[must_use]
    pub fn new(
        unknown_id: impl Into<String>,
        unknown_file: impl Into<String>,
        database_file: impl Into<String>,
    ) -> Self {
        Self {
            unknown_id: unknown_id.into(),
            unknown_file: unknown_file.into(),
            database_file: database_file.into(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, result: MatchResult) {
        self.results.push(result);
        self.last_sort = None;
    }

    #[must_use]
    pub fn results(&self) -> &[MatchResult] {
        &self.results
    }

    #[must_use]
    pub fn into_results(self) -> Vec<MatchResult> {
        self.results
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Sort by combined error, ascending, and assign ranks.
    pub fn sort(&mut self) {
        self.sort_by(SortKey::Error);
    }

    /// Stable sort by `key`. Ranks are reassigned only for
    /// [`SortKey::Error`]; other keys leave them as they were.
    pub fn sort_by(&mut self, key: SortKey) {
        match key {
            SortKey::Error => self.results.sort_by(|a, b| a.error.total_cmp(&b.error)),
            _ => self
                .results
                .sort_by(|a, b| compare_text(a.sort_field(key), b.sort_field(key))),
        }
        self.last_sort = Some(key);
        if key == SortKey::Error {
            for (i, r) in self.results.iter_mut().enumerate() {
                r.rank = Some(i + 1);
            }
        }
    }

    /// Whether the current order is by error, i.e. ranks match positions.
    #[must_use]
    pub fn last_sorted_by_error(&self) -> bool {
        self.last_sort == Some(SortKey::Error)
    }

    /// One-based position of the result with the given ID (compared
    /// case-insensitively).
    #[must_use]
    pub fn find_rank(&self, id: &str) -> Option<usize> {
        self.results
            .iter()
            .position(|r| r.id.eq_ignore_ascii_case(id))
            .map(|i| i + 1)
    }

    /// Render the results report.
    #[must_use]
    pub fn to_report(&self) -> String {
        let mut out = String::new();
        let id = if self.unknown_id.is_empty() {
            "NONE"
        } else {
            &self.unknown_id
        };
        let _ = writeln!(out, "{HEADER_PREFIX} {id}");
        let _ = writeln!(out, "fin FILE: {}", self.unknown_file);
        let _ = writeln!(out, " db FILE: {}", self.database_file);
        match self.find_rank(&self.unknown_id) {
            Some(rank) => {
                let _ = writeln!(out, "The ID is ranked {rank}");
            }
            None => out.push_str("ID does not match any in the results list.\n"),
        }
        if let Some(ms) = self.match_time_ms.filter(|ms| *ms > 0.0) {
            let _ = writeln!(out, "{MATCH_TIME_PREFIX} {ms:.2}\n");
        }
        let _ = writeln!(out, "{COLUMN_HEADER}");
        let _ = writeln!(out, "{}", SEPARATOR_CHAR.to_string().repeat(SEPARATOR_WIDTH));

        for (i, r) in self.results.iter().enumerate() {
            let indices = anchor_columns(r.unknown_points, r.candidate_points);
            let _ = writeln!(
                out,
                "  {}\t{:.2}\t{}\t{}\t{}\t{}",
                i + 1,
                r.error,
                r.id,
                r.position + 1,
                indices,
                r.damage
            );
        }
        out
    }

    /// Parse a results report.
    ///
    /// Text that is too short or does not start with the report header
    /// yields an empty set. Rows carry only what the report holds; use
    /// [`Self::restore_contours`] to bring back catalog details and the
    /// aligned contours.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ReportParse`] for a malformed result row.
    pub fn from_report(text: &str) -> Result<Self, EngineError> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < MIN_REPORT_LINES || !lines[0].starts_with(HEADER_PREFIX) {
            return Ok(Self::default());
        }
        let after_first_colon =
            |line: &str| line.split_once(':').map_or("", |(_, v)| v).trim().to_owned();
        let unknown_id = lines[0]
            .rsplit_once(':')
            .map_or("", |(_, v)| v)
            .trim()
            .to_owned();
        let mut set = Self::new(
            if unknown_id == "NONE" {
                String::new()
            } else {
                unknown_id
            },
            after_first_colon(lines[1]),
            after_first_colon(lines[2]),
        );

        let Some(separator) = lines
            .iter()
            .position(|l| !l.is_empty() && l.chars().all(|c| c == SEPARATOR_CHAR))
        else {
            return Ok(set);
        };
        set.match_time_ms = lines[..separator]
            .iter()
            .find_map(|l| l.strip_prefix(MATCH_TIME_PREFIX))
            .and_then(|v| v.trim().parse().ok());

        for (n, line) in lines.iter().enumerate().skip(separator + 1) {
            if line.trim().is_empty() {
                continue;
            }
            set.results.push(parse_row(line, n + 1)?);
        }
        set.sort();
        Ok(set)
    }

    /// Fill in catalog details and rebuild the aligned contour pair of
    /// every result from its anchor indices.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IndexOutOfRange`] for a catalog position or
    /// anchor that does not exist, and mapping errors for degenerate
    /// anchors.
    pub fn restore_contours(
        &mut self,
        unknown: &Outline,
        catalog: &Catalog,
    ) -> Result<(), EngineError> {
        for r in &mut self.results {
            let candidate = catalog
                .get(r.position)
                .ok_or(EngineError::IndexOutOfRange {
                    index: r.position,
                    len: catalog.len(),
                })?;
            if candidate.id != r.id {
                warn!(
                    position = r.position,
                    report_id = %r.id,
                    catalog_id = %candidate.id,
                    "report row does not match catalog entry"
                );
            }
            r.name.clone_from(&candidate.name);
            r.date.clone_from(&candidate.date);
            r.location.clone_from(&candidate.location);
            r.image.clone_from(&candidate.image);

            let (Some(u), Some(c)) = (r.unknown_points, r.candidate_points) else {
                continue;
            };
            let target = candidate.outline.contour();
            let dst = [target.point(c.begin)?, target.point(c.tip)?, target.point(c.end)?];
            r.unknown_contour = Some(map_contour(unknown.contour(), u.as_array(), dst)?);
            r.candidate_contour = Some(target.clone());
        }
        Ok(())
    }
}

fn compare_text(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

fn anchor_columns(u: Option<ControlPoints>, c: Option<ControlPoints>) -> String {
    let triple = |cp: Option<ControlPoints>| match cp {
        Some(cp) => format!("{}\t{}\t{}", cp.begin, cp.tip, cp.end),
        None => "-1\t-1\t-1".to_owned(),
    };
    format!("{}\t{}", triple(u), triple(c))
}

fn parse_row(line: &str, line_number: usize) -> Result<MatchResult, EngineError> {
    let bad = |reason: String| EngineError::ReportParse {
        line: line_number,
        reason,
    };
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 10 {
        return Err(bad(format!("expected at least 10 fields, found {}", fields.len())));
    }
    let error: f64 = fields[1]
        .trim()
        .parse()
        .map_err(|_| bad(format!("bad error value {:?}", fields[1])))?;
    let int = |i: usize| -> Result<i64, EngineError> {
        fields[i]
            .trim()
            .parse()
            .map_err(|_| bad(format!("bad integer {:?} in column {}", fields[i], i + 1)))
    };
    let position = usize::try_from(int(3)?)
        .ok()
        .and_then(|p| p.checked_sub(1))
        .ok_or_else(|| bad(format!("bad catalog position {:?}", fields[3])))?;
    let triple = |start: usize| -> Result<Option<ControlPoints>, EngineError> {
        let values = [int(start)?, int(start + 1)?, int(start + 2)?];
        Ok(match values.map(usize::try_from) {
            [Ok(b), Ok(t), Ok(e)] => Some(ControlPoints::new(b, t, e)),
            _ => None,
        })
    };
    Ok(MatchResult {
        id: fields[2].to_owned(),
        name: String::new(),
        damage: fields.get(10).map_or_else(String::new, |d| (*d).to_owned()),
        date: String::new(),
        location: String::new(),
        image: String::new(),
        position,
        raw_errors: Vec::new(),
        error,
        confidence: (1.0 - error).max(0.0),
        rank: None,
        unknown_points: triple(4)?,
        candidate_points: triple(7)?,
        unknown_contour: None,
        candidate_contour: None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn result(id: &str, name: &str, error: f64, position: usize) -> MatchResult {
        MatchResult {
            id: id.to_owned(),
            name: name.to_owned(),
            damage: "Nicks".to_owned(),
            date: String::new(),
            location: String::new(),
            image: String::new(),
            position,
            raw_errors: vec![error],
            error,
            confidence: 1.0 - error,
            rank: None,
            unknown_points: Some(ControlPoints::new(0, 10 + position, 40)),
            candidate_points: Some(ControlPoints::new(1, 12, 38 + position)),
            unknown_contour: None,
            candidate_contour: None,
        }
    }

    fn sample() -> MatchResultSet {
        let mut set = MatchResultSet::new("B-12", "unknown.finz", "catalog.db");
        set.push(result("A-1", "zed", 0.40, 0));
        set.push(result("B-12", "amy", 0.05, 1));
        set.push(result("C-3", "max", 0.90, 2));
        set.push(result("D-4", "bob", 0.40, 3));
        set
    }

    #[test]
    fn sort_orders_by_error_and_ranks() {
        let mut set = sample();
        set.sort();
        let errors: Vec<f64> = set.results().iter().map(|r| r.error).collect();
        assert!(errors.windows(2).all(|w| w[0] <= w[1]));
        for (i, r) in set.results().iter().enumerate() {
            assert_eq!(r.rank, Some(i + 1));
        }
        assert!(set.last_sorted_by_error());
        assert_eq!(set.find_rank("b-12"), Some(1));
        assert_eq!(set.find_rank("nope"), None);
    }

    #[test]
    fn other_keys_leave_ranks_stale() {
        let mut set = sample();
        set.sort();
        set.sort_by(SortKey::Name);
        assert!(!set.last_sorted_by_error());
        assert_eq!(set.results()[0].name, "amy");
        assert_eq!(set.results()[0].rank, Some(1));
        assert_eq!(set.results()[1].name, "bob");
        assert_eq!(set.results()[1].rank, Some(3));
    }

    #[test]
    fn report_layout() {
        let mut set = sample();
        set.sort();
        set.match_time_ms = Some(1500.0);
        let text = set.to_report();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Results for ID: B-12");
        assert_eq!(lines[1], "fin FILE: unknown.finz");
        assert_eq!(lines[2], " db FILE: catalog.db");
        assert_eq!(lines[3], "The ID is ranked 1");
        assert_eq!(lines[4], "Match Time: 1500.00");
        assert_eq!(lines[5], "");
        assert_eq!(lines[6], COLUMN_HEADER);
        assert!(lines[7].chars().all(|c| c == '_'));
        assert_eq!(lines[8], "  1\t0.05\tB-12\t2\t0\t11\t40\t1\t12\t39\tNicks");
    }

    #[test]
    fn report_round_trips() {
        let mut set = sample();
        set.sort();
        let loaded = MatchResultSet::from_report(&set.to_report()).unwrap();
        assert_eq!(loaded.unknown_id, "B-12");
        assert_eq!(loaded.unknown_file, "unknown.finz");
        assert_eq!(loaded.database_file, "catalog.db");
        assert_eq!(loaded.len(), set.len());
        for (a, b) in loaded.results().iter().zip(set.results()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.rank, b.rank);
            assert_eq!(a.position, b.position);
            assert_eq!(a.unknown_points, b.unknown_points);
            assert_eq!(a.candidate_points, b.candidate_points);
            assert_eq!(a.damage, b.damage);
        }
        assert!(loaded.match_time_ms.is_none());
    }

    #[test]
    fn missing_anchors_round_trip_as_none() {
        let mut set = sample();
        let mut r = result("E-5", "eve", 0.3, 4);
        r.unknown_points = None;
        r.candidate_points = None;
        set.push(r);
        set.sort();
        let loaded = MatchResultSet::from_report(&set.to_report()).unwrap();
        let e5 = &loaded.results()[loaded.find_rank("E-5").unwrap() - 1];
        assert!(e5.unknown_points.is_none());
    }

    #[test]
    fn short_or_foreign_text_loads_empty() {
        assert!(MatchResultSet::from_report("").unwrap().is_empty());
        let foreign = "hello\n1\n2\n3\n4\n5\n6\n";
        assert!(MatchResultSet::from_report(foreign).unwrap().is_empty());
    }

    #[test]
    fn malformed_row_is_reported() {
        let mut text = sample().to_report();
        text.push_str("  9\tnot-a-number\tX\t1\t0\t1\t2\t0\t1\t2\tNone\n");
        assert!(matches!(
            MatchResultSet::from_report(&text),
            Err(EngineError::ReportParse { .. })
        ));
    }

    #[test]
    fn unknown_outside_results_is_reported() {
        let mut set = MatchResultSet::new("Z-9", "u", "d");
        set.push(result("A-1", "a", 0.1, 0));
        set.push(result("A-2", "b", 0.2, 1));
        let text = set.to_report();
        assert!(text.contains("ID does not match any in the results list."));
    }
}
