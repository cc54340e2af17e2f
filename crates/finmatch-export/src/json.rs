//! JSON summary of a ranked result set.

use serde::Serialize;

use finmatch_core::MatchResultSet;

/// Export failure.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct Summary<'a> {
    unknown_id: &'a str,
    unknown_file: &'a str,
    database_file: &'a str,
    /// One-based rank of the unknown's own ID, when it is in the catalog.
    unknown_rank: Option<usize>,
    match_time_ms: Option<f64>,
    results: Vec<SummaryRow<'a>>,
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    rank: Option<usize>,
    id: &'a str,
    name: &'a str,
    damage: &'a str,
    error: f64,
    confidence: f64,
    /// One-based, as in the text report.
    catalog_position: usize,
    raw_errors: &'a [f64],
}

/// Ranked rows of `set` as pretty-printed JSON, in the set's current
/// order.
///
/// # Errors
///
/// Returns [`ExportError::Json`] if serialization fails, which happens
/// only for non-finite errors.
pub fn to_summary_json(set: &MatchResultSet) -> Result<String, ExportError> {
    let summary = Summary {
        unknown_id: &set.unknown_id,
        unknown_file: &set.unknown_file,
        database_file: &set.database_file,
        unknown_rank: set.find_rank(&set.unknown_id),
        match_time_ms: set.match_time_ms,
        results: set
            .results()
            .iter()
            .map(|r| SummaryRow {
                rank: r.rank,
                id: &r.id,
                name: &r.name,
                damage: &r.damage,
                error: r.error,
                confidence: r.confidence,
                catalog_position: r.position + 1,
                raw_errors: &r.raw_errors,
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&summary)?)
}
