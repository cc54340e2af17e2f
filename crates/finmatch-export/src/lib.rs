//! finmatch-export: Pure serializers for match results (sans-IO)
//!
//! Renders an aligned outline pair as SVG and a ranked result set as a
//! JSON summary. Every function returns a `String`; writing it anywhere
//! is the caller's job.

pub mod json;
pub mod svg;

pub use json::{ExportError, to_summary_json};
pub use svg::{SvgMetadata, build_path_data, to_overlay_svg};
