//! finmatch: command-line front end for outline matching.
//!
//! Reads contours, outlines and catalogs as JSON and photos as image
//! files, drives the engine, and writes JSON, results reports and SVG
//! overlays:
//!
//! - `finalize`: normalize and evenly space a raw trace
//! - `refine`: snap a contour onto the edges of a photo
//! - `match`: rank a catalog against an unknown outline
//! - `report`: print a saved results report
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin finmatch -- match --unknown u.json --catalog c.json --out results.txt
//! ```
//!
//! Logging goes to stderr; set `RUST_LOG` to change the level.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use tracing::info;

use finmatch_core::edge::decode_image;
use finmatch_core::types::EnergyWeights;
use finmatch_core::{
    Catalog, CategoryFilter, Contour, EdgeChannel, EdgeRefiner, ErrorRange, MatchConfig,
    MatchPipeline, MatchResultSet, Outline, RegistrationMethod, RunControl, SnakeConfig,
    TraceConfig, Window, finalize_trace, presets, worker,
};
use finmatch_export::{SvgMetadata, to_overlay_svg, to_summary_json};

/// Outline matching for photo-identification of dorsal fins and bears.
#[derive(Parser)]
#[command(name = "finmatch", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize and evenly space a raw traced contour.
    Finalize(FinalizeArgs),
    /// Snap a contour onto the edges of a photo.
    Refine(RefineArgs),
    /// Rank a catalog of outlines against an unknown outline.
    Match(MatchArgs),
    /// Print a saved results report.
    Report(ReportArgs),
}

#[derive(Args)]
struct FinalizeArgs {
    /// Contour JSON file.
    #[arg(long)]
    contour: PathBuf,

    /// Treat the trace as a closed loop.
    #[arg(long)]
    closed_loop: bool,

    /// Point spacing after resampling, in normalized units.
    #[arg(long, default_value_t = TraceConfig::DEFAULT_KNOT_SPACING)]
    knot_spacing: f64,

    /// Pseudo-tip to pseudo-base distance after normalization.
    #[arg(long, default_value_t = TraceConfig::DEFAULT_NORMALIZED_LENGTH)]
    normalized_length: f64,

    /// Largest bearing change allowed between edges, in degrees.
    #[arg(long, default_value_t = TraceConfig::DEFAULT_MAX_TURN_ANGLE)]
    max_turn_angle: f64,

    /// Write the JSON here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct RefineArgs {
    /// Photo the contour was traced on (PNG, JPEG, BMP, WebP).
    #[arg(long)]
    image: PathBuf,

    /// Contour JSON file, in image pixels times the contour's scale.
    #[arg(long)]
    contour: PathBuf,

    /// Region to search for edges, as `left,top,right,bottom` pixels.
    /// Defaults to the whole image.
    #[arg(long, value_parser = parse_window)]
    window: Option<Window>,

    /// Continuity energy weight.
    #[arg(long, default_value_t = EnergyWeights::DEFAULT_CONTINUITY)]
    continuity: f64,

    /// Linearity energy weight.
    #[arg(long, default_value_t = EnergyWeights::DEFAULT_LINEARITY)]
    linearity: f64,

    /// Edge energy weight.
    #[arg(long, default_value_t = EnergyWeights::DEFAULT_EDGE)]
    edge: f64,

    /// Iteration budget across all scales.
    #[arg(long, default_value_t = SnakeConfig::DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// Neighbourhood radius searched per point.
    #[arg(long, default_value_t = SnakeConfig::DEFAULT_SEARCH_RADIUS)]
    search_radius: u32,

    /// Coarsest scale, as a percentage of full resolution.
    #[arg(long, default_value_t = SnakeConfig::DEFAULT_START_RATIO)]
    start_ratio: u32,

    /// Image channel fed to edge detection.
    #[arg(long, value_enum, default_value_t = Channel::Auto)]
    channel: Channel,

    /// Full snake config as a JSON string.
    ///
    /// When provided, the individual snake flags are ignored.
    #[arg(long)]
    config_json: Option<String>,

    /// Write the JSON here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct MatchArgs {
    /// Unknown outline JSON file.
    #[arg(long)]
    unknown: PathBuf,

    /// ID of the unknown, used to report its own rank. Defaults to the
    /// unknown file's stem.
    #[arg(long)]
    unknown_id: Option<String>,

    /// Catalog JSON file (a list of candidates).
    #[arg(long)]
    catalog: PathBuf,

    /// Registration method for outline factors.
    #[arg(long, value_enum, default_value_t = Method::TrimOptimalTip)]
    method: Method,

    /// Span the outline error is measured over.
    #[arg(long, value_enum, default_value_t = Range::Full)]
    error_range: Range,

    /// Only match candidates in these damage categories (repeatable).
    #[arg(long)]
    category: Vec<String>,

    /// Factor set to match with.
    #[arg(long, value_enum, default_value_t = Preset::Fin)]
    preset: Preset,

    /// Write the results report here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Write one SVG overlay per result into this directory.
    #[arg(long)]
    svg_dir: Option<PathBuf>,

    /// Print a JSON summary instead of the text report.
    #[arg(long)]
    json: bool,

    /// Full match config as a JSON string.
    ///
    /// When provided, `--method` and `--error-range` are ignored.
    #[arg(long)]
    config_json: Option<String>,
}

#[derive(Args)]
struct ReportArgs {
    /// Results report written by `finmatch match`.
    #[arg(long)]
    results: PathBuf,

    /// Print a JSON summary instead of a table.
    #[arg(long)]
    json: bool,
}

/// Edge detection channel selection.
#[derive(Clone, Copy, ValueEnum)]
enum Channel {
    /// Grayscale, falling back to cyan when too few edges are found.
    Auto,
    Grayscale,
    /// Cyan intensity of the CMYK decomposition.
    Cyan,
}

/// Registration method selection.
#[derive(Clone, Copy, ValueEnum)]
enum Method {
    /// Map the three traced anchors directly.
    Original3Point,
    /// Try fixed percentage trims of the leading edge.
    TrimFixedPercent,
    /// Hill-climb the tip and both trims.
    TrimOptimalTotal,
    /// Hill-climb the unknown's tip only.
    TrimOptimalTip,
    /// Like trim-optimal-total, scored by area between outlines.
    TrimOptimalArea,
}

/// Outline error span selection.
#[derive(Clone, Copy, ValueEnum)]
enum Range {
    /// Score the whole outline after registration.
    Full,
    /// Score only the span registration settled on.
    Trimmed,
}

/// Factor set selection.
#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    /// One outline factor on the leading edge, tip and trailing edge.
    Fin,
    /// Outline, brow, mouth dent and proportion factors.
    Bear,
}

const fn channel_to_core(c: Channel) -> EdgeChannel {
    match c {
        Channel::Auto => EdgeChannel::Auto,
        Channel::Grayscale => EdgeChannel::Grayscale,
        Channel::Cyan => EdgeChannel::Cyan,
    }
}

const fn method_to_core(m: Method) -> RegistrationMethod {
    match m {
        Method::Original3Point => RegistrationMethod::Original3Point,
        Method::TrimFixedPercent => RegistrationMethod::TrimFixedPercent,
        Method::TrimOptimalTotal => RegistrationMethod::TrimOptimalTotal,
        Method::TrimOptimalTip => RegistrationMethod::TrimOptimalTip,
        Method::TrimOptimalArea => RegistrationMethod::TrimOptimalArea,
    }
}

const fn range_to_core(r: Range) -> ErrorRange {
    match r {
        Range::Full => ErrorRange::Full,
        Range::Trimmed => ErrorRange::Trimmed,
    }
}

fn parse_window(s: &str) -> Result<Window, String> {
    let values: Vec<u32> = s
        .split(',')
        .map(|v| v.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("window values must be non-negative integers: {e}"))?;
    let [left, top, right, bottom] = values[..] else {
        return Err(format!("expected left,top,right,bottom, got {} values", values.len()));
    };
    if right <= left || bottom <= top {
        return Err("window must have positive width and height".to_owned());
    }
    Ok(Window {
        left,
        top,
        right,
        bottom,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("Error parsing {}: {e}", path.display()))
}

/// Write `text` to `out`, or print it when no path is given.
fn emit(out: Option<&Path>, text: &str) -> Result<(), String> {
    match out {
        Some(path) => {
            fs::write(path, text)
                .map_err(|e| format!("Error writing {}: {e}", path.display()))?;
            eprintln!("Written to {} ({} bytes)", path.display(), text.len());
            Ok(())
        }
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Error serializing JSON: {e}"))
}

fn finalize(args: &FinalizeArgs) -> Result<(), String> {
    let contour: Contour = read_json(&args.contour)?;
    let config = TraceConfig {
        knot_spacing: args.knot_spacing,
        normalized_length: args.normalized_length,
        max_turn_angle: args.max_turn_angle,
        closed_loop: args.closed_loop,
    };
    let finished =
        finalize_trace(&contour, &config).map_err(|e| format!("Finalize error: {e}"))?;
    eprintln!(
        "Finalized {} raw points into {} (scale {:.4})",
        contour.len(),
        finished.len(),
        finished.scale(),
    );
    emit(args.out.as_deref(), &to_json(&finished)?)
}

fn snake_config(args: &RefineArgs) -> Result<SnakeConfig, String> {
    if let Some(ref json) = args.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }
    Ok(SnakeConfig {
        weights: EnergyWeights {
            continuity: args.continuity,
            linearity: args.linearity,
            edge: args.edge,
        },
        max_iterations: args.max_iterations,
        search_radius: args.search_radius,
        start_ratio: args.start_ratio,
        channel: channel_to_core(args.channel),
        ..SnakeConfig::default()
    })
}

fn refine(args: &RefineArgs) -> Result<(), String> {
    let config = snake_config(args)?;
    let bytes = fs::read(&args.image)
        .map_err(|e| format!("Error reading {}: {e}", args.image.display()))?;
    let image = decode_image(&bytes).map_err(|e| format!("Image error: {e}"))?;
    let contour: Contour = read_json(&args.contour)?;
    let dimensions = finmatch_core::Dimensions {
        width: image.width(),
        height: image.height(),
    };
    let window = args
        .window
        .map_or_else(|| Window::full(dimensions), |w| w.clamp_to(dimensions));

    eprintln!(
        "Image: {} ({}x{}), window {window:?}",
        args.image.display(),
        dimensions.width,
        dimensions.height,
    );
    let mut updates = 0_usize;
    let refined = EdgeRefiner::new(config)
        .refine(&contour, &image, window, |_| {
            updates += 1;
            eprint!("\rRefining: {updates} updates");
        })
        .map_err(|e| format!("\nRefine error: {e}"))?;
    eprintln!();
    emit(args.out.as_deref(), &to_json(&refined)?)
}

fn match_config(args: &MatchArgs) -> Result<MatchConfig, String> {
    let config: MatchConfig = if let Some(ref json) = args.config_json {
        serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"))?
    } else {
        MatchConfig {
            registration: method_to_core(args.method),
            error_range: range_to_core(args.error_range),
            ..MatchConfig::default()
        }
    };
    config
        .validate()
        .map_err(|e| format!("Invalid match config: {e}"))?;
    Ok(config)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_owned()
}

/// File-name-safe form of a catalog ID: path separators, dots and
/// control characters become `_`.
fn overlay_file_name(rank: usize, id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{rank:03}-{safe}.svg")
}

fn write_overlays(dir: &Path, set: &MatchResultSet, config: &MatchConfig) -> Result<(), String> {
    fs::create_dir_all(dir).map_err(|e| format!("Error creating {}: {e}", dir.display()))?;
    let config_json =
        serde_json::to_string(config).map_err(|e| format!("Error serializing config: {e}"))?;
    for (i, result) in set.results().iter().enumerate() {
        let title = format!("{} vs {}", set.unknown_id, result.id);
        let description = format!("rank {} error {:.4}", i + 1, result.error);
        let svg = to_overlay_svg(
            result,
            &SvgMetadata {
                title: Some(&title),
                description: Some(&description),
                config_json: Some(&config_json),
            },
        );
        let path = dir.join(overlay_file_name(i + 1, &result.id));
        fs::write(&path, svg).map_err(|e| format!("Error writing {}: {e}", path.display()))?;
    }
    eprintln!("{} SVG overlays written to {}", set.len(), dir.display());
    Ok(())
}

fn run_match(args: &MatchArgs) -> Result<(), String> {
    let config = match_config(args)?;
    let unknown: Outline = read_json(&args.unknown)?;
    let catalog: Catalog = read_json(&args.catalog)?;
    eprintln!(
        "Unknown: {} ({} points), catalog: {} ({} candidates)",
        args.unknown.display(),
        unknown.contour().len(),
        args.catalog.display(),
        catalog.len(),
    );

    let factors = match args.preset {
        Preset::Fin => presets::dorsal_fin(&config),
        Preset::Bear => {
            presets::bear(&config, &catalog).map_err(|e| format!("Bear preset error: {e}"))?
        }
    };
    let filter = if args.category.is_empty() {
        CategoryFilter::All
    } else {
        CategoryFilter::only(&args.category)
    };

    let pipeline = MatchPipeline::new(unknown, catalog, factors)
        .map_err(|e| format!("Match setup error: {e}"))?;
    let mut last_percent = None;
    worker::drive(&pipeline, &filter, &RunControl::new(), |progress| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = (progress * 100.0).floor() as u32;
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            eprint!("\rMatching: {percent:>3}%");
        }
    })
    .map_err(|e| format!("\nMatch error: {e}"))?;
    eprintln!();
    eprintln!("{}", pipeline.diagnostics().report());

    let mut set = pipeline
        .into_result_set()
        .map_err(|e| format!("Match error: {e}"))?;
    set.unknown_id = args
        .unknown_id
        .clone()
        .unwrap_or_else(|| file_stem(&args.unknown));
    set.unknown_file = args.unknown.display().to_string();
    set.database_file = args.catalog.display().to_string();
    info!(results = set.len(), rank = ?set.find_rank(&set.unknown_id), "match finished");

    if let Some(ref dir) = args.svg_dir {
        write_overlays(dir, &set, &config)?;
    }
    if args.json {
        let json = to_summary_json(&set).map_err(|e| format!("Export error: {e}"))?;
        println!("{json}");
        if let Some(ref out) = args.out {
            emit(Some(out), &set.to_report())?;
        }
        return Ok(());
    }
    emit(args.out.as_deref(), &set.to_report())
}

fn report(args: &ReportArgs) -> Result<(), String> {
    let text = fs::read_to_string(&args.results)
        .map_err(|e| format!("Error reading {}: {e}", args.results.display()))?;
    let set = MatchResultSet::from_report(&text).map_err(|e| format!("Report error: {e}"))?;
    if args.json {
        let json = to_summary_json(&set).map_err(|e| format!("Export error: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    println!("Unknown: {}", set.unknown_id);
    match set.find_rank(&set.unknown_id) {
        Some(rank) => println!("Ranked: {rank}"),
        None => println!("Ranked: not in results"),
    }
    if let Some(ms) = set.match_time_ms {
        println!("Match time: {ms:.2}ms");
    }
    println!();
    println!(
        "{:>5} {:>10} {:<16} {:>8} {:<16}",
        "Rank", "Error", "ID", "Position", "Damage"
    );
    println!("{}", "-".repeat(60));
    for (i, r) in set.results().iter().enumerate() {
        println!(
            "{:>5} {:>10.4} {:<16} {:>8} {:<16}",
            i + 1,
            r.error,
            r.id,
            r.position + 1,
            r.damage
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Command::Finalize(args) => finalize(args),
        Command::Refine(args) => refine(args),
        Command::Match(args) => run_match(args),
        Command::Report(args) => report(args),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn window_parses_four_values() {
        let w = parse_window("10, 20,300,400").unwrap();
        assert_eq!((w.left, w.top, w.right, w.bottom), (10, 20, 300, 400));
    }

    #[test]
    fn window_rejects_bad_input() {
        assert!(parse_window("1,2,3").is_err());
        assert!(parse_window("a,b,c,d").is_err());
        assert!(parse_window("50,0,10,10").is_err());
    }

    #[test]
    fn overlay_names_stay_inside_the_directory() {
        assert_eq!(overlay_file_name(1, "JB-104"), "001-JB-104.svg");
        let name = overlay_file_name(12, "../../etc/x");
        assert_eq!(name, "012-______etc_x.svg");
        assert_eq!(Path::new(&name).components().count(), 1);
        assert!(!overlay_file_name(3, "a\\b/c").contains(['/', '\\']));
    }

    #[test]
    fn cli_parses_match_subcommand() {
        let cli = Cli::try_parse_from([
            "finmatch",
            "match",
            "--unknown",
            "u.json",
            "--catalog",
            "c.json",
            "--method",
            "trim-optimal-area",
            "--category",
            "Nicks",
            "--category",
            "Missing Tip",
        ])
        .unwrap();
        let Command::Match(args) = cli.command else {
            unreachable!("parsed as match");
        };
        assert_eq!(args.category.len(), 2);
        let config = match_config(&args).unwrap();
        assert_eq!(config.registration, RegistrationMethod::TrimOptimalArea);
    }

    #[test]
    fn config_json_overrides_flags() {
        let json = serde_json::to_string(&MatchConfig {
            trim_steps: 5,
            ..MatchConfig::default()
        })
        .unwrap();
        let cli = Cli::try_parse_from([
            "finmatch",
            "match",
            "--unknown",
            "u.json",
            "--catalog",
            "c.json",
            "--method",
            "trim-fixed-percent",
            "--config-json",
            &json,
        ])
        .unwrap();
        let Command::Match(args) = cli.command else {
            unreachable!("parsed as match");
        };
        let config = match_config(&args).unwrap();
        assert_eq!(config.trim_steps, 5);
        assert_eq!(config.registration, MatchConfig::default().registration);
    }

    #[test]
    fn refine_flags_build_snake_config() {
        let cli = Cli::try_parse_from([
            "finmatch",
            "refine",
            "--image",
            "p.png",
            "--contour",
            "c.json",
            "--edge",
            "4.0",
            "--channel",
            "cyan",
        ])
        .unwrap();
        let Command::Refine(args) = cli.command else {
            unreachable!("parsed as refine");
        };
        let config = snake_config(&args).unwrap();
        assert!((config.weights.edge - 4.0).abs() < f64::EPSILON);
        assert_eq!(config.channel, EdgeChannel::Cyan);
    }
}
