//! stereoscope CLI: rectify a stereo pair, replay measurement scripts.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use stereoscope::correction::{
    load_json, save_png, CalibrationSource, CorrectionOptions, DirectoryCalibrationSource,
};
use stereoscope::core::ImageSize;
use stereoscope::measure::LabelFont;
use stereoscope::{rectify_pair, run_script, ServiceConfig};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "stereoscope")]
#[command(about = "Stereo-endoscope correction and 3-D measurement tools")]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines (RUST_LOG filters).
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    json_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Undistort and rectify a raw stereo pair.
    Rectify(RectifyArgs),

    /// Replay a measurement script and print the measurements as JSON.
    Measure(MeasureArgs),

    /// Replay a measurement script and draw it over an image.
    Render(RenderArgs),
}

#[derive(Debug, Clone, Args)]
struct RectifyArgs {
    /// Directory holding `calibration.json` or the per-matrix text files.
    #[arg(long)]
    calib: PathBuf,

    /// Raw left image.
    #[arg(long)]
    left: PathBuf,

    /// Raw right image.
    #[arg(long)]
    right: PathBuf,

    /// Output directory; created if missing.
    #[arg(long)]
    out: PathBuf,

    /// Service configuration (JSON); only its `correction` section is read.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct MeasureArgs {
    /// Script file (JSON).
    #[arg(long)]
    script: PathBuf,

    /// Also write the report here.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct RenderArgs {
    /// Script file (JSON).
    #[arg(long)]
    script: PathBuf,

    /// Image to draw on; the script's depth frame is scaled onto it.
    #[arg(long)]
    image: PathBuf,

    /// Output PNG.
    #[arg(long)]
    out: PathBuf,

    /// TrueType font for labels; stroke glyphs otherwise.
    #[arg(long)]
    font: Option<PathBuf>,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Commands::Rectify(args) => run_rectify(&args),
        Commands::Measure(args) => run_measure(&args),
        Commands::Render(args) => run_render(&args),
    }
}

fn init_logging(cli: &Cli) -> CliResult<()> {
    #[cfg(feature = "tracing")]
    if cli.json_log {
        stereoscope::core::init_tracing(true);
        return Ok(());
    }
    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    stereoscope::core::init_with_level(level)?;
    Ok(())
}

// ── rectify ────────────────────────────────────────────────────────────

fn run_rectify(args: &RectifyArgs) -> CliResult<()> {
    log::info!("loading {} and {}", args.left.display(), args.right.display());
    let left = image::open(&args.left)?.to_rgb8();
    let right = image::open(&args.right)?.to_rgb8();
    if left.dimensions() != right.dimensions() {
        return Err(format!(
            "left is {:?} but right is {:?}",
            left.dimensions(),
            right.dimensions()
        )
        .into());
    }

    let options = match &args.config {
        Some(path) => load_json::<ServiceConfig>(path)?.correction,
        None => CorrectionOptions::default(),
    };
    let calibration = DirectoryCalibrationSource::new(ImageSize::of(&left)).load(&args.calib)?;
    let pair = rectify_pair(calibration, options, &left, &right)?;

    std::fs::create_dir_all(&args.out)?;
    for path in pair.write(&args.out)? {
        println!("{}", path.display());
    }
    Ok(())
}

// ── measure ────────────────────────────────────────────────────────────

fn run_measure(args: &MeasureArgs) -> CliResult<()> {
    let (_, report) = run_script(&args.script)?;
    for msg in &report.messages {
        log::warn!("{msg}");
    }
    let json = serde_json::to_string_pretty(&report)?;
    if let Some(out) = &args.out {
        std::fs::write(out, &json)?;
    }
    println!("{json}");
    Ok(())
}

// ── render ─────────────────────────────────────────────────────────────

fn run_render(args: &RenderArgs) -> CliResult<()> {
    let (session, report) = run_script(&args.script)?;
    let base = image::open(&args.image)?.to_rgb8();
    let font = match &args.font {
        Some(path) => LabelFont::from_bytes(std::fs::read(path)?)?,
        None => LabelFont::Stroke,
    };
    let out = session.render(&base, font);
    save_png(&args.out, &out)?;
    log::info!(
        "drew {} measurements to {}",
        report.measurements.len(),
        args.out.display()
    );
    Ok(())
}
