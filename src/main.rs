use clap::Parser;
use colored::*;
use env_logger::{Builder, Env};
use log::{error, info, Level};
use std::io::Write;

use bouquet::config::{
    DetectCommand, DetectionConfig, GlobalArgs, SegmentCommand, SegmentationConfig,
};
use bouquet::pipeline::analyze_image;
use bouquet::prefilter;
use bouquet::segmentation::{run_segmentation, OnnxSegmenter};
use bouquet::yolo::OnnxDetector;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Detect flowers and report per-flower and bouquet colors
    Detect(DetectCommand),

    /// Segment flower instances into polygon outlines
    Segment(SegmentCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "bouquet")]
#[command(about = "Bouquet detection and color analysis toolkit")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    let base_level = verbosity.log_level_filter();
    let adjusted_level = match base_level {
        log::LevelFilter::Off => log::LevelFilter::Off, // -qq -> OFF
        log::LevelFilter::Error => log::LevelFilter::Warn, // default -> WARN
        log::LevelFilter::Warn => log::LevelFilter::Info, // -v -> INFO
        log::LevelFilter::Info => log::LevelFilter::Debug, // -vv -> DEBUG
        log::LevelFilter::Debug => log::LevelFilter::Trace, // -vvv -> TRACE
        log::LevelFilter::Trace => log::LevelFilter::Trace, // -vvvv -> TRACE (max)
    };

    // clap-verbosity-flag doesn't distinguish default from -q, so check the
    // quiet flag directly.
    if verbosity.is_silent() {
        log::LevelFilter::Error // -q -> ERROR
    } else {
        adjusted_level
    }
}

const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tiff"];

fn load_image(path: &str) -> anyhow::Result<image::RgbImage> {
    let extension = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        anyhow::bail!("Unsupported image format '{extension}' for {path}");
    }
    let img = image::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open image {path}: {e}"))?;
    Ok(img.to_rgb8())
}

fn write_report(output: &Option<String>, json: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .map_err(|e| anyhow::anyhow!("Failed to write {path}: {e}"))?;
            info!("Report written to {path}");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn run_detect(global: &GlobalArgs, cmd: &DetectCommand) -> anyhow::Result<()> {
    let config = DetectionConfig::from_args(global.clone(), cmd.clone())
        .map_err(|e| anyhow::anyhow!(e))?;

    info!(
        "🌸 Detection: {} | conf: {} | IoU: {} | device: {}",
        config.image, config.options.confidence, config.options.overlap, config.device
    );
    let mut features = Vec::new();
    if config.options.fill_missing {
        features.push("fill-missing");
    }
    if config.options.prefilter {
        features.push("prefilter");
    }
    if !features.is_empty() {
        info!("   Features: {}", features.join(", "));
    }

    let image = load_image(&config.image)?;
    let mut detector =
        OnnxDetector::from_file(&config.model_path, &config.device, config.labels.clone())?;

    let report = analyze_image(&mut detector, &image, &config.options)?;
    info!("Accepted {} detection(s)", report.detailed.len());

    let json = serde_json::to_string_pretty(&report)?;
    write_report(&global.output, &json)
}

fn run_segment(global: &GlobalArgs, cmd: &SegmentCommand) -> anyhow::Result<()> {
    let config = SegmentationConfig::from_args(global.clone(), cmd.clone())
        .map_err(|e| anyhow::anyhow!(e))?;

    info!(
        "✂️  Segmentation: {} | conf: {} | IoU: {} | imgsz: {} | device: {}",
        config.image, config.conf, config.iou, config.imgsz, config.device
    );

    let image = load_image(&config.image)?;
    let image = if config.prefilter {
        match prefilter::enhance(&image) {
            Ok(enhanced) => enhanced,
            Err(e) => {
                log::warn!("prefilter failed, using unmodified image: {e}");
                image
            }
        }
    } else {
        image
    };

    let mut segmenter = OnnxSegmenter::from_file(&config.model_path, &config.device)?;
    let report = run_segmentation(&mut segmenter, &image, config.conf, config.iou, config.imgsz)?;
    info!("Segmented {} instance(s)", report.instances.len());

    let json = serde_json::to_string_pretty(&report)?;
    write_report(&global.output, &json)
}

fn main() {
    let cli = Cli::parse();

    // If user didn't pass -v/-q and RUST_LOG is set, honor the env var.
    let use_env = !cli.global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let level_filter = get_log_level_from_verbosity(cli.global.verbosity.clone());

        let mut b = Builder::new();
        b.filter_level(level_filter);
        b
    };

    if cli.global.no_color || std::env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    }

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => "ERROR".red().bold().to_string(),
                Level::Warn => "WARN".yellow().to_string(),
                Level::Info => "INFO".green().to_string(),
                Level::Debug => "DEBUG".blue().to_string(),
                Level::Trace => "TRACE".magenta().to_string(),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();

    match &cli.command {
        Some(Commands::Detect(detect_cmd)) => {
            if let Err(e) = run_detect(&cli.global, detect_cmd) {
                error!("❌ Detection failed: {e}");
                std::process::exit(1);
            }
        }
        Some(Commands::Segment(segment_cmd)) => {
            if let Err(e) = run_segment(&cli.global, segment_cmd) {
                error!("❌ Segmentation failed: {e}");
                std::process::exit(1);
            }
        }
        Some(Commands::Version) => {
            println!("bouquet v{}", env!("CARGO_PKG_VERSION"));
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().unwrap();
        }
    }
}
