//! Configuration layer separating CLI arguments from internal run
//! configurations.
//!
//! CLI structs own argument parsing, help text, and validation; the internal
//! `DetectionConfig`/`SegmentationConfig` structs own the parameters the
//! pipelines actually consume, including model path resolution.

use clap::Parser;
use clap_verbosity_flag::Verbosity;

use crate::pipeline::AnalyzeOptions;

/// Environment variable consulted for the detection model when no
/// `--model-path` is given.
pub const DETECT_MODEL_ENV: &str = "BOUQUET_DETECT_MODEL_PATH";

/// Environment variable consulted for the segmentation model when no
/// `--model-path` is given.
pub const SEGMENT_MODEL_ENV: &str = "BOUQUET_SEGMENT_MODEL_PATH";

/// Parse probability value (must be between 0.0 and 1.0)
pub fn parse_probability(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !(0.0..=1.0).contains(&val) {
        return Err(format!("Must be between 0.0 and 1.0, got {val}"));
    }
    Ok(val)
}

/// Global CLI arguments that apply to all commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Device to use for inference (auto, cpu, coreml)
    #[arg(long, default_value = "auto", global = true)]
    pub device: String,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Disable colored output (also respects the NO_COLOR env var)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Write the JSON report to this file instead of stdout
    #[arg(long, global = true)]
    pub output: Option<String>,
}

/// CLI command for bouquet detection (only command-specific arguments)
#[derive(Parser, Debug, Clone)]
pub struct DetectCommand {
    /// Path to the input image
    #[arg(value_name = "IMAGE", required = true)]
    pub image: String,

    /// Confidence threshold for the primary pass (0.0-1.0)
    #[arg(short, long, default_value = "0.5", value_parser = parse_probability)]
    pub confidence: f32,

    /// IoU threshold for non-maximum suppression (0.0-1.0)
    #[arg(long, default_value = "0.45", value_parser = parse_probability)]
    pub overlap: f32,

    /// Run the low-confidence rescan to recover missed detections
    #[arg(long)]
    pub fill_missing: bool,

    /// Enhance contrast before detection
    #[arg(long)]
    pub prefilter: bool,

    /// Path to the detection model file (falls back to BOUQUET_DETECT_MODEL_PATH)
    #[arg(long)]
    pub model_path: Option<String>,

    /// Class labels in model output order, comma-separated
    #[arg(long, default_value = "flower")]
    pub labels: String,
}

/// CLI command for instance segmentation (only command-specific arguments)
#[derive(Parser, Debug, Clone)]
pub struct SegmentCommand {
    /// Path to the input image
    #[arg(value_name = "IMAGE", required = true)]
    pub image: String,

    /// Confidence threshold for instances (0.0-1.0)
    #[arg(long, default_value = "0.30", value_parser = parse_probability)]
    pub conf: f32,

    /// IoU threshold for non-maximum suppression (0.0-1.0)
    #[arg(long, default_value = "0.55", value_parser = parse_probability)]
    pub iou: f32,

    /// Model input size in pixels
    #[arg(long, default_value = "960")]
    pub imgsz: u32,

    /// Enhance contrast before segmentation
    #[arg(long)]
    pub prefilter: bool,

    /// Path to the segmentation model file (falls back to BOUQUET_SEGMENT_MODEL_PATH)
    #[arg(long)]
    pub model_path: Option<String>,
}

fn resolve_model_path(cli_path: Option<String>, env_var: &str) -> Result<String, String> {
    match cli_path {
        Some(path) => Ok(path),
        None => std::env::var(env_var)
            .map_err(|_| format!("No model path given; pass --model-path or set {env_var}")),
    }
}

/// Internal configuration for the detection pipeline
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub image: String,
    pub device: String,
    pub model_path: String,
    pub labels: Vec<String>,
    pub options: AnalyzeOptions,
}

impl DetectionConfig {
    /// Create configuration from global args and command-specific args
    pub fn from_args(global: GlobalArgs, cmd: DetectCommand) -> Result<Self, String> {
        let model_path = resolve_model_path(cmd.model_path, DETECT_MODEL_ENV)?;

        let labels: Vec<String> = cmd
            .labels
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if labels.is_empty() {
            return Err("No valid labels specified".to_string());
        }

        Ok(Self {
            image: cmd.image,
            device: global.device,
            model_path,
            labels,
            options: AnalyzeOptions {
                confidence: cmd.confidence,
                overlap: cmd.overlap,
                fill_missing: cmd.fill_missing,
                prefilter: cmd.prefilter,
            },
        })
    }
}

/// Internal configuration for the segmentation pipeline
#[derive(Debug, Clone)]
pub struct SegmentationConfig {
    pub image: String,
    pub device: String,
    pub model_path: String,
    pub conf: f32,
    pub iou: f32,
    pub imgsz: u32,
    pub prefilter: bool,
}

impl SegmentationConfig {
    /// Create configuration from global args and command-specific args
    pub fn from_args(global: GlobalArgs, cmd: SegmentCommand) -> Result<Self, String> {
        let model_path = resolve_model_path(cmd.model_path, SEGMENT_MODEL_ENV)?;
        if cmd.imgsz == 0 {
            return Err("imgsz must be positive".to_string());
        }

        Ok(Self {
            image: cmd.image,
            device: global.device,
            model_path,
            conf: cmd.conf,
            iou: cmd.iou,
            imgsz: cmd.imgsz,
            prefilter: cmd.prefilter,
        })
    }
}
