//! The detection-fusion pipeline: normalize the primary pass, plan candidate
//! gap locations, reconcile the low-confidence rescan, and assemble the final
//! report under a unified acceptance policy.
//!
//! Everything is per-request state; nothing is shared between invocations, so
//! callers may run `analyze_image` concurrently as long as each call owns its
//! detector handle.

use std::borrow::Cow;
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use image::RgbImage;
use log::{debug, info, warn};
use serde::Serialize;

use crate::colors::{average_color, combined_region_color, Rgb};
use crate::detection::{score_raw_detection, Detection, Scored};
use crate::detector::Detector;
use crate::geometry::{distance, median, Point};
use crate::planner::plan_candidates;
use crate::prefilter;
use crate::reconcile::{log_degraded, reconcile_rescan, GapFill};

/// Isolated-detection gate: a detection only counts when another primary
/// center lies within this fraction of the image width.
const NEIGHBOR_RADIUS_FRACTION: f64 = 0.35;

/// Oversize gate applied during assembly, relative to the median area.
const OVERSIZE_FACTOR: f64 = 15.0;

/// Request-level tunables consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Primary confidence threshold in [0, 1].
    pub confidence: f32,
    /// IoU threshold forwarded to the detector on both passes.
    pub overlap: f32,
    /// Enables the candidate planner and low-confidence rescan.
    pub fill_missing: bool,
    /// Enables contrast enhancement before any detector call.
    pub prefilter: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            overlap: 0.45,
            fill_missing: false,
            prefilter: false,
        }
    }
}

/// Final per-image report.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub detailed: Vec<Detection>,
    /// Per-label mean color over every primary crop carrying that label.
    pub bounding_box_avcolor: BTreeMap<String, Rgb>,
    /// One color over the union of all accepted boxes.
    pub bouquet_color: Rgb,
}

/// Primary-pass normalization output.
struct NormalizedSet {
    detections: Vec<Scored>,
    buckets: BTreeMap<String, Vec<RgbImage>>,
    centers: Vec<Point>,
    areas: Vec<f64>,
}

fn normalize_primary(
    raw: &[crate::detector::RawDetection],
    image: &RgbImage,
) -> NormalizedSet {
    let mut detections = Vec::new();
    let mut buckets: BTreeMap<String, Vec<RgbImage>> = BTreeMap::new();
    let mut centers = Vec::new();
    let mut areas = Vec::new();

    for det in raw {
        let Some((scored, crop)) = score_raw_detection(det, image, false) else {
            debug!("dropping degenerate primary box {det:?}");
            continue;
        };
        centers.push(scored.center);
        areas.push(scored.area as f64);
        buckets
            .entry(scored.record.name.clone())
            .or_default()
            .push(crop);
        detections.push(scored);
    }

    NormalizedSet {
        detections,
        buckets,
        centers,
        areas,
    }
}

/// True when at least one *other* primary center lies within the neighbor
/// radius of `center`.
fn has_close_neighbor(center: Point, primary_centers: &[Point], radius: f64) -> bool {
    primary_centers
        .iter()
        .any(|other| *other != center && distance(*other, center) < radius)
}

/// Run the full fusion pipeline on one image.
///
/// Primary detector errors are terminal for the request; the gap-filling
/// sub-path degrades to primary-only results on any internal failure.
pub fn analyze_image(
    detector: &mut dyn Detector,
    image: &RgbImage,
    options: &AnalyzeOptions,
) -> Result<AnalysisReport> {
    let working: Cow<RgbImage> = if options.prefilter {
        match prefilter::enhance(image) {
            Ok(enhanced) => Cow::Owned(enhanced),
            Err(e) => {
                warn!("prefilter failed, using unmodified image: {e}");
                Cow::Borrowed(image)
            }
        }
    } else {
        Cow::Borrowed(image)
    };

    let raw = detector
        .detect(&working, options.confidence, options.overlap)
        .context("primary detection pass failed")?;
    let primary = normalize_primary(&raw, &working);
    info!(
        "primary pass: {} detection(s) at conf {:.2}",
        primary.detections.len(),
        options.confidence
    );

    let median_area = median(&primary.areas);
    let image_width = working.width() as f64;

    let mut all = primary.detections.clone();
    let mut low_conf = None;

    if options.fill_missing {
        let plan = plan_candidates(&primary.centers, median_area);
        match reconcile_rescan(
            detector,
            &working,
            options.confidence,
            options.overlap,
            &plan,
            median_area,
        ) {
            GapFill::Filled {
                detections,
                low_conf: lc,
            } => {
                info!("gap filling recovered {} detection(s)", detections.len());
                low_conf = Some(lc);
                all.extend(detections);
            }
            GapFill::Degraded { reason, low_conf: lc } => {
                log_degraded(&reason);
                low_conf = lc;
            }
        }
    }

    let accept_threshold = match low_conf {
        Some(lc) if options.fill_missing => lc,
        _ => options.confidence,
    };
    let neighbor_radius = NEIGHBOR_RADIUS_FRACTION * image_width;

    let mut detailed = Vec::new();
    for scored in &all {
        let accepted = scored.record.inferred || scored.record.confidence >= accept_threshold;
        if !accepted {
            continue;
        }
        if options.fill_missing {
            let plausible_size = (scored.area as f64) < OVERSIZE_FACTOR * median_area;
            let clustered =
                has_close_neighbor(scored.center, &primary.centers, neighbor_radius);
            if !(plausible_size && clustered) {
                debug!(
                    "rejecting spatially implausible detection at {:?}",
                    scored.record.bbox
                );
                continue;
            }
        }
        detailed.push(scored.record.clone());
    }

    let bounding_box_avcolor = primary
        .buckets
        .iter()
        .map(|(label, crops)| (label.clone(), average_color(crops)))
        .collect();
    let accepted_boxes: Vec<[i64; 4]> = detailed.iter().map(|d| d.bbox).collect();
    let bouquet_color = combined_region_color(&working, &accepted_boxes);

    Ok(AnalysisReport {
        detailed,
        bounding_box_avcolor,
        bouquet_color,
    })
}
