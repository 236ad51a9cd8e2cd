//! Detection records produced by the fusion pipeline.
//!
//! [`Detection`] is the externally visible record: it carries no `center` or
//! `area` field. Those are derived quantities the pipeline needs while
//! reasoning about geometry, so they live on the internal [`Scored`] wrapper
//! and are recomputed from the clipped bbox exactly once, at normalization
//! time. Nothing downstream can make them stale.

use image::RgbImage;
use serde::Serialize;

use crate::colors::{complementary_color, dominant_color, Rgb};
use crate::detector::RawDetection;
use crate::geometry::Point;

fn is_false(b: &bool) -> bool {
    !*b
}

/// One detected object, shaped for the final report.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub name: String,
    pub confidence: f32,
    /// Axis-aligned `[x1, y1, x2, y2]`, integer pixels, clipped to the image.
    pub bbox: [i64; 4],
    pub dominant_color: Rgb,
    pub complementary_color: Rgb,
    /// True only for detections recovered by the low-confidence rescan.
    #[serde(skip_serializing_if = "is_false")]
    pub inferred: bool,
}

/// Internal working record: a [`Detection`] plus the derived geometry the
/// planner, reconciler and assembler consume. Never serialized.
#[derive(Debug, Clone)]
pub struct Scored {
    pub record: Detection,
    pub center: Point,
    pub area: i64,
}

/// Clip a raw box to the image and build the working record, computing region
/// colors from the bbox crop. Returns `None` for boxes that are degenerate
/// after clipping (zero width or height).
pub fn score_raw_detection(
    raw: &RawDetection,
    image: &RgbImage,
    inferred: bool,
) -> Option<(Scored, RgbImage)> {
    let (width, height) = image.dimensions();

    let x1 = (raw.x1 as i64).clamp(0, width as i64);
    let y1 = (raw.y1 as i64).clamp(0, height as i64);
    let x2 = (raw.x2 as i64).clamp(0, width as i64);
    let y2 = (raw.y2 as i64).clamp(0, height as i64);

    if x1 >= x2 || y1 >= y2 {
        return None;
    }

    let crop = image::imageops::crop_imm(
        image,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    )
    .to_image();

    let dom = dominant_color(&crop);
    let center = ((x1 + x2) as f64 / 2.0, (y1 + y2) as f64 / 2.0);
    let area = (x2 - x1) * (y2 - y1);

    let record = Detection {
        name: raw.class_name.clone(),
        confidence: (raw.confidence * 10_000.0).round() / 10_000.0,
        bbox: [x1, y1, x2, y2],
        dominant_color: dom,
        complementary_color: complementary_color(dom),
        inferred,
    };

    Some((
        Scored {
            record,
            center,
            area,
        },
        crop,
    ))
}
