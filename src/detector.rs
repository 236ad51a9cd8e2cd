//! Detector capability boundary.
//!
//! The fusion pipeline never talks to a model directly; it is handed anything
//! implementing [`Detector`], and may call it more than once per image with
//! independent thresholds (the low-confidence rescan pass reuses the same
//! handle). This keeps model loading and device selection out of the core.

use anyhow::Result;
use image::RgbImage;

/// One raw box as emitted by a detector backend, in original-image pixel
/// coordinates. Not yet clipped or normalized.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

impl RawDetection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn intersection_area(&self, other: &RawDetection) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 > x1 && y2 > y1 {
            (x2 - x1) * (y2 - y1)
        } else {
            0.0
        }
    }

    pub fn iou(&self, other: &RawDetection) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Object detection capability consumed by the pipeline.
///
/// `confidence` and `overlap` are the thresholds for this specific invocation;
/// a single request may invoke `detect` twice with different confidences.
/// Implementations must be deterministic for a given (image, thresholds) pair.
pub trait Detector {
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<RawDetection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class_id: 0,
            class_name: "flower".to_string(),
        }
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_identical_boxes() {
        let a = boxed(5.0, 5.0, 15.0, 15.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_intersection_area_partial_overlap() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(5.0, 5.0, 15.0, 15.0);
        assert_eq!(a.intersection_area(&b), 25.0);
    }
}
