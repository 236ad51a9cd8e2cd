//! Instance segmentation: the `Segmenter` capability boundary, polygon
//! postprocessing, and a YOLOv8-seg ONNX backend (prototype-mask decode plus
//! border following to turn masks into polygons).
//!
//! Polygon vertices are normalized to [0,1] x [0,1]; degenerate polygons
//! (fewer than 3 vertices) are dropped during postprocessing.

use anyhow::Result;
use image::{GrayImage, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use ndarray::Array;
use ort::{session::Session, value::Value};
use serde::Serialize;

use crate::onnx_session::{create_onnx_session, ModelSource};

const MASK_THRESHOLD: f32 = 0.5;
const MASK_COEFFS: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct PolygonPoint {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Polygon {
    pub points: Vec<PolygonPoint>,
}

/// Segmentation capability consumed by the segmentation pipeline.
pub trait Segmenter {
    fn segment(
        &mut self,
        image: &RgbImage,
        confidence: f32,
        overlap: f32,
        target_size: u32,
    ) -> Result<Vec<Polygon>>;
}

#[derive(Debug, Serialize)]
pub struct SegmentationMeta {
    pub format: String,
    pub conf: f32,
    pub iou: f32,
    pub imgsz: u32,
}

#[derive(Debug, Serialize)]
pub struct SegmentationReport {
    pub width: u32,
    pub height: u32,
    pub instances: Vec<Polygon>,
    pub meta: SegmentationMeta,
}

/// Run the segmentation capability and postprocess its polygons: clamp every
/// vertex to the unit square and drop degenerate instances.
pub fn run_segmentation(
    segmenter: &mut dyn Segmenter,
    image: &RgbImage,
    confidence: f32,
    overlap: f32,
    target_size: u32,
) -> Result<SegmentationReport> {
    let (width, height) = image.dimensions();
    let polygons = segmenter.segment(image, confidence, overlap, target_size)?;

    let instances: Vec<Polygon> = polygons
        .into_iter()
        .filter(|p| p.points.len() >= 3)
        .map(|p| Polygon {
            points: p
                .points
                .into_iter()
                .map(|pt| PolygonPoint {
                    x: pt.x.clamp(0.0, 1.0),
                    y: pt.y.clamp(0.0, 1.0),
                })
                .collect(),
        })
        .collect();

    Ok(SegmentationReport {
        width,
        height,
        instances,
        meta: SegmentationMeta {
            format: "normalized".to_string(),
            conf: confidence,
            iou: overlap,
            imgsz: target_size,
        },
    })
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One decoded box with its mask coefficients, in model-input coordinates.
struct SegCandidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
    coeffs: Vec<f32>,
}

impl SegCandidate {
    fn iou(&self, other: &SegCandidate) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let intersection = if x2 > x1 && y2 > y1 {
            (x2 - x1) * (y2 - y1)
        } else {
            0.0
        };
        let area_a = (self.x2 - self.x1) * (self.y2 - self.y1);
        let area_b = (other.x2 - other.x1) * (other.y2 - other.y1);
        let union = area_a + area_b - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

fn nms_candidates(mut candidates: Vec<SegCandidate>, iou_threshold: f32) -> Vec<SegCandidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<SegCandidate> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// YOLOv8-seg instance segmenter backed by an ONNX Runtime session.
pub struct OnnxSegmenter {
    session: Session,
}

impl OnnxSegmenter {
    pub fn from_file(path: &str, device: &str) -> Result<Self> {
        let session = create_onnx_session(&ModelSource::FilePath(path.to_string()), device)?;
        Ok(Self { session })
    }
}

impl Segmenter for OnnxSegmenter {
    fn segment(
        &mut self,
        image: &RgbImage,
        confidence: f32,
        overlap: f32,
        target_size: u32,
    ) -> Result<Vec<Polygon>> {
        let size = target_size as usize;
        let resized = image::imageops::resize(
            image,
            target_size,
            target_size,
            image::imageops::FilterType::Triangle,
        );

        let mut input_data = Vec::with_capacity(3 * size * size);
        for c in 0..3 {
            for y in 0..target_size {
                for x in 0..target_size {
                    input_data.push(resized.get_pixel(x, y).0[c] as f32 / 255.0);
                }
            }
        }
        let input = Array::from_shape_vec(ndarray::IxDyn(&[1, 3, size, size]), input_data)?;

        let input_value = Value::from_array(input)
            .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;
        let outputs = self
            .session
            .run(ort::inputs!["images" => &input_value])
            .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;

        let boxes_view = outputs["output0"]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to extract box output: {}", e))?;
        let boxes =
            Array::from_shape_vec(boxes_view.shape(), boxes_view.iter().cloned().collect())?;
        let protos_view = outputs["output1"]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to extract prototype output: {}", e))?;
        let protos =
            Array::from_shape_vec(protos_view.shape(), protos_view.iter().cloned().collect())?;

        let box_shape = boxes.shape().to_vec();
        let proto_shape = protos.shape().to_vec();
        if box_shape.len() != 3 || proto_shape.len() != 4 {
            return Err(anyhow::anyhow!(
                "Unexpected segmentation output shapes {box_shape:?} / {proto_shape:?}"
            ));
        }
        if box_shape[1] < 4 + 1 + MASK_COEFFS || proto_shape[1] != MASK_COEFFS {
            return Err(anyhow::anyhow!(
                "Output channels do not look like YOLOv8-seg: {box_shape:?} / {proto_shape:?}"
            ));
        }
        let num_classes = box_shape[1] - 4 - MASK_COEFFS;
        let num_boxes = box_shape[2];
        let (mask_h, mask_w) = (proto_shape[2], proto_shape[3]);

        let mut candidates = Vec::new();
        for i in 0..num_boxes {
            let mut best = 0.0;
            for class_idx in 0..num_classes {
                best = f32::max(best, boxes[[0, 4 + class_idx, i]]);
            }
            if best <= confidence {
                continue;
            }
            let xc = boxes[[0, 0, i]];
            let yc = boxes[[0, 1, i]];
            let w = boxes[[0, 2, i]];
            let h = boxes[[0, 3, i]];
            let coeffs = (0..MASK_COEFFS)
                .map(|k| boxes[[0, 4 + num_classes + k, i]])
                .collect();
            candidates.push(SegCandidate {
                x1: xc - w / 2.0,
                y1: yc - h / 2.0,
                x2: xc + w / 2.0,
                y2: yc + h / 2.0,
                confidence: best,
                coeffs,
            });
        }

        let kept = nms_candidates(candidates, overlap);
        log::debug!("segmentation: {} instance(s) after NMS", kept.len());

        // Prototype grid -> model input scaling (usually 1/4).
        let grid_scale_x = mask_w as f32 / target_size as f32;
        let grid_scale_y = mask_h as f32 / target_size as f32;

        let mut polygons = Vec::new();
        for candidate in &kept {
            let gx1 = ((candidate.x1 * grid_scale_x).floor().max(0.0)) as usize;
            let gy1 = ((candidate.y1 * grid_scale_y).floor().max(0.0)) as usize;
            let gx2 = ((candidate.x2 * grid_scale_x).ceil() as usize).min(mask_w);
            let gy2 = ((candidate.y2 * grid_scale_y).ceil() as usize).min(mask_h);

            // Mask is zero outside the instance box.
            let mut mask = GrayImage::new(mask_w as u32, mask_h as u32);
            for gy in gy1..gy2 {
                for gx in gx1..gx2 {
                    let mut score = 0.0;
                    for (k, coeff) in candidate.coeffs.iter().enumerate() {
                        score += coeff * protos[[0, k, gy, gx]];
                    }
                    if sigmoid(score) > MASK_THRESHOLD {
                        mask.put_pixel(gx as u32, gy as u32, image::Luma([255]));
                    }
                }
            }

            // Largest outer contour is the instance boundary.
            let contours = find_contours::<i32>(&mask);
            let Some(outline) = contours
                .iter()
                .filter(|c| c.border_type == BorderType::Outer)
                .max_by_key(|c| c.points.len())
            else {
                continue;
            };

            let points = outline
                .points
                .iter()
                .map(|p| PolygonPoint {
                    x: p.x as f32 / mask_w as f32,
                    y: p.y as f32 / mask_h as f32,
                })
                .collect();
            polygons.push(Polygon { points });
        }

        Ok(polygons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSegmenter {
        polygons: Vec<Polygon>,
    }

    impl Segmenter for ScriptedSegmenter {
        fn segment(
            &mut self,
            _image: &RgbImage,
            _confidence: f32,
            _overlap: f32,
            _target_size: u32,
        ) -> Result<Vec<Polygon>> {
            Ok(self.polygons.clone())
        }
    }

    fn polygon(coords: &[(f32, f32)]) -> Polygon {
        Polygon {
            points: coords
                .iter()
                .map(|&(x, y)| PolygonPoint { x, y })
                .collect(),
        }
    }

    fn test_image() -> RgbImage {
        RgbImage::from_pixel(320, 240, image::Rgb([30, 90, 30]))
    }

    #[test]
    fn test_degenerate_polygons_dropped() {
        let mut segmenter = ScriptedSegmenter {
            polygons: vec![
                polygon(&[(0.1, 0.1), (0.5, 0.1)]),
                polygon(&[(0.1, 0.1), (0.5, 0.1), (0.3, 0.6)]),
                polygon(&[]),
            ],
        };
        let report =
            run_segmentation(&mut segmenter, &test_image(), 0.30, 0.55, 960).unwrap();
        assert_eq!(report.instances.len(), 1);
        assert_eq!(report.instances[0].points.len(), 3);
    }

    #[test]
    fn test_vertices_clamped_to_unit_square() {
        let mut segmenter = ScriptedSegmenter {
            polygons: vec![polygon(&[(-0.2, 0.5), (1.4, 0.5), (0.5, 1.1)])],
        };
        let report =
            run_segmentation(&mut segmenter, &test_image(), 0.30, 0.55, 960).unwrap();
        let pts = &report.instances[0].points;
        assert_eq!((pts[0].x, pts[0].y), (0.0, 0.5));
        assert_eq!((pts[1].x, pts[1].y), (1.0, 0.5));
        assert_eq!((pts[2].x, pts[2].y), (0.5, 1.0));
    }

    #[test]
    fn test_report_meta_echoes_parameters() {
        let mut segmenter = ScriptedSegmenter { polygons: vec![] };
        let report =
            run_segmentation(&mut segmenter, &test_image(), 0.25, 0.6, 640).unwrap();
        assert_eq!(report.width, 320);
        assert_eq!(report.height, 240);
        assert!(report.instances.is_empty());
        assert_eq!(report.meta.format, "normalized");
        assert_eq!(report.meta.conf, 0.25);
        assert_eq!(report.meta.iou, 0.6);
        assert_eq!(report.meta.imgsz, 640);
    }

    #[test]
    fn test_candidate_nms_is_greedy_by_confidence() {
        let a = SegCandidate {
            x1: 0.0,
            y1: 0.0,
            x2: 100.0,
            y2: 100.0,
            confidence: 0.9,
            coeffs: vec![0.0; MASK_COEFFS],
        };
        let b = SegCandidate {
            x1: 5.0,
            y1: 5.0,
            x2: 105.0,
            y2: 105.0,
            confidence: 0.6,
            coeffs: vec![0.0; MASK_COEFFS],
        };
        let kept = nms_candidates(vec![b, a], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }
}
