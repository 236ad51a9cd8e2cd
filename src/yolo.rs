//! ONNX-backed YOLO detector: letterbox preprocessing, `[1, 4+nc, N]` output
//! decoding with letterbox-aware unscaling, and class-wise non-maximum
//! suppression.

use anyhow::Result;
use image::RgbImage;
use ndarray::Array;
use ort::{session::Session, value::Value};

use crate::detector::{Detector, RawDetection};
use crate::onnx_session::{create_onnx_session, ModelSource};

/// Gray letterbox padding value, matching common YOLO training pipelines.
const PAD_VALUE: u8 = 114;

/// Letterbox geometry needed to map model coordinates back to the original
/// image.
#[derive(Debug, Clone, Copy)]
pub struct Letterbox {
    pub scale: f32,
    pub x_offset: f32,
    pub y_offset: f32,
}

/// Resize with preserved aspect ratio into a square tensor, padding the
/// shorter side. Returns the NCHW input tensor and the geometry used.
pub fn preprocess_image(
    img: &RgbImage,
    target_size: u32,
) -> Result<(Array<f32, ndarray::IxDyn>, Letterbox)> {
    let (orig_width, orig_height) = img.dimensions();
    let max_dim = orig_width.max(orig_height);
    let scale = target_size as f32 / max_dim as f32;
    let new_width = ((orig_width as f32 * scale) as u32).max(1);
    let new_height = ((orig_height as f32 * scale) as u32).max(1);

    let resized = image::imageops::resize(
        img,
        new_width,
        new_height,
        image::imageops::FilterType::Lanczos3,
    );

    let x_offset = (target_size - new_width) / 2;
    let y_offset = (target_size - new_height) / 2;

    let mut letterboxed =
        RgbImage::from_pixel(target_size, target_size, image::Rgb([PAD_VALUE; 3]));
    image::imageops::replace(&mut letterboxed, &resized, x_offset as i64, y_offset as i64);

    let mut input_data = Vec::with_capacity((3 * target_size * target_size) as usize);
    for c in 0..3 {
        for y in 0..target_size {
            for x in 0..target_size {
                input_data.push(letterboxed.get_pixel(x, y).0[c] as f32 / 255.0);
            }
        }
    }

    let input = Array::from_shape_vec(
        ndarray::IxDyn(&[1, 3, target_size as usize, target_size as usize]),
        input_data,
    )?;

    Ok((
        input,
        Letterbox {
            scale,
            x_offset: x_offset as f32,
            y_offset: y_offset as f32,
        },
    ))
}

/// Class-wise non-maximum suppression at the given IoU threshold.
pub fn nms(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.is_empty() {
        return detections;
    }

    use std::collections::HashMap;
    let mut class_groups: HashMap<u32, Vec<RawDetection>> = HashMap::new();
    for detection in detections {
        class_groups
            .entry(detection.class_id)
            .or_default()
            .push(detection);
    }

    let mut all_results = Vec::new();
    for (_, mut class_detections) in class_groups {
        class_detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut suppressed = vec![false; class_detections.len()];
        for i in 0..class_detections.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..class_detections.len() {
                if !suppressed[j] && class_detections[i].iou(&class_detections[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
            all_results.push(class_detections[i].clone());
        }
    }

    all_results
}

/// Decode a `[1, 4+nc, N]` YOLO output into detections in original-image
/// coordinates, apply NMS, and sort by descending confidence.
pub fn postprocess_output(
    output: &Array<f32, ndarray::IxDyn>,
    confidence_threshold: f32,
    iou_threshold: f32,
    letterbox: &Letterbox,
    labels: &[String],
) -> Result<Vec<RawDetection>> {
    let shape = output.shape();
    if shape.len() != 3 {
        return Err(anyhow::anyhow!("Expected 3D output, got {}D", shape.len()));
    }
    if shape[1] < 5 {
        return Err(anyhow::anyhow!(
            "Expected at least 5 output channels, got {}",
            shape[1]
        ));
    }
    let num_classes = shape[1] - 4;
    let num_boxes = shape[2];

    let mut detections = Vec::new();
    for i in 0..num_boxes {
        let x_center = output[[0, 0, i]];
        let y_center = output[[0, 1, i]];
        let width = output[[0, 2, i]];
        let height = output[[0, 3, i]];

        let mut max_confidence = 0.0;
        let mut best_class_id = 0;
        for class_idx in 0..num_classes {
            let class_confidence = output[[0, 4 + class_idx, i]];
            if class_confidence > max_confidence {
                max_confidence = class_confidence;
                best_class_id = class_idx as u32;
            }
        }

        if max_confidence > confidence_threshold {
            // Model coords -> original image coords, undoing the letterbox.
            let x1 = (x_center - width / 2.0 - letterbox.x_offset) / letterbox.scale;
            let y1 = (y_center - height / 2.0 - letterbox.y_offset) / letterbox.scale;
            let x2 = (x_center + width / 2.0 - letterbox.x_offset) / letterbox.scale;
            let y2 = (y_center + height / 2.0 - letterbox.y_offset) / letterbox.scale;

            let class_name = labels
                .get(best_class_id as usize)
                .cloned()
                .unwrap_or_else(|| format!("class_{best_class_id}"));

            detections.push(RawDetection {
                x1,
                y1,
                x2,
                y2,
                confidence: max_confidence,
                class_id: best_class_id,
                class_name,
            });
        }
    }

    let mut detections = nms(detections, iou_threshold);
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(detections)
}

/// YOLO object detector backed by an ONNX Runtime session.
pub struct OnnxDetector {
    session: Session,
    labels: Vec<String>,
    model_size: u32,
}

impl OnnxDetector {
    pub fn from_file(path: &str, device: &str, labels: Vec<String>) -> Result<Self> {
        let session = create_onnx_session(&ModelSource::FilePath(path.to_string()), device)?;

        // Query the input size from the model, defaulting to 640.
        let model_size = match &session.inputs[0].input_type {
            ort::value::ValueType::Tensor { shape, .. } if shape.len() == 4 && shape[3] > 0 => {
                shape[3] as u32
            }
            other => {
                log::debug!("Unexpected input type {other:?}, defaulting to 640x640");
                640
            }
        };

        Ok(Self {
            session,
            labels,
            model_size,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(
        &mut self,
        image: &RgbImage,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<RawDetection>> {
        let (input_tensor, letterbox) = preprocess_image(image, self.model_size)?;

        let input_value = Value::from_array(input_tensor)
            .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;
        let outputs = self
            .session
            .run(ort::inputs!["images" => &input_value])
            .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;

        let output_view = outputs["output0"]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to extract output array: {}", e))?;
        let output_array =
            Array::from_shape_vec(output_view.shape(), output_view.iter().cloned().collect())?;

        postprocess_output(&output_array, confidence, overlap, &letterbox, &self.labels)
    }
}
