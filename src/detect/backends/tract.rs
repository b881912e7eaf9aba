#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::ObjectDetector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based object detector for YOLO-style ONNX exports.
///
/// Expects a single input of shape `[1, 3, H, W]` (RGB, 0..1) and a single output
/// of shape `[1, 4 + classes, anchors]` where the first four rows are
/// `cx, cy, w, h` in input pixels and the remaining rows are per-class scores.
/// Frames are stretched to the input size; boxes are scaled back to frame pixels.
pub struct TractDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    confidence_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if class_names.is_empty() {
            return Err(anyhow!("object detector needs at least one class name"));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            class_names,
            confidence_threshold: 0.5,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [1, 4 + classes, anchors]")?;

        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows < 5 {
            return Err(anyhow!("model output has {} rows, expected at least 5", rows));
        }
        let classes = (rows - 4).min(self.class_names.len());
        let sx = frame.width() as f32 / self.width as f32;
        let sy = frame.height() as f32 / self.height as f32;

        let mut candidates: Vec<(usize, f32, BoundingBox)> = Vec::new();
        for i in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..classes {
                let score = view[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if !best_score.is_finite() || best_score < self.confidence_threshold {
                continue;
            }
            let cx = view[[0, 0, i]];
            let cy = view[[0, 1, i]];
            let w = view[[0, 2, i]];
            let h = view[[0, 3, i]];
            let bbox = BoundingBox {
                x1: ((cx - w / 2.0) * sx).max(0.0),
                y1: ((cy - h / 2.0) * sy).max(0.0),
                x2: ((cx + w / 2.0) * sx).min(frame.width() as f32),
                y2: ((cy + h / 2.0) * sy).min(frame.height() as f32),
            };
            candidates.push((best_class, best_score, bbox));
        }

        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD)
            .into_iter()
            .map(|(class, score, bbox)| {
                Detection::object(self.class_names[class].clone(), score, Some(bbox))
            })
            .collect())
    }
}

/// Greedy per-class NMS. Output is sorted by descending score.
fn non_max_suppression(
    mut candidates: Vec<(usize, f32, BoundingBox)>,
    iou_threshold: f32,
) -> Vec<(usize, f32, BoundingBox)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<(usize, f32, BoundingBox)> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.0 == cand.0 && k.2.iou(&cand.2) > iou_threshold);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

impl ObjectDetector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    #[test]
    fn nms_keeps_best_overlapping_box_per_class() {
        let kept = non_max_suppression(
            vec![
                (0, 0.6, bbox(0.0, 0.0, 10.0, 10.0)),
                (0, 0.9, bbox(1.0, 1.0, 11.0, 11.0)),
                (1, 0.7, bbox(0.0, 0.0, 10.0, 10.0)),
                (0, 0.8, bbox(50.0, 50.0, 60.0, 60.0)),
            ],
            0.45,
        );
        let scores: Vec<f32> = kept.iter().map(|k| k.1).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.7]);
    }
}
