use anyhow::Result;

use crate::detect::backend::{ObjectDetector, PoseEstimator};
use crate::detect::result::{BoundingBox, Detection, HeadPose};
use crate::frame::Frame;

/// Scripted object detector for demos and tests.
///
/// Each `infer` call consumes the next entry of the trace: `Some(label)` yields one
/// object detection with that label, `None` yields nothing. Past the end of the
/// trace it yields nothing, or restarts when built with `looping()`.
pub struct ScriptedDetector {
    trace: Vec<Option<String>>,
    cursor: usize,
    confidence: f32,
    looping: bool,
}

impl ScriptedDetector {
    pub fn new(trace: Vec<Option<String>>) -> Self {
        Self {
            trace,
            cursor: 0,
            confidence: 0.9,
            looping: false,
        }
    }

    /// Parse a compact trace such as `"-,-,Using Phone,Using Phone,-"`.
    ///
    /// `-` and empty entries mean "no detection".
    pub fn from_csv(trace: &str) -> Self {
        let entries = trace
            .split(',')
            .map(|entry| entry.trim())
            .map(|entry| {
                if entry.is_empty() || entry == "-" {
                    None
                } else {
                    Some(entry.to_string())
                }
            })
            .collect();
        Self::new(entries)
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }
}

impl ObjectDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if self.cursor >= self.trace.len() {
            if !self.looping || self.trace.is_empty() {
                return Ok(Vec::new());
            }
            self.cursor = 0;
        }
        let entry = self.trace[self.cursor].clone();
        self.cursor += 1;

        Ok(entry
            .map(|label| {
                // Centered box covering the middle quarter of the frame.
                let w = frame.width() as f32;
                let h = frame.height() as f32;
                let bbox = BoundingBox {
                    x1: w * 0.25,
                    y1: h * 0.25,
                    x2: w * 0.75,
                    y2: h * 0.75,
                };
                vec![Detection::object(label, self.confidence, Some(bbox))]
            })
            .unwrap_or_default())
    }
}

/// Scripted pose estimator for demos and tests.
///
/// Replays the given poses in order; past the end it reports no face.
pub struct FixedPoseEstimator {
    poses: Vec<Option<HeadPose>>,
    cursor: usize,
}

impl FixedPoseEstimator {
    pub fn new(poses: Vec<Option<HeadPose>>) -> Self {
        Self { poses, cursor: 0 }
    }
}

impl PoseEstimator for FixedPoseEstimator {
    fn name(&self) -> &'static str {
        "fixed-pose"
    }

    fn estimate(&mut self, _frame: &Frame) -> Result<Option<HeadPose>> {
        let pose = self.poses.get(self.cursor).copied().flatten();
        self.cursor += 1;
        Ok(pose)
    }
}
