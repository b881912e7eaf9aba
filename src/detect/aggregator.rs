use anyhow::Result;

use crate::detect::backend::{ObjectDetector, PoseEstimator};
use crate::detect::result::{Detection, HeadPose};
use crate::frame::Frame;

/// Default gaze yaw threshold in degrees.
pub const DEFAULT_GAZE_YAW_THRESHOLD: f32 = 20.0;

pub const LOOKING_LEFT: &str = "Looking Left";
pub const LOOKING_RIGHT: &str = "Looking Right";

/// Runs every configured detector on a frame and merges the findings.
///
/// Each channel is optional. A channel that is not installed contributes nothing;
/// a channel whose backend errors on a frame contributes nothing for that frame.
/// Whether detection runs at all (monitoring on/off) is the caller's decision.
pub struct DetectorAggregator {
    object: Option<Box<dyn ObjectDetector>>,
    pose: Option<Box<dyn PoseEstimator>>,
    gaze_yaw_threshold: f32,
}

impl DetectorAggregator {
    pub fn new(gaze_yaw_threshold: f32) -> Self {
        Self {
            object: None,
            pose: None,
            gaze_yaw_threshold,
        }
    }

    /// Install an object detector. Replaces any previous one.
    pub fn with_object_detector<D: ObjectDetector + 'static>(mut self, detector: D) -> Self {
        self.object = Some(Box::new(detector));
        self
    }

    /// Install a pose estimator. Replaces any previous one.
    pub fn with_pose_estimator<P: PoseEstimator + 'static>(mut self, estimator: P) -> Self {
        self.pose = Some(Box::new(estimator));
        self
    }

    /// Install the object detector produced by a fallible constructor.
    ///
    /// A construction failure disables the channel for the lifetime of the
    /// aggregator. It is logged here, once, and never retried.
    pub fn install_object_detector(&mut self, built: Result<Box<dyn ObjectDetector>>) {
        match built {
            Ok(mut detector) => {
                if let Err(e) = detector.warm_up() {
                    log::warn!("object detector '{}' warm-up failed: {:#}", detector.name(), e);
                }
                log::info!("object detector '{}' enabled", detector.name());
                self.object = Some(detector);
            }
            Err(e) => {
                log::warn!("object detection disabled: {:#}", e);
                self.object = None;
            }
        }
    }

    /// Install the pose estimator produced by a fallible constructor.
    pub fn install_pose_estimator(&mut self, built: Result<Box<dyn PoseEstimator>>) {
        match built {
            Ok(estimator) => {
                log::info!("pose estimator '{}' enabled", estimator.name());
                self.pose = Some(estimator);
            }
            Err(e) => {
                log::warn!("gaze tracking disabled: {:#}", e);
                self.pose = None;
            }
        }
    }

    /// Names of the installed channels.
    pub fn list(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if let Some(object) = &self.object {
            names.push(object.name());
        }
        if let Some(pose) = &self.pose {
            names.push(pose.name());
        }
        names
    }

    pub fn has_object_detector(&self) -> bool {
        self.object.is_some()
    }

    pub fn has_pose_estimator(&self) -> bool {
        self.pose.is_some()
    }

    /// Run all installed detectors on one frame.
    ///
    /// Object findings come first, in backend order, followed by at most one gaze
    /// finding.
    pub fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        let mut detections = Vec::new();

        if let Some(object) = self.object.as_mut() {
            match object.infer(frame) {
                Ok(found) => detections.extend(found),
                Err(e) => log::warn!(
                    "object detector '{}' failed on frame {}: {:#}",
                    object.name(),
                    frame.seq,
                    e
                ),
            }
        }

        if let Some(pose) = self.pose.as_mut() {
            match pose.estimate(frame) {
                Ok(Some(head)) => {
                    if let Some(gaze) = gaze_detection(head, self.gaze_yaw_threshold) {
                        detections.push(gaze);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!(
                    "pose estimator '{}' failed on frame {}: {:#}",
                    pose.name(),
                    frame.seq,
                    e
                ),
            }
        }

        detections
    }
}

impl Default for DetectorAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_GAZE_YAW_THRESHOLD)
    }
}

/// Turn a head pose into a gaze finding when the yaw is past the threshold.
pub fn gaze_detection(head: HeadPose, yaw_threshold: f32) -> Option<Detection> {
    if !head.yaw.is_finite() || head.yaw.abs() <= yaw_threshold {
        return None;
    }
    let label = if head.yaw < 0.0 {
        LOOKING_LEFT
    } else {
        LOOKING_RIGHT
    };
    Some(Detection::pose(label))
}
