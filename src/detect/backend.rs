use anyhow::Result;

use crate::detect::result::{Detection, HeadPose};
use crate::frame::Frame;

/// Object detector backend.
///
/// Implementations receive a read-only frame and return the findings for that
/// frame. "Nothing found" is an empty vector, never an error. Errors are reserved
/// for inference failures; the aggregator logs them and treats the frame as empty.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Head pose estimator backend.
///
/// Returns the pose of the most recently located face, or `None` when no face is
/// in view.
pub trait PoseEstimator: Send {
    fn name(&self) -> &'static str;

    fn estimate(&mut self, frame: &Frame) -> Result<Option<HeadPose>>;
}
