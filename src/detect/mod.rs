mod aggregator;
mod backend;
mod backends;
mod result;

pub use aggregator::{
    gaze_detection, DetectorAggregator, DEFAULT_GAZE_YAW_THRESHOLD, LOOKING_LEFT, LOOKING_RIGHT,
};
pub use backend::{ObjectDetector, PoseEstimator};
pub use backends::{FixedPoseEstimator, ScriptedDetector};
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use result::{BoundingBox, Detection, DetectionKind, HeadPose};
