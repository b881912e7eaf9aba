pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{FixedPoseEstimator, ScriptedDetector};

#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;
