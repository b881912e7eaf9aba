//! Camera frame sources.
//!
//! - `SyntheticSource`: generated frames for `stub://` URLs (tests, demo)
//! - `V4l2Source`: USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Every source implements `FrameSource` and hands out `Frame`s with a
//! per-source arrival sequence. `CameraController` layers idempotent
//! acquire/release on top, driven by the camera control flag.
//!
//! Sources MUST NOT write frames to disk or log pixel content. Only incident
//! clips, assembled downstream, are persisted.

mod camera;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use camera::CameraController;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// First USB camera when V4L2 capture is compiled in, otherwise a synthetic
/// camera so a default build still runs.
#[cfg(feature = "ingest-v4l2")]
pub const DEFAULT_SOURCE_URL: &str = "/dev/video0";
#[cfg(not(feature = "ingest-v4l2"))]
pub const DEFAULT_SOURCE_URL: &str = "stub://classroom";
pub const DEFAULT_CAPTURE_WIDTH: u32 = 640;
pub const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
pub const DEFAULT_CAPTURE_FPS: u32 = 30;

/// A camera that can be opened, read one frame at a time and released.
pub trait FrameSource: Send {
    /// Human-readable identity for logs.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<()>;

    /// Blocking read of the next frame. Errors when not open.
    fn read(&mut self) -> Result<Frame>;

    fn release(&mut self);

    fn is_open(&self) -> bool;
}

/// Capture parameters shared by all sources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    /// `stub://<name>` or a device path such as `/dev/video0`.
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            target_fps: DEFAULT_CAPTURE_FPS,
        }
    }
}

/// Build the source named by `config.url`. The source is returned closed.
pub fn source_from_config(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if config.url.starts_with("/dev/video") || config.url.starts_with("v4l2://") {
        return open_v4l2(config);
    }
    Err(anyhow!(
        "unsupported source url '{}': expected stub://<name> or /dev/videoN",
        config.url
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_v4l2(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let mut config = config.clone();
    if let Some(path) = config.url.strip_prefix("v4l2://") {
        config.url = path.to_string();
    }
    Ok(Box::new(V4l2Source::new(config)))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_v4l2(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "source {} requires the ingest-v4l2 feature",
        config.url
    ))
}
