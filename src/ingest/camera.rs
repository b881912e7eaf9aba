use anyhow::{Context, Result};

use super::FrameSource;
use crate::frame::Frame;

/// Owns the frame source and makes acquire/release idempotent.
pub struct CameraController {
    source: Box<dyn FrameSource>,
}

impl CameraController {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self { source }
    }

    /// Open the source unless it is already open.
    ///
    /// Returns `true` when this call opened it.
    pub fn acquire(&mut self) -> Result<bool> {
        if self.source.is_open() {
            return Ok(false);
        }
        self.source
            .open()
            .with_context(|| format!("open camera {}", self.source.describe()))?;
        log::info!("camera opened: {}", self.source.describe());
        Ok(true)
    }

    /// Release the source if it is open.
    ///
    /// Returns `true` when this call released it.
    pub fn release(&mut self) -> bool {
        if !self.source.is_open() {
            return false;
        }
        self.source.release();
        log::info!("camera released: {}", self.source.describe());
        true
    }

    pub fn read(&mut self) -> Result<Frame> {
        self.source.read()
    }

    pub fn is_open(&self) -> bool {
        self.source.is_open()
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        self.release();
    }
}
