//! Synthetic frame source for `stub://` URLs.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use rand::Rng;
use std::time::Instant;

use super::{FrameSource, SourceConfig};
use crate::frame::Frame;

/// Generates a slowly drifting gradient with a moving bar and a little noise.
///
/// `with_open_failures(n)` makes the first `n` calls to `open` fail, for
/// exercising the reopen path.
pub struct SyntheticSource {
    config: SourceConfig,
    open: bool,
    frame_count: u64,
    open_failures_left: u32,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            open_failures_left: 0,
        }
    }

    pub fn with_open_failures(mut self, failures: u32) -> Self {
        self.open_failures_left = failures;
        self
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn render(&self) -> RgbImage {
        let width = self.config.width.max(1);
        let height = self.config.height.max(1);
        let drift = (self.frame_count % 256) as u32;
        let bar_x = (self.frame_count as u32).wrapping_mul(4) % width;
        let mut rng = rand::thread_rng();

        RgbImage::from_fn(width, height, |x, y| {
            if x.abs_diff(bar_x) < 8 {
                return Rgb([230, 230, 230]);
            }
            let noise: u8 = rng.gen_range(0..8);
            let r = ((x * 255 / width + drift) % 256) as u8;
            let g = ((y * 255 / height) % 256) as u8;
            Rgb([r.saturating_add(noise), g.saturating_add(noise), 96])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }

    fn open(&mut self) -> Result<()> {
        if self.open_failures_left > 0 {
            self.open_failures_left -= 1;
            return Err(anyhow!("{} unavailable", self.config.url));
        }
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!("{} is not open", self.config.url));
        }
        let image = self.render();
        let frame = Frame::new(self.frame_count, Instant::now(), image);
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
