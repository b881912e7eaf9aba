//! V4L2 camera source.
//!
//! Negotiates RGB3 at the requested size and falls back to whatever the driver
//! keeps (YUYV on most USB webcams), converting to RGB in memory. Captured
//! buffers are copied out of the mmap ring and never written anywhere.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceConfig};
use crate::frame::Frame;

const MMAP_BUFFERS: u32 = 4;

pub struct V4l2Source {
    config: SourceConfig,
    state: Option<DeviceState>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
    active_format: PixelFormat,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            active_format: PixelFormat::Rgb24,
            config,
            state: None,
            frame_count: 0,
        }
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.url)
            .with_context(|| format!("open v4l2 device {}", self.config.url))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set RGB3 on {}: {}",
                    self.config.url,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{} offers unsupported pixel format {}",
                self.config.url,
                format.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.url,
                    err
                );
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_format = pixel_format;
        self.state = Some(state);

        log::info!(
            "V4l2Source: streaming {} ({}x{} {:?})",
            self.config.url,
            self.active_width,
            self.active_height,
            self.active_format
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.active_width, self.active_height, self.active_format);
        let state = self.state.as_mut().context("v4l2 device not open")?;
        let rgb = state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, _meta) = fields.stream.next().context("capture v4l2 frame")?;
            normalize_to_rgb(buf, width, height, format)
        })?;

        let frame = Frame::from_rgb(self.frame_count, width, height, rgb)
            .ok_or_else(|| anyhow!("v4l2 frame does not match {}x{}", width, height))?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        // Dropping the stream unmaps the buffers and stops streaming.
        self.state = None;
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }
}
