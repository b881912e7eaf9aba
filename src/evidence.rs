//! Incident evidence: clip encoding and persistence.
//!
//! `ClipAssembler` turns the frames of one incident into a looping animated GIF
//! played back at a fixed rate, and hands the encoded bytes to an
//! `EvidenceStore` under a generated, collision-free name. The name is the
//! evidence reference reported with the alert.

use anyhow::{anyhow, Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::Frame;

/// Default local evidence directory, served to the dashboard as `/evidence`.
pub const DEFAULT_EVIDENCE_PATH: &str = "data/processed";

/// Default clip playback rate, independent of the capture rate.
pub const DEFAULT_PLAYBACK_FPS: u32 = 20;

pub const CLIP_EXTENSION: &str = "gif";

// NeuQuant speed: 1 is best quality, 30 is fastest.
const GIF_ENCODE_SPEED: i32 = 30;

/// Destination for encoded clips.
pub trait EvidenceStore: Send {
    /// Persist `bytes` under `name`. Existing entries are never overwritten.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// Evidence store rooted at a local directory.
pub struct FilesystemEvidenceStore {
    root: PathBuf,
}

impl FilesystemEvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create evidence directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl EvidenceStore for FilesystemEvidenceStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_clip_name(name)?;
        let path = self.root.join(name);
        if path.exists() {
            return Err(anyhow!("evidence clip {} already exists", name));
        }
        write_atomic(&path, bytes).with_context(|| format!("write {}", path.display()))
    }
}

/// Encodes incident frames and persists them.
pub struct ClipAssembler<S: EvidenceStore> {
    store: S,
    playback_fps: u32,
    last_stem: Option<String>,
    collisions: u32,
}

impl<S: EvidenceStore> ClipAssembler<S> {
    pub fn new(store: S, playback_fps: u32) -> Self {
        Self {
            store,
            playback_fps: playback_fps.max(1),
            last_stem: None,
            collisions: 0,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Encode and persist one incident, named from the current time.
    ///
    /// Returns `Ok(None)` without touching the store when `frames` is empty.
    /// Encoding and write failures are returned to the caller.
    pub fn assemble(&mut self, label: &str, frames: &[Frame]) -> Result<Option<String>> {
        self.assemble_at(label, frames, SystemTime::now())
    }

    /// Like `assemble`, with the clip named after `started` (the wall-clock
    /// start of the incident).
    pub fn assemble_at(
        &mut self,
        label: &str,
        frames: &[Frame],
        started: SystemTime,
    ) -> Result<Option<String>> {
        if frames.is_empty() {
            return Ok(None);
        }
        let encoded = encode_gif(frames, self.playback_fps)
            .with_context(|| format!("encode {} frame clip for {}", frames.len(), label))?;
        let name = self.next_name(label, started)?;
        self.store.put(&name, &encoded)?;
        log::info!(
            "incident clip saved: {} ({} frames, {} KB)",
            name,
            frames.len(),
            encoded.len() / 1024
        );
        Ok(Some(name))
    }

    fn next_name(&mut self, label: &str, started: SystemTime) -> Result<String> {
        let millis = started.duration_since(UNIX_EPOCH)?.as_millis();
        let stem = format!("{}_{}", sanitize_label(label), millis);
        let name = if self.last_stem.as_deref() == Some(stem.as_str()) {
            self.collisions += 1;
            format!("{}_{}.{}", stem, self.collisions, CLIP_EXTENSION)
        } else {
            self.collisions = 0;
            format!("{}.{}", stem, CLIP_EXTENSION)
        };
        self.last_stem = Some(stem);
        Ok(name)
    }
}

/// Encode frames as a looping GIF at `fps` frames per second.
pub fn encode_gif(frames: &[Frame], fps: u32) -> Result<Vec<u8>> {
    let delay = Delay::from_numer_denom_ms(1000, fps.max(1));
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut out, GIF_ENCODE_SPEED);
        encoder.set_repeat(Repeat::Infinite)?;
        for frame in frames {
            let rgba = DynamicImage::ImageRgb8(frame.to_rgb_image()).into_rgba8();
            encoder.encode_frame(image::Frame::from_parts(rgba, 0, 0, delay))?;
        }
    }
    Ok(out)
}

/// `"Using Phone"` -> `"Using_Phone"`; anything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "incident".to_string()
    } else {
        cleaned
    }
}

fn validate_clip_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(anyhow!("invalid evidence clip name '{}'", name));
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let written = write_then_rename(&tmp_path, path, data);
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}

fn write_then_rename(tmp_path: &Path, path: &Path, data: &[u8]) -> Result<()> {
    {
        let mut file = File::create(tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
