//! Preview overlays.
//!
//! Drawn only on the preview copy of a frame. Frames held by the sliding window
//! or an open incident are never touched, so clips stay clean.

use image::{Rgb, RgbImage};

use crate::classify::ViolationClassifier;
use crate::detect::{BoundingBox, Detection};

pub const VIOLATION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const NORMAL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

const OUTLINE_THICKNESS: u32 = 2;
const REC_CENTER: (i64, i64) = (30, 30);
const REC_RADIUS: i64 = 10;

/// Outline every boxed detection: red for violation labels, green otherwise.
pub fn draw_detections(
    image: &mut RgbImage,
    detections: &[Detection],
    classifier: &ViolationClassifier,
) {
    for detection in detections {
        let Some(bbox) = detection.bbox else {
            continue;
        };
        let color = if classifier.is_violation(&detection.label) {
            VIOLATION_COLOR
        } else {
            NORMAL_COLOR
        };
        draw_outline(image, &bbox, color);
    }
}

/// Filled red dot in the top-left corner.
pub fn draw_recording_marker(image: &mut RgbImage) {
    let (cx, cy) = REC_CENTER;
    for y in (cy - REC_RADIUS)..=(cy + REC_RADIUS) {
        for x in (cx - REC_RADIUS)..=(cx + REC_RADIUS) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= REC_RADIUS * REC_RADIUS {
                put(image, x, y, VIOLATION_COLOR);
            }
        }
    }
}

fn draw_outline(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    if w == 0 || h == 0 {
        return;
    }
    let x1 = (bbox.x1.round() as i64).clamp(0, w - 1);
    let y1 = (bbox.y1.round() as i64).clamp(0, h - 1);
    let x2 = (bbox.x2.round() as i64).clamp(0, w - 1);
    let y2 = (bbox.y2.round() as i64).clamp(0, h - 1);
    if x2 < x1 || y2 < y1 {
        return;
    }
    for t in 0..OUTLINE_THICKNESS as i64 {
        for x in x1..=x2 {
            put(image, x, y1 + t, color);
            put(image, x, y2 - t, color);
        }
        for y in y1..=y2 {
            put(image, x1 + t, y, color);
            put(image, x2 - t, y, color);
        }
    }
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    image.put_pixel(x as u32, y as u32, color);
}
