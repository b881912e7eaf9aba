/// Where a detection came from.
///
/// Adding a new source of findings means adding a variant here; every `match`
/// over the kind then has to account for it.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionKind {
    /// Scored output of an object detection model.
    Object,
    /// Rule-derived finding from head pose angles. Confidence is fixed.
    PoseHeuristic,
}

/// Pixel rectangle in frame coordinates (top-left / bottom-right corners).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One finding on one frame. Created fresh per frame, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub kind: DetectionKind,
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn object(label: impl Into<String>, confidence: f32, bbox: Option<BoundingBox>) -> Self {
        Self {
            kind: DetectionKind::Object,
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    pub fn pose(label: impl Into<String>) -> Self {
        Self {
            kind: DetectionKind::PoseHeuristic,
            label: label.into(),
            confidence: 1.0,
            bbox: None,
        }
    }
}

/// Head orientation of the most recently located face, in degrees.
///
/// Negative yaw is the subject turning to their left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
}
