//! Invigilator: real-time exam invigilation from a single camera.
//!
//! Each captured frame flows through one loop:
//!
//! 1. **Ingest**: a `FrameSource` behind `CameraController`, opened and
//!    released on request of the remote controller.
//! 2. **Detect**: object detections plus a gaze heuristic from head pose,
//!    merged by `DetectorAggregator`. Only runs while monitoring is on.
//! 3. **Classify**: `ViolationClassifier` picks the active violation, if any.
//! 4. **Track**: `IncidentStateMachine` opens an incident on the first
//!    violation (seeded with the sliding window as lead-up context) and closes
//!    it after a clean cooldown or a duration cap.
//! 5. **Report**: `ClipAssembler` saves the incident as a looping clip and
//!    `AlertDispatcher` posts an alert in the background.
//!
//! # Module Structure
//!
//! - `frame`: shared immutable frames and the sliding window
//! - `ingest`: camera sources and the camera controller
//! - `detect`: detector traits, backends and the aggregator
//! - `classify`, `incident`: violation policy and incident tracking
//! - `evidence`, `alert`: clip persistence and alert delivery
//! - `control`: control flags, MQTT control channel and preview encoding
//! - `overlay`: preview annotations
//! - `pipeline`: the per-frame loop
//! - `config`: daemon configuration

pub mod alert;
pub mod classify;
pub mod config;
pub mod control;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod incident;
pub mod ingest;
pub mod overlay;
pub mod pipeline;

pub use alert::{AlertDispatcher, AlertPayload, AlertTransport, HttpAlertTransport, LoggingTransport};
pub use classify::{Violation, ViolationClassifier, DEFAULT_VIOLATION_LABELS};
pub use config::InvigilatorConfig;
pub use control::{ControlFlags, MqttControlChannel, PreviewEncoder, PreviewSink};
pub use detect::{
    BoundingBox, Detection, DetectionKind, DetectorAggregator, HeadPose, ObjectDetector,
    PoseEstimator,
};
pub use evidence::{ClipAssembler, EvidenceStore, FilesystemEvidenceStore};
pub use frame::{Frame, SlidingWindow};
pub use incident::{EndReason, Incident, IncidentPolicy, IncidentStateMachine};
pub use ingest::{CameraController, FrameSource, SourceConfig, SyntheticSource};
pub use pipeline::{FramePipeline, IncidentReport, LoopTimings, PipelineOptions, PipelineStats};
