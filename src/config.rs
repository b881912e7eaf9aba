//! Daemon configuration.
//!
//! Resolution order: built-in defaults, then the optional JSON file, then
//! `INVIGIL_*` environment overrides, then validation. Only configuration
//! errors abort startup.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::{
    DEFAULT_ALERT_QUEUE_DEPTH, DEFAULT_ALERT_TIMEOUT_MS, DEFAULT_ALERT_URL, DEFAULT_SUBJECT_ID,
};
use crate::classify::DEFAULT_VIOLATION_LABELS;
use crate::control::{
    MqttSettings, PreviewEncoder, DEFAULT_CLIENT_ID, DEFAULT_MQTT_ADDR, DEFAULT_PREVIEW_HEIGHT,
    DEFAULT_PREVIEW_MAX_FPS, DEFAULT_PREVIEW_QUALITY, DEFAULT_PREVIEW_WIDTH, DEFAULT_TOPIC_PREFIX,
};
use crate::detect::DEFAULT_GAZE_YAW_THRESHOLD;
use crate::evidence::{DEFAULT_EVIDENCE_PATH, DEFAULT_PLAYBACK_FPS};
use crate::frame::DEFAULT_WINDOW_FRAMES;
use crate::incident::{IncidentPolicy, DEFAULT_COOLDOWN_FRAMES, DEFAULT_MAX_INCIDENT_SECS};
use crate::ingest::{
    SourceConfig, DEFAULT_CAPTURE_FPS, DEFAULT_CAPTURE_HEIGHT, DEFAULT_CAPTURE_WIDTH,
    DEFAULT_SOURCE_URL,
};
use crate::pipeline::{LoopTimings, PipelineOptions};

/// Classes of the bundled exam-hall detection model, in output order.
pub const DEFAULT_MODEL_CLASSES: &[&str] = &[
    "Giving object",
    "Giving signal",
    "Looking Friend",
    "Moving",
    "Normal",
    "Using Phone",
];
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_REOPEN_DELAY_MS: u64 = 1_000;
const DEFAULT_READ_RETRY_MS: u64 = 100;
const DEFAULT_IDLE_PAUSE_MS: u64 = 500;
const DEFAULT_FRAME_PAUSE_MS: u64 = 10;

// ----------------------------------------------------------------------------
// File representation (every field optional)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InvigilatorConfigFile {
    capture: Option<CaptureConfigFile>,
    detection: Option<DetectionConfigFile>,
    incident: Option<IncidentConfigFile>,
    evidence: Option<EvidenceConfigFile>,
    alert: Option<AlertConfigFile>,
    control: Option<ControlConfigFile>,
    preview: Option<PreviewConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    source_url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    reopen_delay_ms: Option<u64>,
    read_retry_ms: Option<u64>,
    idle_pause_ms: Option<u64>,
    frame_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    class_names: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    gaze_yaw_threshold: Option<f32>,
    violation_labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct IncidentConfigFile {
    window_frames: Option<usize>,
    cooldown_frames: Option<u32>,
    max_duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EvidenceConfigFile {
    dir: Option<PathBuf>,
    playback_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AlertConfigFile {
    url: Option<String>,
    subject_id: Option<String>,
    timeout_ms: Option<u64>,
    queue_depth: Option<usize>,
    send_without_evidence: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ControlConfigFile {
    enabled: Option<bool>,
    mqtt_addr: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
    initial_monitoring: Option<bool>,
    initial_camera: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PreviewConfigFile {
    enabled: Option<bool>,
    width: Option<u32>,
    height: Option<u32>,
    quality: Option<u8>,
    max_fps: Option<u32>,
    draw_overlays: Option<bool>,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InvigilatorConfig {
    pub capture: CaptureSettings,
    pub detection: DetectionSettings,
    pub incident: IncidentSettings,
    pub evidence: EvidenceSettings,
    pub alert: AlertSettings,
    pub control: ControlSettings,
    pub preview: PreviewSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub source_url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub reopen_delay: Duration,
    pub read_retry: Duration,
    pub idle_pause: Duration,
    pub frame_pause: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// No model means the object channel stays disabled.
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub class_names: Vec<String>,
    pub confidence_threshold: f32,
    pub gaze_yaw_threshold: f32,
    pub violation_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IncidentSettings {
    pub window_frames: usize,
    pub cooldown_frames: u32,
    pub max_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub dir: PathBuf,
    pub playback_fps: u32,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    /// Empty means alerts are only logged.
    pub url: String,
    pub subject_id: String,
    pub timeout: Duration,
    pub queue_depth: usize,
    pub send_without_evidence: bool,
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub enabled: bool,
    pub mqtt_addr: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub initial_monitoring: bool,
    pub initial_camera: bool,
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub max_fps: u32,
    pub draw_overlays: bool,
}

impl InvigilatorConfig {
    /// Load from `INVIGIL_CONFIG` (if set) plus environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("INVIGIL_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (if any) plus environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => InvigilatorConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: InvigilatorConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let incident = file.incident.unwrap_or_default();
        let evidence = file.evidence.unwrap_or_default();
        let alert = file.alert.unwrap_or_default();
        let control = file.control.unwrap_or_default();
        let preview = file.preview.unwrap_or_default();

        Self {
            capture: CaptureSettings {
                source_url: capture
                    .source_url
                    .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                reopen_delay: Duration::from_millis(
                    capture.reopen_delay_ms.unwrap_or(DEFAULT_REOPEN_DELAY_MS),
                ),
                read_retry: Duration::from_millis(
                    capture.read_retry_ms.unwrap_or(DEFAULT_READ_RETRY_MS),
                ),
                idle_pause: Duration::from_millis(
                    capture.idle_pause_ms.unwrap_or(DEFAULT_IDLE_PAUSE_MS),
                ),
                frame_pause: Duration::from_millis(
                    capture.frame_pause_ms.unwrap_or(DEFAULT_FRAME_PAUSE_MS),
                ),
            },
            detection: DetectionSettings {
                model_path: detection.model_path,
                input_width: detection.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: detection.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                class_names: detection
                    .class_names
                    .unwrap_or_else(|| to_strings(DEFAULT_MODEL_CLASSES)),
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                gaze_yaw_threshold: detection
                    .gaze_yaw_threshold
                    .unwrap_or(DEFAULT_GAZE_YAW_THRESHOLD),
                violation_labels: detection
                    .violation_labels
                    .unwrap_or_else(|| to_strings(DEFAULT_VIOLATION_LABELS)),
            },
            incident: IncidentSettings {
                window_frames: incident.window_frames.unwrap_or(DEFAULT_WINDOW_FRAMES),
                cooldown_frames: incident.cooldown_frames.unwrap_or(DEFAULT_COOLDOWN_FRAMES),
                max_duration: Duration::from_secs(
                    incident
                        .max_duration_secs
                        .unwrap_or(DEFAULT_MAX_INCIDENT_SECS),
                ),
            },
            evidence: EvidenceSettings {
                dir: evidence
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_EVIDENCE_PATH)),
                playback_fps: evidence.playback_fps.unwrap_or(DEFAULT_PLAYBACK_FPS),
            },
            alert: AlertSettings {
                url: alert.url.unwrap_or_else(|| DEFAULT_ALERT_URL.to_string()),
                subject_id: alert
                    .subject_id
                    .unwrap_or_else(|| DEFAULT_SUBJECT_ID.to_string()),
                timeout: Duration::from_millis(alert.timeout_ms.unwrap_or(DEFAULT_ALERT_TIMEOUT_MS)),
                queue_depth: alert.queue_depth.unwrap_or(DEFAULT_ALERT_QUEUE_DEPTH),
                send_without_evidence: alert.send_without_evidence.unwrap_or(true),
            },
            control: ControlSettings {
                enabled: control.enabled.unwrap_or(true),
                mqtt_addr: control
                    .mqtt_addr
                    .unwrap_or_else(|| DEFAULT_MQTT_ADDR.to_string()),
                client_id: control
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                topic_prefix: control
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
                username: control.username,
                password: control.password,
                initial_monitoring: control.initial_monitoring.unwrap_or(false),
                initial_camera: control.initial_camera.unwrap_or(false),
            },
            preview: PreviewSettings {
                enabled: preview.enabled.unwrap_or(true),
                width: preview.width.unwrap_or(DEFAULT_PREVIEW_WIDTH),
                height: preview.height.unwrap_or(DEFAULT_PREVIEW_HEIGHT),
                quality: preview.quality.unwrap_or(DEFAULT_PREVIEW_QUALITY),
                max_fps: preview.max_fps.unwrap_or(DEFAULT_PREVIEW_MAX_FPS),
                draw_overlays: preview.draw_overlays.unwrap_or(true),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("INVIGIL_SOURCE_URL") {
            self.capture.source_url = url;
        }
        if let Some(path) = non_empty_env("INVIGIL_MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = non_empty_env("INVIGIL_EVIDENCE_DIR") {
            self.evidence.dir = PathBuf::from(dir);
        }
        // Set but empty disables HTTP delivery.
        if let Ok(url) = std::env::var("INVIGIL_ALERT_URL") {
            self.alert.url = url.trim().to_string();
        }
        if let Some(subject) = non_empty_env("INVIGIL_SUBJECT_ID") {
            self.alert.subject_id = subject;
        }
        if let Some(addr) = non_empty_env("INVIGIL_MQTT_ADDR") {
            self.control.mqtt_addr = addr;
        }
        if let Some(value) = non_empty_env("INVIGIL_MONITORING") {
            self.control.initial_monitoring = parse_bool("INVIGIL_MONITORING", &value)?;
        }
        if let Some(value) = non_empty_env("INVIGIL_CAMERA") {
            self.control.initial_camera = parse_bool("INVIGIL_CAMERA", &value)?;
        }
        if let Ok(labels) = std::env::var("INVIGIL_VIOLATION_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.detection.violation_labels = parsed;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture.source_url.trim().is_empty() {
            return Err(anyhow!("capture.source_url must not be empty"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.detection.model_path.is_some()
            && (self.detection.input_width == 0 || self.detection.input_height == 0)
        {
            return Err(anyhow!("detection input size must be greater than zero"));
        }
        if self.detection.class_names.is_empty() {
            return Err(anyhow!("detection.class_names must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(anyhow!("detection.confidence_threshold must be within [0, 1]"));
        }
        if !(self.detection.gaze_yaw_threshold > 0.0 && self.detection.gaze_yaw_threshold < 90.0) {
            return Err(anyhow!(
                "detection.gaze_yaw_threshold must be between 0 and 90 degrees"
            ));
        }
        if self.detection.violation_labels.is_empty() {
            return Err(anyhow!("detection.violation_labels must not be empty"));
        }
        if self.incident.window_frames == 0 {
            return Err(anyhow!("incident.window_frames must be greater than zero"));
        }
        if self.incident.max_duration.is_zero() {
            return Err(anyhow!("incident.max_duration_secs must be greater than zero"));
        }
        if self.evidence.playback_fps == 0 {
            return Err(anyhow!("evidence.playback_fps must be greater than zero"));
        }
        if !self.alert.url.is_empty() {
            let url = url::Url::parse(&self.alert.url)
                .map_err(|e| anyhow!("invalid alert url {}: {}", self.alert.url, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("alert url must be http or https: {}", self.alert.url));
            }
        }
        if self.alert.timeout.is_zero() {
            return Err(anyhow!("alert.timeout_ms must be greater than zero"));
        }
        if self.alert.queue_depth == 0 {
            return Err(anyhow!("alert.queue_depth must be greater than zero"));
        }
        if self.control.enabled {
            crate::control::parse_broker_addr(&self.control.mqtt_addr)?;
            if self.control.topic_prefix.trim_matches('/').is_empty() {
                return Err(anyhow!("control.topic_prefix must not be empty"));
            }
        }
        if !(1..=100).contains(&self.preview.quality) {
            return Err(anyhow!("preview.quality must be within [1, 100]"));
        }
        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(anyhow!("preview width and height must be greater than zero"));
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.capture.source_url.clone(),
            width: self.capture.width,
            height: self.capture.height,
            target_fps: self.capture.target_fps,
        }
    }

    pub fn incident_policy(&self) -> IncidentPolicy {
        IncidentPolicy {
            pre_context_frames: self.incident.window_frames,
            cooldown_frames: self.incident.cooldown_frames,
            max_duration: self.incident.max_duration,
        }
    }

    pub fn loop_timings(&self) -> LoopTimings {
        LoopTimings {
            frame_pause: self.capture.frame_pause,
            idle_pause: self.capture.idle_pause,
            reopen_delay: self.capture.reopen_delay,
            read_retry: self.capture.read_retry,
            ..LoopTimings::default()
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            send_without_evidence: self.alert.send_without_evidence,
            draw_overlays: self.preview.draw_overlays,
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            broker_addr: self.control.mqtt_addr.clone(),
            client_id: self.control.client_id.clone(),
            topic_prefix: self.control.topic_prefix.clone(),
            username: self.control.username.clone(),
            password: self.control.password.clone(),
            ..MqttSettings::default()
        }
    }

    pub fn preview_encoder(&self) -> PreviewEncoder {
        PreviewEncoder::new(
            self.preview.width,
            self.preview.height,
            self.preview.quality,
            self.preview.max_fps,
        )
    }
}

fn read_config_file(path: &Path) -> Result<InvigilatorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got '{}'", key, value)),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_classroom_deployment() {
        let cfg = InvigilatorConfig::from_file(InvigilatorConfigFile::default());
        assert_eq!(cfg.incident.window_frames, 30);
        assert_eq!(cfg.incident.cooldown_frames, 30);
        assert_eq!(cfg.incident.max_duration, Duration::from_secs(30));
        assert_eq!(cfg.alert.url, "http://localhost:5000/api/alerts");
        assert_eq!(cfg.alert.subject_id, "Student_1");
        assert_eq!(cfg.alert.timeout, Duration::from_secs(2));
        assert_eq!(cfg.evidence.playback_fps, 20);
        assert_eq!(cfg.preview.quality, 70);
        assert!(!cfg.control.initial_monitoring);
        assert!(!cfg.control.initial_camera);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() -> Result<()> {
        assert!(parse_bool("K", "TRUE")?);
        assert!(parse_bool("K", "1")?);
        assert!(!parse_bool("K", "off")?);
        assert!(parse_bool("K", "maybe").is_err());
        Ok(())
    }

    #[test]
    fn csv_split_drops_blanks() {
        assert_eq!(
            split_csv(" Using Phone, ,Moving "),
            vec!["Using Phone".to_string(), "Moving".to_string()]
        );
    }
}
