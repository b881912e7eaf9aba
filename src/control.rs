//! Remote control channel.
//!
//! A remote controller toggles two process-wide switches and receives a live
//! preview of the camera:
//!
//! - inbound `<prefix>/set_monitoring` with `{"active": bool}`
//! - inbound `<prefix>/camera_control` with `{"action": "start" | "stop"}`
//! - outbound `<prefix>/video_frame`: base64 JPEG of the current frame
//!
//! The flags live in `ControlFlags`, shared with the frame loop behind an `Arc`.
//! The MQTT event loop runs on its own thread, so a lost broker connection never
//! stalls frame processing. Preview publishing is best-effort and non-blocking.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_TOPIC_PREFIX: &str = "invigil";
pub const DEFAULT_MQTT_ADDR: &str = "127.0.0.1:1883";
pub const DEFAULT_CLIENT_ID: &str = "invigilatord";
pub const DEFAULT_PREVIEW_WIDTH: u32 = 640;
pub const DEFAULT_PREVIEW_HEIGHT: u32 = 480;
pub const DEFAULT_PREVIEW_QUALITY: u8 = 70;
pub const DEFAULT_PREVIEW_MAX_FPS: u32 = 15;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
// Base64 previews are far above the 10 KiB MQTT packet default.
const MAX_PACKET_BYTES: usize = 4 * 1024 * 1024;

// ----------------------------------------------------------------------------
// ControlFlags: shared monitoring/camera switches
// ----------------------------------------------------------------------------

/// Process-wide control switches.
///
/// Written by the control thread, read by the frame loop once per iteration.
/// Each flag is a single atomic; readers see either the old or the new value.
#[derive(Debug)]
pub struct ControlFlags {
    monitoring: AtomicBool,
    camera: AtomicBool,
}

impl ControlFlags {
    pub fn new(monitoring: bool, camera: bool) -> Self {
        Self {
            monitoring: AtomicBool::new(monitoring),
            camera: AtomicBool::new(camera),
        }
    }

    pub fn shared(monitoring: bool, camera: bool) -> Arc<Self> {
        Arc::new(Self::new(monitoring, camera))
    }

    pub fn monitoring_active(&self) -> bool {
        self.monitoring.load(Ordering::Relaxed)
    }

    pub fn camera_active(&self) -> bool {
        self.camera.load(Ordering::Relaxed)
    }

    /// Returns the previous value.
    pub fn set_monitoring(&self, active: bool) -> bool {
        self.monitoring.swap(active, Ordering::Relaxed)
    }

    /// Returns the previous value.
    pub fn set_camera(&self, active: bool) -> bool {
        self.camera.swap(active, Ordering::Relaxed)
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new(false, false)
    }
}

// ----------------------------------------------------------------------------
// Inbound commands
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraAction {
    Start,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    SetMonitoring(bool),
    Camera(CameraAction),
}

#[derive(Deserialize)]
struct SetMonitoringPayload {
    active: bool,
}

#[derive(Deserialize)]
struct CameraControlPayload {
    action: String,
}

/// Topic names for one prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlTopics {
    pub set_monitoring: String,
    pub camera_control: String,
    pub video_frame: String,
}

impl ControlTopics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            set_monitoring: format!("{}/set_monitoring", prefix),
            camera_control: format!("{}/camera_control", prefix),
            video_frame: format!("{}/video_frame", prefix),
        }
    }

    /// Parse an inbound message.
    ///
    /// Errors on unknown topics, malformed JSON and unknown camera actions.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<ControlCommand> {
        if topic == self.set_monitoring {
            let msg: SetMonitoringPayload =
                serde_json::from_slice(payload).context("parse set_monitoring payload")?;
            return Ok(ControlCommand::SetMonitoring(msg.active));
        }
        if topic == self.camera_control {
            let msg: CameraControlPayload =
                serde_json::from_slice(payload).context("parse camera_control payload")?;
            let action = match msg.action.as_str() {
                "start" => CameraAction::Start,
                "stop" => CameraAction::Stop,
                other => return Err(anyhow!("unknown camera action '{}'", other)),
            };
            return Ok(ControlCommand::Camera(action));
        }
        Err(anyhow!("unexpected control topic {}", topic))
    }
}

/// Apply a command to the shared flags, logging actual transitions.
pub fn apply(flags: &ControlFlags, command: ControlCommand) {
    match command {
        ControlCommand::SetMonitoring(active) => {
            if flags.set_monitoring(active) != active {
                log::info!("monitoring {}", if active { "started" } else { "stopped" });
            }
        }
        ControlCommand::Camera(action) => {
            let active = action == CameraAction::Start;
            if flags.set_camera(active) != active {
                log::info!("camera {} requested", if active { "start" } else { "stop" });
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Outbound preview
// ----------------------------------------------------------------------------

/// Destination for encoded preview frames.
pub trait PreviewSink: Send {
    /// Publish one base64 JPEG. Must not block on the network.
    fn publish(&mut self, jpeg_base64: String) -> Result<()>;
}

/// Downsamples, JPEG-compresses and base64-encodes preview frames, at most
/// `max_fps` times per second.
#[derive(Clone, Debug)]
pub struct PreviewEncoder {
    width: u32,
    height: u32,
    quality: u8,
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl PreviewEncoder {
    pub fn new(width: u32, height: u32, quality: u8, max_fps: u32) -> Self {
        let min_interval = if max_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / max_fps
        };
        Self {
            width: width.max(1),
            height: height.max(1),
            quality: quality.clamp(1, 100),
            min_interval,
            last_sent: None,
        }
    }

    /// True when a preview may be sent at `now`. Marks the slot as taken.
    pub fn take_slot(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    pub fn encode(&self, image: &RgbImage) -> Result<String> {
        let resized;
        let source = if image.dimensions() == (self.width, self.height) {
            image
        } else {
            resized =
                image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
            &resized
        };
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(source)
            .context("encode preview jpeg")?;
        Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
    }
}

impl Default for PreviewEncoder {
    fn default() -> Self {
        Self::new(
            DEFAULT_PREVIEW_WIDTH,
            DEFAULT_PREVIEW_HEIGHT,
            DEFAULT_PREVIEW_QUALITY,
            DEFAULT_PREVIEW_MAX_FPS,
        )
    }
}

// ----------------------------------------------------------------------------
// MQTT transport
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct MqttSettings {
    /// `host:port`, optionally prefixed with `mqtt://` or `tcp://`.
    pub broker_addr: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_addr: DEFAULT_MQTT_ADDR.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Split a broker address into host and port.
pub fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    // [::1]:1883
    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// MQTT-backed control channel.
///
/// Owns the event-loop thread. Dropping the channel leaves the thread running
/// until process exit; call `stop` for an orderly disconnect.
pub struct MqttControlChannel {
    client: Client,
    topics: ControlTopics,
    stopping: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MqttControlChannel {
    /// Start the event loop. Only address parsing can fail here; the broker
    /// connection itself is established, and re-established, in the background.
    pub fn start(settings: &MqttSettings, flags: Arc<ControlFlags>) -> Result<Self> {
        let (host, port) = parse_broker_addr(&settings.broker_addr)?;
        let mut options = MqttOptions::new(settings.client_id.clone(), host, port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }

        let (client, connection) = Client::new(options, 10);
        let topics = ControlTopics::new(&settings.topic_prefix);

        let stopping = Arc::new(AtomicBool::new(false));
        let worker_client = client.clone();
        let worker_topics = topics.clone();
        let worker_stopping = stopping.clone();
        let worker = std::thread::Builder::new()
            .name("control-mqtt".to_string())
            .spawn(move || {
                run_event_loop(
                    worker_client,
                    connection,
                    worker_topics,
                    flags,
                    worker_stopping,
                )
            })
            .context("spawn control channel thread")?;

        log::info!(
            "control channel started (broker: {}, prefix: {})",
            settings.broker_addr,
            settings.topic_prefix
        );
        Ok(Self {
            client,
            topics,
            stopping,
            worker: Some(worker),
        })
    }

    pub fn topics(&self) -> &ControlTopics {
        &self.topics
    }

    /// A preview sink publishing on this channel's `video_frame` topic.
    pub fn preview_sink(&self) -> MqttPreviewSink {
        MqttPreviewSink {
            client: self.client.clone(),
            topic: self.topics.video_frame.clone(),
        }
    }

    /// Disconnect and wait for the event loop to finish.
    pub fn stop(mut self) -> Result<()> {
        self.stopping.store(true, Ordering::Relaxed);
        if let Err(e) = self.client.disconnect() {
            log::debug!("control channel disconnect: {}", e);
        }
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("control channel thread panicked"))?;
        }
        Ok(())
    }
}

fn run_event_loop(
    client: Client,
    mut connection: Connection,
    topics: ControlTopics,
    flags: Arc<ControlFlags>,
    stopping: Arc<AtomicBool>,
) {
    for notification in connection.iter() {
        if stopping.load(Ordering::Relaxed) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("control channel connected");
                for topic in [&topics.set_monitoring, &topics.camera_control] {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        log::warn!("failed to subscribe to {}: {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match topics.parse(&publish.topic, &publish.payload) {
                    Ok(command) => apply(&flags, command),
                    Err(e) => log::warn!("ignoring control message: {:#}", e),
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                log::info!("control channel disconnecting");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("control channel connection error: {}. Reconnecting...", e);
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
}

/// Publishes previews with `try_publish`; a full request queue drops the frame.
pub struct MqttPreviewSink {
    client: Client,
    topic: String,
}

impl PreviewSink for MqttPreviewSink {
    fn publish(&mut self, jpeg_base64: String) -> Result<()> {
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, jpeg_base64)
            .map_err(|e| anyhow!("publish preview: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn topics() -> ControlTopics {
        ControlTopics::new(DEFAULT_TOPIC_PREFIX)
    }

    #[test]
    fn topics_follow_prefix() {
        let topics = ControlTopics::new("exam/room1/");
        assert_eq!(topics.set_monitoring, "exam/room1/set_monitoring");
        assert_eq!(topics.camera_control, "exam/room1/camera_control");
        assert_eq!(topics.video_frame, "exam/room1/video_frame");
    }

    #[test]
    fn parses_valid_commands() -> Result<()> {
        let topics = topics();
        assert_eq!(
            topics.parse("invigil/set_monitoring", br#"{"active": true}"#)?,
            ControlCommand::SetMonitoring(true)
        );
        assert_eq!(
            topics.parse("invigil/camera_control", br#"{"action": "stop"}"#)?,
            ControlCommand::Camera(CameraAction::Stop)
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_and_unknown_messages() {
        let topics = topics();
        assert!(topics.parse("invigil/set_monitoring", b"not json").is_err());
        assert!(topics
            .parse("invigil/set_monitoring", br#"{"active": "yes"}"#)
            .is_err());
        assert!(topics
            .parse("invigil/camera_control", br#"{"action": "reboot"}"#)
            .is_err());
        assert!(topics.parse("invigil/other", br#"{"active": true}"#).is_err());
    }

    #[test]
    fn apply_updates_flags() {
        let flags = ControlFlags::default();
        apply(&flags, ControlCommand::SetMonitoring(true));
        apply(&flags, ControlCommand::Camera(CameraAction::Start));
        assert!(flags.monitoring_active());
        assert!(flags.camera_active());

        apply(&flags, ControlCommand::Camera(CameraAction::Stop));
        assert!(!flags.camera_active());
        assert!(flags.monitoring_active());
    }

    #[test]
    fn broker_addr_parsing() -> Result<()> {
        assert_eq!(
            parse_broker_addr("127.0.0.1:1883")?,
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_addr("mqtt://broker.local:1884")?,
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(parse_broker_addr("[::1]:1883")?, ("::1".to_string(), 1883));
        assert!(parse_broker_addr("broker.local").is_err());
        assert!(parse_broker_addr("mqtts://broker.local:8883").is_err());
        Ok(())
    }

    #[test]
    fn preview_is_base64_jpeg_at_target_size() -> Result<()> {
        let encoder = PreviewEncoder::new(32, 24, 70, 15);
        let image = RgbImage::from_pixel(64, 48, Rgb([10, 200, 30]));
        let encoded = encoder.encode(&image)?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        Ok(())
    }

    #[test]
    fn preview_is_throttled() {
        let mut encoder = PreviewEncoder::new(8, 8, 70, 10);
        let start = Instant::now();
        assert!(encoder.take_slot(start));
        assert!(!encoder.take_slot(start + Duration::from_millis(50)));
        assert!(encoder.take_slot(start + Duration::from_millis(100)));
    }
}
