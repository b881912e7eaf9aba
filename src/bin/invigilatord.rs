//! invigilatord - exam invigilation daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + INVIGIL_* environment overrides)
//! 2. Builds the detector channels; a missing model disables object detection
//! 3. Connects the MQTT control channel (monitoring/camera switches, previews)
//! 4. Runs the frame loop until Ctrl-C, saving incident clips and posting alerts

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use invigilator::alert::{AlertTransport, HttpAlertTransport, LoggingTransport};
use invigilator::config::InvigilatorConfig;
use invigilator::control::MqttControlChannel;
use invigilator::detect::ObjectDetector;
use invigilator::ingest::source_from_config;
use invigilator::{
    AlertDispatcher, CameraController, ClipAssembler, ControlFlags, DetectorAggregator,
    FilesystemEvidenceStore, FramePipeline, IncidentStateMachine, ViolationClassifier,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "INVIGIL_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = InvigilatorConfig::load_from(args.config.as_deref())?;

    let mut detectors = DetectorAggregator::new(cfg.detection.gaze_yaw_threshold);
    detectors.install_object_detector(build_object_detector(&cfg));
    // No pose estimator backend ships with the daemon yet.
    detectors.install_pose_estimator(Err(anyhow!("no head pose backend configured")));

    let store = FilesystemEvidenceStore::new(&cfg.evidence.dir)?;
    log::info!("evidence clips written to {}", store.root().display());
    let clips = ClipAssembler::new(store, cfg.evidence.playback_fps);

    let alerts = spawn_dispatcher(&cfg)?;

    let flags = ControlFlags::shared(cfg.control.initial_monitoring, cfg.control.initial_camera);
    let control = if cfg.control.enabled {
        match MqttControlChannel::start(&cfg.mqtt_settings(), flags.clone()) {
            Ok(channel) => Some(channel),
            Err(e) => {
                log::warn!("control channel unavailable: {:#}", e);
                None
            }
        }
    } else {
        log::info!("control channel disabled; flags fixed at startup values");
        None
    };

    let mut pipeline = FramePipeline::new(
        detectors,
        ViolationClassifier::new(cfg.detection.violation_labels.clone()),
        IncidentStateMachine::new(cfg.incident_policy()),
        clips,
        alerts,
        flags,
    )
    .with_options(cfg.pipeline_options());
    if cfg.preview.enabled {
        if let Some(channel) = &control {
            pipeline = pipeline.with_preview(cfg.preview_encoder(), Box::new(channel.preview_sink()));
        }
    }

    let mut camera = CameraController::new(source_from_config(&cfg.source_config())?);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })?;

    log::info!(
        "invigilatord running. source={} monitoring={} camera={}",
        camera.describe(),
        pipeline.flags().monitoring_active(),
        pipeline.flags().camera_active()
    );
    let stats = pipeline.run(&mut camera, &shutdown, &cfg.loop_timings());
    log::info!(
        "invigilatord stopped: frames={} incidents={} clips={} alerts={}",
        stats.frames,
        stats.incidents,
        stats.clips_saved,
        stats.alerts_queued
    );

    if let Some(channel) = control {
        channel.stop()?;
    }
    Ok(())
}

fn spawn_dispatcher(cfg: &InvigilatorConfig) -> Result<AlertDispatcher> {
    let transport: Box<dyn AlertTransport> = if cfg.alert.url.is_empty() {
        log::info!("no alert url configured; alerts are logged only");
        Box::new(LoggingTransport)
    } else {
        log::info!("alerts posted to {}", cfg.alert.url);
        Box::new(HttpAlertTransport::new(cfg.alert.url.clone(), cfg.alert.timeout))
    };
    AlertDispatcher::spawn(transport, cfg.alert.subject_id.clone(), cfg.alert.queue_depth)
}

#[cfg(feature = "backend-tract")]
fn build_object_detector(cfg: &InvigilatorConfig) -> Result<Box<dyn ObjectDetector>> {
    let path = cfg
        .detection
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("no model path configured"))?;
    let detector = invigilator::detect::TractDetector::new(
        path,
        cfg.detection.input_width,
        cfg.detection.input_height,
        cfg.detection.class_names.clone(),
    )?
    .with_threshold(cfg.detection.confidence_threshold);
    Ok(Box::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn build_object_detector(cfg: &InvigilatorConfig) -> Result<Box<dyn ObjectDetector>> {
    match &cfg.detection.model_path {
        Some(path) => Err(anyhow!(
            "model {} needs the backend-tract feature",
            path.display()
        )),
        None => Err(anyhow!("no model path configured")),
    }
}
