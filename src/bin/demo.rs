//! demo - end-to-end synthetic run of the invigilation pipeline
//!
//! Feeds generated frames through a scripted detector so that incidents open
//! and close on a known schedule, writes the clips to the output directory and
//! logs the alerts instead of posting them.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use invigilator::detect::{FixedPoseEstimator, HeadPose, ScriptedDetector};
use invigilator::ingest::{FrameSource, SourceConfig, SyntheticSource};
use invigilator::{
    AlertDispatcher, ClipAssembler, ControlFlags, DetectorAggregator, FilesystemEvidenceStore,
    FramePipeline, IncidentReport, IncidentStateMachine, LoggingTransport, ViolationClassifier,
};

const DEFAULT_TRACE: &str = "-,-,-,-,-,Using Phone,Using Phone,Using Phone,-,Using Phone";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of frames to generate.
    #[arg(long, default_value_t = 120)]
    frames: u64,
    /// Simulated capture rate, used to timestamp frames.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Comma-separated detector trace; `-` means no detection on that frame.
    #[arg(long, default_value = DEFAULT_TRACE)]
    trace: String,
    /// Frame index at which the simulated student turns their head left
    /// for one second.
    #[arg(long)]
    glance_at: Option<u64>,
    /// Output directory for incident clips.
    #[arg(long, default_value = "demo_out")]
    out: PathBuf,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 240)]
    height: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }

    stage("build pipeline");
    let mut detectors = DetectorAggregator::default()
        .with_object_detector(ScriptedDetector::from_csv(&args.trace).with_confidence(0.87));
    if let Some(start) = args.glance_at {
        detectors = detectors.with_pose_estimator(glance_script(start, args.fps, args.frames));
    }

    let store = FilesystemEvidenceStore::new(&args.out)?;
    let alerts = AlertDispatcher::spawn(LoggingTransport, "Student_1", 8)?;
    let mut pipeline = FramePipeline::new(
        detectors,
        ViolationClassifier::default(),
        IncidentStateMachine::default(),
        ClipAssembler::new(store, 20),
        alerts,
        ControlFlags::shared(true, true),
    );

    let mut source = SyntheticSource::new(SourceConfig {
        url: "stub://demo".to_string(),
        width: args.width,
        height: args.height,
        target_fps: args.fps,
    });
    source.open()?;

    stage("process synthetic frames");
    let start = Instant::now();
    let frame_interval = Duration::from_secs(1) / args.fps;
    let mut reports: Vec<IncidentReport> = Vec::new();
    for index in 0..args.frames {
        let frame = source.read()?;
        let now = start + frame_interval * index as u32;
        if let Some(report) = pipeline.process_frame(frame, now).incident {
            reports.push(report);
        }
    }
    let end = start + frame_interval * args.frames as u32;
    if let Some(report) = pipeline.flush(end) {
        reports.push(report);
    }
    source.release();

    let clip_dir = pipeline.clips().store().root().to_path_buf();
    let stats = pipeline.shutdown()?;

    println!("demo summary:");
    println!("  frames processed: {}", stats.frames);
    println!("  incidents: {}", stats.incidents);
    for report in &reports {
        println!(
            "    {} ({:?}): {} frames, {} pre-context, conf {:.2}, clip {}",
            report.label,
            report.end_reason,
            report.frames,
            report.pre_context,
            report.confidence,
            report.evidence.as_deref().unwrap_or("<none>")
        );
    }
    println!("  clips saved: {}", stats.clips_saved);
    println!("  alerts queued: {}", stats.alerts_queued);
    println!("  clip directory: {}", clip_dir.display());
    Ok(())
}

/// Head pose script: straight ahead, except one second turned left from `start`.
fn glance_script(start: u64, fps: u32, frames: u64) -> FixedPoseEstimator {
    let ahead = HeadPose {
        yaw: 0.0,
        pitch: 0.0,
    };
    let left = HeadPose {
        yaw: -35.0,
        pitch: 0.0,
    };
    let poses = (0..frames)
        .map(|index| {
            if index >= start && index < start + fps as u64 {
                Some(left)
            } else {
                Some(ahead)
            }
        })
        .collect();
    FixedPoseEstimator::new(poses)
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
