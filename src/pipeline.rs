//! The per-frame loop.
//!
//! `FramePipeline` wires detection, classification, the incident state machine,
//! clip assembly, alert dispatch and preview publishing together. One call to
//! `process_frame` handles exactly one captured frame; `run` drives the camera
//! according to the control flags until the shutdown flag is raised.
//!
//! Nothing inside the loop is fatal: camera, detector, storage, alert and
//! preview failures are logged and the loop carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alert::AlertDispatcher;
use crate::classify::{Violation, ViolationClassifier};
use crate::control::{ControlFlags, PreviewEncoder, PreviewSink};
use crate::detect::{Detection, DetectorAggregator};
use crate::evidence::{ClipAssembler, EvidenceStore};
use crate::frame::Frame;
use crate::incident::{EndReason, Incident, IncidentStateMachine};
use crate::ingest::CameraController;
use crate::overlay;

/// Sleeps between loop iterations.
#[derive(Clone, Debug)]
pub struct LoopTimings {
    /// After each processed frame.
    pub frame_pause: Duration,
    /// While the camera is switched off.
    pub idle_pause: Duration,
    /// After the camera failed to open.
    pub reopen_delay: Duration,
    /// After a failed frame read.
    pub read_retry: Duration,
    /// How often loop counters are logged at debug level.
    pub stats_interval: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            frame_pause: Duration::from_millis(10),
            idle_pause: Duration::from_millis(500),
            reopen_delay: Duration::from_secs(1),
            read_retry: Duration::from_millis(100),
            stats_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Send the alert with an empty evidence reference when the clip could
    /// not be saved. When false the alert is skipped.
    pub send_without_evidence: bool,
    /// Draw detection boxes and the recording marker on previews.
    pub draw_overlays: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            send_without_evidence: true,
            draw_overlays: true,
        }
    }
}

/// Loop counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub frames_analyzed: u64,
    pub incidents: u64,
    pub clips_saved: u64,
    pub clip_failures: u64,
    pub alerts_queued: u64,
    pub previews_sent: u64,
}

/// What happened to one completed incident.
#[derive(Clone, Debug, PartialEq)]
pub struct IncidentReport {
    pub label: String,
    pub confidence: f32,
    pub frames: usize,
    pub pre_context: usize,
    pub end_reason: EndReason,
    pub evidence: Option<String>,
    pub alert_queued: bool,
}

/// Result of processing one frame.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub detections: Vec<Detection>,
    pub violation: Option<Violation>,
    pub incident: Option<IncidentReport>,
}

struct Preview {
    encoder: PreviewEncoder,
    sink: Box<dyn PreviewSink>,
}

pub struct FramePipeline<S: EvidenceStore> {
    detectors: DetectorAggregator,
    classifier: ViolationClassifier,
    incidents: IncidentStateMachine,
    clips: ClipAssembler<S>,
    alerts: AlertDispatcher,
    flags: Arc<ControlFlags>,
    preview: Option<Preview>,
    options: PipelineOptions,
    stats: PipelineStats,
}

impl<S: EvidenceStore> FramePipeline<S> {
    pub fn new(
        detectors: DetectorAggregator,
        classifier: ViolationClassifier,
        incidents: IncidentStateMachine,
        clips: ClipAssembler<S>,
        alerts: AlertDispatcher,
        flags: Arc<ControlFlags>,
    ) -> Self {
        Self {
            detectors,
            classifier,
            incidents,
            clips,
            alerts,
            flags,
            preview: None,
            options: PipelineOptions::default(),
            stats: PipelineStats::default(),
        }
    }

    pub fn with_preview(mut self, encoder: PreviewEncoder, sink: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(Preview { encoder, sink });
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn flags(&self) -> &Arc<ControlFlags> {
        &self.flags
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn incidents(&self) -> &IncidentStateMachine {
        &self.incidents
    }

    pub fn clips(&self) -> &ClipAssembler<S> {
        &self.clips
    }

    pub fn alerts(&self) -> &AlertDispatcher {
        &self.alerts
    }

    /// Handle one captured frame.
    pub fn process_frame(&mut self, frame: Frame, now: Instant) -> FrameOutcome {
        self.stats.frames += 1;

        let detections = if self.flags.monitoring_active() {
            self.stats.frames_analyzed += 1;
            self.detectors.detect(&frame)
        } else {
            Vec::new()
        };
        let violation = self.classifier.classify(&detections);

        let preview_frame = self.preview.is_some().then(|| frame.clone());
        let incident = self
            .incidents
            .observe(frame, violation.as_ref(), now)
            .map(|incident| self.finish_incident(incident));

        if let Some(frame) = preview_frame {
            self.publish_preview(&frame, &detections, now);
        }

        FrameOutcome {
            detections,
            violation,
            incident,
        }
    }

    /// Close an open incident immediately, saving and reporting it.
    pub fn flush(&mut self, now: Instant) -> Option<IncidentReport> {
        let incident = self.incidents.flush(now)?;
        Some(self.finish_incident(incident))
    }

    /// Drive `camera` until `shutdown` is raised.
    ///
    /// The camera follows the camera flag: it is released and the loop idles
    /// while the flag is off. Open and read failures are retried after a
    /// delay. On shutdown any open incident is flushed and the camera released.
    pub fn run(
        &mut self,
        camera: &mut CameraController,
        shutdown: &AtomicBool,
        timings: &LoopTimings,
    ) -> PipelineStats {
        let mut last_stats = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            if !self.flags.camera_active() {
                camera.release();
                std::thread::sleep(timings.idle_pause);
                continue;
            }

            if let Err(e) = camera.acquire() {
                log::warn!("{:#}; retrying in {:?}", e, timings.reopen_delay);
                std::thread::sleep(timings.reopen_delay);
                continue;
            }

            let frame = match camera.read() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("failed to read frame: {:#}", e);
                    std::thread::sleep(timings.read_retry);
                    continue;
                }
            };

            self.process_frame(frame, Instant::now());

            if last_stats.elapsed() >= timings.stats_interval {
                log::debug!(
                    "loop: frames={} analyzed={} incidents={} recording={} window={}",
                    self.stats.frames,
                    self.stats.frames_analyzed,
                    self.stats.incidents,
                    self.incidents.is_recording(),
                    self.incidents.window().len()
                );
                last_stats = Instant::now();
            }

            std::thread::sleep(timings.frame_pause);
        }

        log::info!("shutdown requested");
        self.flush(Instant::now());
        camera.release();
        self.stats.clone()
    }

    fn finish_incident(&mut self, incident: Incident) -> IncidentReport {
        self.stats.incidents += 1;

        let evidence = match self
            .clips
            .assemble_at(&incident.label, &incident.frames, incident.started_wall)
        {
            Ok(name) => {
                if name.is_some() {
                    self.stats.clips_saved += 1;
                }
                name
            }
            Err(e) => {
                self.stats.clip_failures += 1;
                log::error!("failed to save clip for {}: {:#}", incident.label, e);
                None
            }
        };

        let alert_queued = if evidence.is_some() || self.options.send_without_evidence {
            self.alerts
                .dispatch(&incident.label, incident.confidence, evidence.as_deref())
        } else {
            log::warn!("no evidence for {}; alert not sent", incident.label);
            false
        };
        if alert_queued {
            self.stats.alerts_queued += 1;
        }

        IncidentReport {
            label: incident.label,
            confidence: incident.confidence,
            frames: incident.frames.len(),
            pre_context: incident.pre_context,
            end_reason: incident.end_reason,
            evidence,
            alert_queued,
        }
    }

    fn publish_preview(&mut self, frame: &Frame, detections: &[Detection], now: Instant) {
        let Some(preview) = self.preview.as_mut() else {
            return;
        };
        if !preview.encoder.take_slot(now) {
            return;
        }

        let mut image = frame.to_rgb_image();
        if self.options.draw_overlays {
            overlay::draw_detections(&mut image, detections, &self.classifier);
            if self.incidents.is_recording() {
                overlay::draw_recording_marker(&mut image);
            }
        }

        let published = preview
            .encoder
            .encode(&image)
            .and_then(|encoded| preview.sink.publish(encoded));
        match published {
            Ok(()) => self.stats.previews_sent += 1,
            Err(e) => log::debug!("preview dropped: {:#}", e),
        }
    }

    /// Stop the alert worker after it has attempted every queued alert.
    pub fn shutdown(self) -> anyhow::Result<PipelineStats> {
        let stats = self.stats;
        self.alerts.shutdown()?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertPayload, AlertTransport};
    use crate::detect::ScriptedDetector;
    use crate::incident::IncidentPolicy;
    use anyhow::{anyhow, Result};
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        seen: Arc<Mutex<Vec<AlertPayload>>>,
    }

    impl AlertTransport for RecordingTransport {
        fn deliver(&self, payload: &AlertPayload) -> Result<()> {
            self.seen.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct BrokenStore;

    impl EvidenceStore for BrokenStore {
        fn put(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
            Err(anyhow!("read-only filesystem"))
        }
    }

    #[derive(Clone, Default)]
    struct CapturingSink {
        published: Arc<Mutex<Vec<String>>>,
    }

    impl PreviewSink for CapturingSink {
        fn publish(&mut self, jpeg_base64: String) -> Result<()> {
            self.published.lock().unwrap().push(jpeg_base64);
            Ok(())
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Instant::now(), RgbImage::new(16, 12))
    }

    fn pipeline<S: EvidenceStore>(
        store: S,
        trace: &str,
        options: PipelineOptions,
        transport: RecordingTransport,
    ) -> Result<FramePipeline<S>> {
        let detectors =
            DetectorAggregator::default().with_object_detector(ScriptedDetector::from_csv(trace));
        let incidents = IncidentStateMachine::new(IncidentPolicy {
            pre_context_frames: 4,
            cooldown_frames: 2,
            max_duration: Duration::from_secs(60),
        });
        let alerts = AlertDispatcher::spawn(transport, "Student_1", 8)?;
        Ok(FramePipeline::new(
            detectors,
            ViolationClassifier::default(),
            incidents,
            ClipAssembler::new(store, 20),
            alerts,
            ControlFlags::shared(true, true),
        )
        .with_options(options))
    }

    #[test]
    fn monitoring_off_skips_detection() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = crate::evidence::FilesystemEvidenceStore::new(temp_dir.path())?;
        let mut pipeline = pipeline(
            store,
            "Using Phone,Using Phone",
            PipelineOptions::default(),
            RecordingTransport::default(),
        )?;
        pipeline.flags().set_monitoring(false);

        let outcome = pipeline.process_frame(frame(0), Instant::now());
        assert!(outcome.detections.is_empty());
        assert!(outcome.violation.is_none());
        assert!(!pipeline.incidents().is_recording());
        assert_eq!(pipeline.stats().frames_analyzed, 0);
        pipeline.shutdown()?;
        Ok(())
    }

    #[test]
    fn clip_failure_still_alerts_with_empty_evidence() -> Result<()> {
        let transport = RecordingTransport::default();
        let seen = transport.seen.clone();
        let mut pipeline = pipeline(
            BrokenStore,
            "Using Phone,-,-,-",
            PipelineOptions::default(),
            transport,
        )?;

        let mut reports = Vec::new();
        for seq in 0..4 {
            if let Some(report) = pipeline.process_frame(frame(seq), Instant::now()).incident {
                reports.push(report);
            }
        }
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].evidence, None);
        assert!(reports[0].alert_queued);

        let stats = pipeline.shutdown()?;
        assert_eq!(stats.clip_failures, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].evidence_path, "");
        Ok(())
    }

    #[test]
    fn clip_failure_skips_alert_when_configured() -> Result<()> {
        let transport = RecordingTransport::default();
        let seen = transport.seen.clone();
        let options = PipelineOptions {
            send_without_evidence: false,
            ..PipelineOptions::default()
        };
        let mut pipeline = pipeline(BrokenStore, "Using Phone,-,-,-", options, transport)?;
        for seq in 0..4 {
            pipeline.process_frame(frame(seq), Instant::now());
        }
        let stats = pipeline.shutdown()?;
        assert_eq!(stats.incidents, 1);
        assert_eq!(stats.alerts_queued, 0);
        assert!(seen.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn flush_reports_open_incident() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = crate::evidence::FilesystemEvidenceStore::new(temp_dir.path())?;
        let mut pipeline = pipeline(
            store,
            "-,Giving object,Giving object",
            PipelineOptions::default(),
            RecordingTransport::default(),
        )?;
        for seq in 0..3 {
            pipeline.process_frame(frame(seq), Instant::now());
        }
        let report = pipeline.flush(Instant::now()).expect("open incident");
        assert_eq!(report.label, "Giving object");
        assert_eq!(report.end_reason, EndReason::Flushed);
        assert_eq!(report.pre_context, 1);
        assert_eq!(report.frames, 3);
        assert!(report.evidence.is_some());
        assert!(pipeline.flush(Instant::now()).is_none());
        pipeline.shutdown()?;
        Ok(())
    }

    #[test]
    fn previews_are_throttled_and_published() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = crate::evidence::FilesystemEvidenceStore::new(temp_dir.path())?;
        let sink = CapturingSink::default();
        let published = sink.published.clone();
        let mut pipeline = pipeline(
            store,
            "Using Phone",
            PipelineOptions::default(),
            RecordingTransport::default(),
        )?
        .with_preview(PreviewEncoder::new(8, 6, 70, 10), Box::new(sink));

        let start = Instant::now();
        pipeline.process_frame(frame(0), start);
        pipeline.process_frame(frame(1), start + Duration::from_millis(20));
        pipeline.process_frame(frame(2), start + Duration::from_millis(150));

        assert_eq!(published.lock().unwrap().len(), 2);
        assert_eq!(pipeline.stats().previews_sent, 2);
        pipeline.shutdown()?;
        Ok(())
    }

    #[test]
    fn run_exits_on_shutdown_and_releases_camera() -> Result<()> {
        use crate::ingest::{SourceConfig, SyntheticSource};

        let temp_dir = tempfile::tempdir()?;
        let store = crate::evidence::FilesystemEvidenceStore::new(temp_dir.path())?;
        let mut pipeline = pipeline(store, "", PipelineOptions::default(), RecordingTransport::default())?;
        let source = SyntheticSource::new(SourceConfig {
            url: "stub://run".to_string(),
            width: 8,
            height: 8,
            target_fps: 30,
        });
        let mut camera = CameraController::new(Box::new(source));

        let shutdown = AtomicBool::new(true);
        let stats = pipeline.run(&mut camera, &shutdown, &LoopTimings::default());
        assert_eq!(stats.frames, 0);
        assert!(!camera.is_open());
        pipeline.shutdown()?;
        Ok(())
    }

    #[derive(Clone, Default)]
    struct SourceCounters {
        open_attempts: Arc<AtomicUsize>,
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        reads: Arc<AtomicUsize>,
    }

    struct CountingSource {
        inner: crate::ingest::SyntheticSource,
        counters: SourceCounters,
    }

    impl crate::ingest::FrameSource for CountingSource {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        fn open(&mut self) -> Result<()> {
            self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.open()?;
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self) -> Result<Frame> {
            let frame = self.inner.read()?;
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            Ok(frame)
        }

        fn release(&mut self) {
            self.inner.release();
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    fn wait_until(deadline: Instant, condition: impl Fn() -> bool) -> bool {
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn run_follows_camera_flag_and_flushes_on_shutdown() -> Result<()> {
        use crate::ingest::{SourceConfig, SyntheticSource};

        let temp_dir = tempfile::tempdir()?;
        let store = crate::evidence::FilesystemEvidenceStore::new(temp_dir.path())?;
        let transport = RecordingTransport::default();
        let seen = transport.seen.clone();
        let detectors = DetectorAggregator::default()
            .with_object_detector(ScriptedDetector::from_csv("Using Phone").looping());
        let mut pipeline = FramePipeline::new(
            detectors,
            ViolationClassifier::default(),
            IncidentStateMachine::new(IncidentPolicy {
                pre_context_frames: 4,
                cooldown_frames: 2,
                max_duration: Duration::from_secs(600),
            }),
            ClipAssembler::new(store, 20),
            AlertDispatcher::spawn(transport, "Student_1", 8)?,
            ControlFlags::shared(true, true),
        );

        let counters = SourceCounters::default();
        let source = CountingSource {
            inner: SyntheticSource::new(SourceConfig {
                url: "stub://run-flags".to_string(),
                width: 8,
                height: 8,
                target_fps: 30,
            })
            .with_open_failures(1),
            counters: counters.clone(),
        };
        let mut camera = CameraController::new(Box::new(source));

        let timings = LoopTimings {
            frame_pause: Duration::from_millis(1),
            idle_pause: Duration::from_millis(1),
            reopen_delay: Duration::ZERO,
            read_retry: Duration::ZERO,
            stats_interval: Duration::from_secs(60),
        };
        let shutdown = Arc::new(AtomicBool::new(false));

        let controller = {
            let flags = pipeline.flags().clone();
            let counters = counters.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(10);
                let reads = |n: usize| {
                    let reads = counters.reads.clone();
                    move || reads.load(Ordering::SeqCst) >= n
                };
                let first_frames = wait_until(deadline, reads(3));
                flags.set_camera(false);
                let released = wait_until(deadline, || counters.released.load(Ordering::SeqCst) >= 1);
                let reads_when_stopped = counters.reads.load(Ordering::SeqCst);
                flags.set_camera(true);
                let resumed = wait_until(deadline, reads(reads_when_stopped + 3));
                shutdown.store(true, Ordering::SeqCst);
                first_frames && released && resumed
            })
        };

        let stats = pipeline.run(&mut camera, &shutdown, &timings);
        let scenario_completed = controller.join().expect("controller thread");
        assert!(scenario_completed);

        assert!(stats.frames >= 6);
        assert_eq!(stats.frames, counters.reads.load(Ordering::SeqCst) as u64);
        // One injected failure, then the initial open and the reopen after stop.
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.open_attempts.load(Ordering::SeqCst), 3);
        // Released once when the flag went off and once at shutdown.
        assert_eq!(counters.released.load(Ordering::SeqCst), 2);
        assert!(!camera.is_open());

        // The violation never stopped, so only the shutdown flush closed it.
        assert_eq!(stats.incidents, 1);
        assert_eq!(stats.clips_saved, 1);
        assert!(!pipeline.incidents().is_recording());
        let stats = pipeline.shutdown()?;
        assert_eq!(stats.alerts_queued, 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].violation_type, "Using Phone");
        assert!(!seen[0].evidence_path.is_empty());
        Ok(())
    }
}
