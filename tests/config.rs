use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use invigilator::config::InvigilatorConfig;
use invigilator::ingest::{source_from_config, CameraController, DEFAULT_SOURCE_URL};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "INVIGIL_CONFIG",
        "INVIGIL_SOURCE_URL",
        "INVIGIL_MODEL_PATH",
        "INVIGIL_EVIDENCE_DIR",
        "INVIGIL_ALERT_URL",
        "INVIGIL_SUBJECT_ID",
        "INVIGIL_MQTT_ADDR",
        "INVIGIL_MONITORING",
        "INVIGIL_CAMERA",
        "INVIGIL_VIOLATION_LABELS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "capture": {
                "source_url": "stub://hall-a",
                "width": 1280,
                "height": 720,
                "target_fps": 25
            },
            "detection": {
                "model_path": "models/exam.onnx",
                "confidence_threshold": 0.6,
                "gaze_yaw_threshold": 25.0
            },
            "incident": {
                "window_frames": 45,
                "cooldown_frames": 20,
                "max_duration_secs": 12
            },
            "evidence": {
                "dir": "/var/lib/invigil/clips",
                "playback_fps": 15
            },
            "alert": {
                "url": "http://dashboard.local:5000/api/alerts",
                "subject_id": "Desk_14",
                "timeout_ms": 1500,
                "send_without_evidence": false
            },
            "control": {
                "topic_prefix": "hall-a",
                "initial_monitoring": true
            },
            "preview": {
                "max_fps": 5,
                "draw_overlays": false
            }
        }"#,
    );

    std::env::set_var("INVIGIL_SOURCE_URL", "stub://hall-b");
    std::env::set_var("INVIGIL_SUBJECT_ID", "Desk_9");
    std::env::set_var("INVIGIL_CAMERA", "true");
    std::env::set_var("INVIGIL_VIOLATION_LABELS", "Using Phone, Giving object");

    let cfg = InvigilatorConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.capture.source_url, "stub://hall-b");
    assert_eq!(cfg.capture.width, 1280);
    assert_eq!(cfg.capture.height, 720);
    assert_eq!(cfg.capture.target_fps, 25);
    assert_eq!(
        cfg.detection.model_path,
        Some(PathBuf::from("models/exam.onnx"))
    );
    assert_eq!(cfg.detection.confidence_threshold, 0.6);
    assert_eq!(cfg.detection.gaze_yaw_threshold, 25.0);
    assert_eq!(
        cfg.detection.violation_labels,
        vec!["Using Phone".to_string(), "Giving object".to_string()]
    );
    assert_eq!(cfg.incident.window_frames, 45);
    assert_eq!(cfg.incident.cooldown_frames, 20);
    assert_eq!(cfg.incident.max_duration, Duration::from_secs(12));
    assert_eq!(cfg.evidence.dir, PathBuf::from("/var/lib/invigil/clips"));
    assert_eq!(cfg.evidence.playback_fps, 15);
    assert_eq!(cfg.alert.url, "http://dashboard.local:5000/api/alerts");
    assert_eq!(cfg.alert.subject_id, "Desk_9");
    assert_eq!(cfg.alert.timeout, Duration::from_millis(1500));
    assert!(!cfg.alert.send_without_evidence);
    assert_eq!(cfg.control.topic_prefix, "hall-a");
    assert!(cfg.control.initial_monitoring);
    assert!(cfg.control.initial_camera);
    assert_eq!(cfg.preview.max_fps, 5);
    assert!(!cfg.preview.draw_overlays);

    let policy = cfg.incident_policy();
    assert_eq!(policy.pre_context_frames, 45);
    assert!(!cfg.pipeline_options().send_without_evidence);

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = InvigilatorConfig::load_from(None).expect("load defaults");
    assert_eq!(cfg.capture.source_url, DEFAULT_SOURCE_URL);
    assert_eq!(cfg.detection.model_path, None);
    assert_eq!(cfg.detection.violation_labels.len(), 6);
    assert_eq!(cfg.evidence.dir, PathBuf::from("data/processed"));
    assert_eq!(cfg.control.mqtt_addr, "127.0.0.1:1883");
    assert_eq!(cfg.control.topic_prefix, "invigil");
    assert_eq!(cfg.loop_timings().reopen_delay, Duration::from_secs(1));

    clear_env();
}

#[test]
fn default_config_yields_a_usable_camera() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = InvigilatorConfig::load_from(None).expect("load defaults");
    let source = source_from_config(&cfg.source_config()).expect("default source builds");
    let mut camera = CameraController::new(source);
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        assert!(camera.acquire().expect("synthetic camera opens"));
        let frame = camera.read().expect("frame");
        assert_eq!(frame.width(), cfg.capture.width);
        assert!(camera.release());
    }
    assert!(!camera.is_open());

    clear_env();
}

#[test]
fn empty_alert_url_env_disables_http_delivery() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INVIGIL_ALERT_URL", "");
    let cfg = InvigilatorConfig::load_from(None).expect("load config");
    assert!(cfg.alert.url.is_empty());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for json in [
        r#"{"incident": {"window_frames": 0}}"#,
        r#"{"detection": {"confidence_threshold": 1.5}}"#,
        r#"{"detection": {"violation_labels": []}}"#,
        r#"{"alert": {"url": "ftp://dashboard/alerts"}}"#,
        r#"{"alert": {"queue_depth": 0}}"#,
        r#"{"preview": {"quality": 0}}"#,
        r#"{"control": {"mqtt_addr": "no-port"}}"#,
        r#"{"capture": {"unknown_key": 1}}"#,
    ] {
        let file = write_config(json);
        assert!(
            InvigilatorConfig::load_from(Some(file.path())).is_err(),
            "config should be rejected: {}",
            json
        );
    }

    std::env::set_var("INVIGIL_MONITORING", "sometimes");
    assert!(InvigilatorConfig::load_from(None).is_err());

    clear_env();
}
