//! Alert dispatch.
//!
//! Completed incidents are reported to an external endpoint without blocking the
//! frame loop. `AlertDispatcher` owns a single worker thread fed by a bounded
//! queue; a full queue drops the alert instead of waiting. Delivery failures are
//! logged and swallowed. There is no retry and no durable queue: an alert lost
//! to a network error or a full queue is gone.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_ALERT_URL: &str = "http://localhost:5000/api/alerts";
pub const DEFAULT_ALERT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_ALERT_QUEUE_DEPTH: usize = 8;
pub const DEFAULT_SUBJECT_ID: &str = "Student_1";

/// JSON body posted to the alert endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub student_id: String,
    pub violation_type: String,
    pub confidence: f32,
    /// Evidence clip name, empty when no clip could be saved.
    pub evidence_path: String,
}

/// Delivery mechanism for alerts. Runs on the dispatcher's worker thread.
pub trait AlertTransport: Send + 'static {
    fn deliver(&self, payload: &AlertPayload) -> Result<()>;
}

impl AlertTransport for Box<dyn AlertTransport> {
    fn deliver(&self, payload: &AlertPayload) -> Result<()> {
        (**self).deliver(payload)
    }
}

/// HTTP POST transport with a per-request timeout.
pub struct HttpAlertTransport {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpAlertTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: endpoint.into(),
        }
    }
}

impl AlertTransport for HttpAlertTransport {
    fn deliver(&self, payload: &AlertPayload) -> Result<()> {
        let body = serde_json::to_string(payload).context("serialize alert payload")?;
        self.agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| anyhow!("POST {} failed: {}", self.endpoint, e))?;
        Ok(())
    }
}

/// Transport that only logs. Used when no endpoint is configured and by the demo.
pub struct LoggingTransport;

impl AlertTransport for LoggingTransport {
    fn deliver(&self, payload: &AlertPayload) -> Result<()> {
        log::info!(
            "alert: {}",
            serde_json::to_string(payload).context("serialize alert payload")?
        );
        Ok(())
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub queued: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

/// Fire-and-forget alert queue with one worker thread.
pub struct AlertDispatcher {
    tx: Option<SyncSender<AlertPayload>>,
    worker: Option<JoinHandle<()>>,
    subject_id: String,
    stats: Arc<DispatchStats>,
}

impl AlertDispatcher {
    pub fn spawn<T: AlertTransport>(
        transport: T,
        subject_id: impl Into<String>,
        queue_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<AlertPayload>(queue_depth.max(1));
        let stats = Arc::new(DispatchStats::default());
        let worker_stats = stats.clone();
        let worker = std::thread::Builder::new()
            .name("alert-dispatch".to_string())
            .spawn(move || {
                for payload in rx {
                    match transport.deliver(&payload) {
                        Ok(()) => {
                            worker_stats.delivered.fetch_add(1, Ordering::Relaxed);
                            log::info!(
                                "alert delivered: {} evidence={}",
                                payload.violation_type,
                                payload.evidence_path
                            );
                        }
                        Err(e) => {
                            worker_stats.failed.fetch_add(1, Ordering::Relaxed);
                            log::warn!("failed to deliver alert: {:#}", e);
                        }
                    }
                }
            })
            .context("spawn alert dispatch thread")?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            subject_id: subject_id.into(),
            stats,
        })
    }

    /// Queue an alert. Never blocks.
    ///
    /// Returns `false` when the alert was dropped (queue full or worker gone).
    pub fn dispatch(&self, label: &str, confidence: f32, evidence: Option<&str>) -> bool {
        let payload = AlertPayload {
            student_id: self.subject_id.clone(),
            violation_type: label.to_string(),
            confidence,
            evidence_path: evidence.unwrap_or_default().to_string(),
        };
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(payload)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "alert queue full, dropping alert for {}",
                    payload.violation_type
                );
                false
            }
            Err(TrySendError::Disconnected(payload)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "alert worker stopped, dropping alert for {}",
                    payload.violation_type
                );
                false
            }
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Close the queue and wait for queued alerts to be attempted.
    pub fn shutdown(mut self) -> Result<()> {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("alert dispatch thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        // Closing the queue lets the worker exit; in-flight deliveries are not awaited.
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Barrier, Mutex};

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

    struct FailingTransport;

    impl AlertTransport for FailingTransport {
        fn deliver(&self, _payload: &AlertPayload) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    struct GatedTransport {
        entered: mpsc::Sender<()>,
        gate: Arc<Barrier>,
    }

    impl AlertTransport for GatedTransport {
        fn deliver(&self, _payload: &AlertPayload) -> Result<()> {
            let _ = self.entered.send(());
            self.gate.wait();
            Ok(())
        }
    }

    #[test]
    fn payload_uses_dashboard_field_names() -> Result<()> {
        let payload = AlertPayload {
            student_id: "Student_1".into(),
            violation_type: "Using Phone".into(),
            confidence: 0.5,
            evidence_path: "Using_Phone_1.gif".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&payload)?;
        assert_eq!(json["studentId"], "Student_1");
        assert_eq!(json["violationType"], "Using Phone");
        assert_eq!(json["confidence"], 0.5);
        assert_eq!(json["evidencePath"], "Using_Phone_1.gif");
        Ok(())
    }

    #[test]
    fn dispatch_delivers_through_transport() -> Result<()> {
        let transport = RecordingTransport::default();
        let seen = transport.seen.clone();
        let dispatcher = AlertDispatcher::spawn(transport, "Student_7", 4)?;

        assert!(dispatcher.dispatch("Using Phone", 0.9, Some("clip.gif")));
        assert!(dispatcher.dispatch("Giving object", 0.7, None));
        dispatcher.shutdown()?;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].student_id, "Student_7");
        assert_eq!(seen[0].evidence_path, "clip.gif");
        assert_eq!(seen[1].violation_type, "Giving object");
        assert_eq!(seen[1].evidence_path, "");
        Ok(())
    }

    #[test]
    fn delivery_failures_are_counted_not_raised() -> Result<()> {
        let dispatcher = AlertDispatcher::spawn(FailingTransport, "Student_1", 2)?;
        assert!(dispatcher.dispatch("Using Phone", 0.9, None));
        let stats = Arc::clone(&dispatcher.stats);
        dispatcher.shutdown()?;
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() -> Result<()> {
        let gate = Arc::new(Barrier::new(2));
        let (entered_tx, entered_rx) = mpsc::channel();
        let dispatcher = AlertDispatcher::spawn(
            GatedTransport {
                entered: entered_tx,
                gate: gate.clone(),
            },
            "Student_1",
            1,
        )?;

        // First alert is taken off the queue by the worker, which then blocks.
        assert!(dispatcher.dispatch("a", 1.0, None));
        entered_rx.recv()?;
        // Second fills the single queue slot; third must be dropped.
        assert!(dispatcher.dispatch("b", 1.0, None));
        assert!(!dispatcher.dispatch("c", 1.0, None));
        assert_eq!(dispatcher.stats().dropped.load(Ordering::Relaxed), 1);

        gate.wait();
        entered_rx.recv()?;
        gate.wait();
        dispatcher.shutdown()?;
        Ok(())
    }
}
