//! Incident state machine.
//!
//! Consumes one `(frame, active violation)` pair per captured frame and turns
//! sustained violations into discrete incidents:
//!
//! | state     | input                       | effect                                   |
//! |-----------|-----------------------------|------------------------------------------|
//! | Idle      | violation                   | seed buffer from window + frame, record  |
//! | Idle      | none                        | nothing                                  |
//! | Recording | violation (any label)       | append frame, cooldown = 0               |
//! | Recording | none                        | append frame, cooldown += 1              |
//! | Recording | cooldown > limit or too old | emit `Incident`, back to Idle            |
//!
//! The end check runs after the append of the same frame. The label that opened
//! an incident names it until it closes; a different label mid-incident only
//! resets the cooldown.
//!
//! The machine owns the sliding window. Every observed frame is pushed into the
//! window after the transition, so an incident's pre-context is exactly the
//! window as it stood before the triggering frame.

use std::time::{Duration, Instant, SystemTime};

use crate::classify::Violation;
use crate::frame::{Frame, SlidingWindow, DEFAULT_WINDOW_FRAMES};

pub const DEFAULT_COOLDOWN_FRAMES: u32 = 30;
pub const DEFAULT_MAX_INCIDENT_SECS: u64 = 30;

/// Tunables for opening and closing incidents.
#[derive(Clone, Debug)]
pub struct IncidentPolicy {
    /// Sliding window capacity (pre-context frames).
    pub pre_context_frames: usize,
    /// An incident closes once this many consecutive clean frames are exceeded.
    pub cooldown_frames: u32,
    /// An incident closes once it has been open longer than this.
    pub max_duration: Duration,
}

impl Default for IncidentPolicy {
    fn default() -> Self {
        Self {
            pre_context_frames: DEFAULT_WINDOW_FRAMES,
            cooldown_frames: DEFAULT_COOLDOWN_FRAMES,
            max_duration: Duration::from_secs(DEFAULT_MAX_INCIDENT_SECS),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    /// No violation for more than the cooldown limit.
    Cooldown,
    /// Open longer than the duration cap.
    MaxDuration,
    /// Closed by the caller (shutdown).
    Flushed,
}

/// A closed incident, ready for clip assembly and alerting.
#[derive(Debug)]
pub struct Incident {
    pub label: String,
    /// Highest violation confidence seen while the incident was open.
    pub confidence: f32,
    pub started_at: Instant,
    pub ended_at: Instant,
    /// Wall-clock start, used to name the evidence clip.
    pub started_wall: SystemTime,
    /// Number of leading frames that came from the sliding window.
    pub pre_context: usize,
    pub frames: Vec<Frame>,
    pub end_reason: EndReason,
}

impl Incident {
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }

    /// Frames observed from the trigger to the close, inclusive.
    pub fn observed_frames(&self) -> usize {
        self.frames.len() - self.pre_context
    }
}

/// State of an open incident.
#[derive(Debug)]
pub struct Recording {
    pub label: String,
    pub started_at: Instant,
    pub started_wall: SystemTime,
    pub frames: Vec<Frame>,
    pub cooldown: u32,
    pub peak_confidence: f32,
    pub pre_context: usize,
}

#[derive(Debug, Default)]
pub enum IncidentState {
    #[default]
    Idle,
    Recording(Recording),
}

/// Explicit, owned incident tracker. One per camera feed.
#[derive(Debug)]
pub struct IncidentStateMachine {
    policy: IncidentPolicy,
    window: SlidingWindow,
    state: IncidentState,
}

impl IncidentStateMachine {
    pub fn new(policy: IncidentPolicy) -> Self {
        Self {
            window: SlidingWindow::new(policy.pre_context_frames),
            policy,
            state: IncidentState::Idle,
        }
    }

    pub fn policy(&self) -> &IncidentPolicy {
        &self.policy
    }

    pub fn state(&self) -> &IncidentState {
        &self.state
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, IncidentState::Recording(_))
    }

    /// Label of the open incident, if any.
    pub fn current_label(&self) -> Option<&str> {
        match &self.state {
            IncidentState::Recording(rec) => Some(rec.label.as_str()),
            IncidentState::Idle => None,
        }
    }

    /// Advance the machine by one frame.
    ///
    /// Returns the incident that closed on this frame, if any.
    pub fn observe(
        &mut self,
        frame: Frame,
        violation: Option<&Violation>,
        now: Instant,
    ) -> Option<Incident> {
        let mut closed = None;

        match &mut self.state {
            IncidentState::Idle => {
                if let Some(violation) = violation {
                    let mut frames = self.window.snapshot();
                    let pre_context = frames.len();
                    frames.push(frame.clone());
                    log::info!(
                        "violation started: {} (conf {:.2}, {} pre-context frames)",
                        violation.label,
                        violation.confidence,
                        pre_context
                    );
                    self.state = IncidentState::Recording(Recording {
                        label: violation.label.clone(),
                        started_at: now,
                        started_wall: SystemTime::now(),
                        frames,
                        cooldown: 0,
                        peak_confidence: violation.confidence,
                        pre_context,
                    });
                }
            }
            IncidentState::Recording(rec) => {
                rec.frames.push(frame.clone());
                match violation {
                    Some(violation) => {
                        rec.cooldown = 0;
                        rec.peak_confidence = rec.peak_confidence.max(violation.confidence);
                    }
                    None => rec.cooldown += 1,
                }

                let end_reason = if rec.cooldown > self.policy.cooldown_frames {
                    Some(EndReason::Cooldown)
                } else if now.saturating_duration_since(rec.started_at) > self.policy.max_duration
                {
                    Some(EndReason::MaxDuration)
                } else {
                    None
                };

                if let Some(reason) = end_reason {
                    closed = self.close(reason, now);
                }
            }
        }

        self.window.push(frame);
        closed
    }

    /// Close any open incident immediately.
    pub fn flush(&mut self, now: Instant) -> Option<Incident> {
        self.close(EndReason::Flushed, now)
    }

    fn close(&mut self, end_reason: EndReason, now: Instant) -> Option<Incident> {
        let IncidentState::Recording(rec) = std::mem::take(&mut self.state) else {
            return None;
        };
        let incident = Incident {
            label: rec.label,
            confidence: rec.peak_confidence,
            started_at: rec.started_at,
            ended_at: now,
            started_wall: rec.started_wall,
            pre_context: rec.pre_context,
            frames: rec.frames,
            end_reason,
        };
        log::info!(
            "violation ended: {} ({:?}, {} frames, {:.1}s)",
            incident.label,
            incident.end_reason,
            incident.frames.len(),
            incident.duration().as_secs_f32()
        );
        Some(incident)
    }
}

impl Default for IncidentStateMachine {
    fn default() -> Self {
        Self::new(IncidentPolicy::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
