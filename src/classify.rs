//! Detection-to-violation policy.
//!
//! The classifier answers one question per frame: is something violating right
//! now, and under which label. It surfaces a single label even when several
//! violations co-occur; the first match in detection order wins. Distinct
//! simultaneous violations are not tracked separately.

use std::collections::HashSet;

use crate::detect::{Detection, LOOKING_LEFT, LOOKING_RIGHT};

/// Labels treated as violations when none are configured.
pub const DEFAULT_VIOLATION_LABELS: &[&str] = &[
    "Using Phone",
    "Giving object",
    "Giving signal",
    "Looking Friend",
    LOOKING_LEFT,
    LOOKING_RIGHT,
];

/// The active violation on one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub label: String,
    pub confidence: f32,
}

/// Label-membership classifier.
#[derive(Clone, Debug)]
pub struct ViolationClassifier {
    labels: HashSet<String>,
}

impl ViolationClassifier {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_violation(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// First detection whose label is in the violation set, if any.
    pub fn classify(&self, detections: &[Detection]) -> Option<Violation> {
        detections
            .iter()
            .find(|d| self.is_violation(&d.label))
            .map(|d| Violation {
                label: d.label.clone(),
                confidence: d.confidence,
            })
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl Default for ViolationClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_VIOLATION_LABELS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_detections_are_not_a_violation() {
        assert_eq!(ViolationClassifier::default().classify(&[]), None);
    }

    #[test]
    fn non_violation_labels_are_ignored() {
        let classifier = ViolationClassifier::default();
        let detections = vec![
            Detection::object("Normal", 0.99, None),
            Detection::object("Moving", 0.8, None),
        ];
        assert_eq!(classifier.classify(&detections), None);
    }

    #[test]
    fn first_matching_label_wins() {
        let classifier = ViolationClassifier::default();
        let detections = vec![
            Detection::object("Normal", 0.99, None),
            Detection::object("Giving signal", 0.61, None),
            Detection::object("Using Phone", 0.95, None),
            Detection::pose(LOOKING_LEFT),
        ];
        assert_eq!(
            classifier.classify(&detections),
            Some(Violation {
                label: "Giving signal".to_string(),
                confidence: 0.61,
            })
        );
    }

    #[test]
    fn custom_label_set_replaces_defaults() {
        let classifier = ViolationClassifier::new(["Moving"]);
        assert!(classifier.is_violation("Moving"));
        assert!(!classifier.is_violation("Using Phone"));
        let hit = classifier.classify(&[Detection::object("Moving", 0.7, None)]);
        assert_eq!(hit.map(|v| v.label), Some("Moving".to_string()));
    }

    #[test]
    fn gaze_labels_are_violations_by_default() {
        let classifier = ViolationClassifier::default();
        let hit = classifier.classify(&[Detection::pose(LOOKING_RIGHT)]);
        assert_eq!(hit.map(|v| v.confidence), Some(1.0));
    }
}
