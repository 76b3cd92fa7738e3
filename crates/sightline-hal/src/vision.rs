//! Frame-based detection: the [`ObjectDetector`] driver trait and the
//! [`VisionSource`] that turns raw detections into object and sign events.
//!
//! Model loading, camera configuration and the inference algorithm itself
//! live behind the driver; this module only filters and classifies.

use sightline_types::{BoundingBox, Channel, DetectionEvent, DetectionKind, SamplingProfile, SightError};
use tracing::{debug, warn};

use crate::source::SensorSource;

/// Labels reported as road signs rather than plain objects.
pub const SIGN_LABELS: [&str; 2] = ["stop sign", "traffic light"];

/// Detector quality hint derived from the sampling profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionQuality {
    Full,
    /// Cheaper inference (lower resolution, fewer passes) while saving power.
    Reduced,
}

impl DetectionQuality {
    pub fn for_profile(profile: &SamplingProfile) -> Self {
        if profile.reduced_processing {
            DetectionQuality::Reduced
        } else {
            DetectionQuality::Full
        }
    }
}

/// One labelled box straight from the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }
}

/// A camera plus detector: one call captures a frame and runs inference.
pub trait ObjectDetector: Send {
    /// Stable identifier, e.g. `"hat_camera"`.
    fn id(&self) -> &str;

    /// Capture one frame and return every detection in it.
    ///
    /// # Errors
    ///
    /// Returns [`SightError::HardwareFault`] when no frame could be captured.
    fn detect(&mut self, quality: DetectionQuality) -> Result<Vec<RawDetection>, SightError>;
}

/// Wraps an [`ObjectDetector`], drops low-confidence boxes and tags signs.
pub struct VisionSource {
    detector: Box<dyn ObjectDetector>,
    confidence_threshold: f32,
}

impl VisionSource {
    pub fn new(detector: Box<dyn ObjectDetector>, confidence_threshold: f32) -> Self {
        Self {
            detector,
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
        }
    }

    fn classify(label: &str) -> DetectionKind {
        if SIGN_LABELS.contains(&label) {
            DetectionKind::Sign
        } else {
            DetectionKind::Object
        }
    }
}

impl SensorSource for VisionSource {
    fn channel(&self) -> Channel {
        Channel::Vision
    }

    fn sample(&mut self, profile: &SamplingProfile) -> Vec<DetectionEvent> {
        let quality = DetectionQuality::for_profile(profile);
        let raw = match self.detector.detect(quality) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(detector = self.detector.id(), error = %e, "frame capture failed");
                return Vec::new();
            }
        };

        let total = raw.len();
        let events: Vec<DetectionEvent> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .map(|d| {
                let kind = Self::classify(&d.label);
                DetectionEvent::visual(kind, d.label, d.confidence, d.bbox)
            })
            .collect();
        if total > events.len() {
            debug!(
                detector = self.detector.id(),
                dropped = total - events.len(),
                "discarded low-confidence detections"
            );
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedDetector {
        frame: Vec<RawDetection>,
        fail: bool,
    }

    impl ObjectDetector for FixedDetector {
        fn id(&self) -> &str {
            "fixed"
        }

        fn detect(&mut self, _quality: DetectionQuality) -> Result<Vec<RawDetection>, SightError> {
            if self.fail {
                return Err(SightError::hardware("fixed", "camera unplugged"));
            }
            Ok(self.frame.clone())
        }
    }

    fn bbox() -> BoundingBox {
        BoundingBox::new(0.0, 0.0, 40.0, 80.0)
    }

    fn profile(reduced: bool) -> SamplingProfile {
        SamplingProfile {
            interval: Duration::from_millis(200),
            frame_skip: 1,
            reduced_processing: reduced,
        }
    }

    #[test]
    fn signs_and_objects_are_classified_in_order() {
        let detector = FixedDetector {
            frame: vec![
                RawDetection::new("person", 0.9, bbox()),
                RawDetection::new("stop sign", 0.8, bbox()),
                RawDetection::new("bench", 0.6, bbox()),
            ],
            fail: false,
        };
        let mut src = VisionSource::new(Box::new(detector), 0.5);
        let events = src.sample(&profile(false));
        let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.label.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (DetectionKind::Object, "person"),
                (DetectionKind::Sign, "stop sign"),
                (DetectionKind::Object, "bench"),
            ]
        );
        assert!(events.iter().all(|e| e.bbox.is_some() && e.distance_cm.is_none()));
    }

    #[test]
    fn low_confidence_is_dropped() {
        let detector = FixedDetector {
            frame: vec![
                RawDetection::new("car", 0.49, bbox()),
                RawDetection::new("traffic light", 0.5, bbox()),
            ],
            fail: false,
        };
        let mut src = VisionSource::new(Box::new(detector), 0.5);
        let events = src.sample(&profile(false));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DetectionKind::Sign);
    }

    #[test]
    fn capture_failure_yields_empty_frame() {
        let detector = FixedDetector {
            frame: vec![RawDetection::new("car", 0.9, bbox())],
            fail: true,
        };
        let mut src = VisionSource::new(Box::new(detector), 0.5);
        assert!(src.sample(&profile(false)).is_empty());
    }

    #[test]
    fn reduced_profile_maps_to_reduced_quality() {
        assert_eq!(DetectionQuality::for_profile(&profile(true)), DetectionQuality::Reduced);
        assert_eq!(DetectionQuality::for_profile(&profile(false)), DetectionQuality::Full);
    }
}
