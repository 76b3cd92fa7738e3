//! Ultrasonic ranging: the [`RangeFinder`] driver trait and the
//! [`RangingSource`] that turns echoes into obstacle events.

use sightline_types::{Channel, DetectionEvent, SamplingProfile, SightError};
use tracing::{trace, warn};

use crate::source::SensorSource;

/// A single-shot distance sensor (e.g. an HC-SR04 on the belt).
pub trait RangeFinder: Send {
    /// Stable identifier for this sensor, e.g. `"belt_ultrasonic"`.
    fn id(&self) -> &str;

    /// Trigger one ping and return the measured distance in centimetres.
    ///
    /// `Ok(None)` means the echo timed out, which is a normal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SightError::HardwareFault`] when the sensor cannot be driven.
    fn measure(&mut self) -> Result<Option<f32>, SightError>;
}

/// Valid measuring window and alert distance for a [`RangingSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangingLimits {
    pub min_distance_cm: f32,
    pub max_distance_cm: f32,
    /// Obstacles at or closer than this are reported.
    pub warning_distance_cm: f32,
}

impl Default for RangingLimits {
    fn default() -> Self {
        Self {
            min_distance_cm: 2.0,
            max_distance_cm: 400.0,
            warning_distance_cm: 100.0,
        }
    }
}

/// Wraps a [`RangeFinder`] and emits at most one obstacle event per sample.
pub struct RangingSource {
    finder: Box<dyn RangeFinder>,
    limits: RangingLimits,
}

impl RangingSource {
    pub fn new(finder: Box<dyn RangeFinder>, limits: RangingLimits) -> Self {
        Self { finder, limits }
    }

    pub fn limits(&self) -> RangingLimits {
        self.limits
    }

    /// Take one measurement and return an obstacle if one is close enough.
    pub fn sample_once(&mut self) -> Option<DetectionEvent> {
        let distance = match self.finder.measure() {
            Ok(Some(d)) => d,
            Ok(None) => {
                trace!(sensor = self.finder.id(), "echo timeout");
                return None;
            }
            Err(e) => {
                warn!(sensor = self.finder.id(), error = %e, "range measurement failed");
                return None;
            }
        };

        let RangingLimits {
            min_distance_cm,
            max_distance_cm,
            warning_distance_cm,
        } = self.limits;
        if !distance.is_finite() || distance < min_distance_cm || distance > max_distance_cm {
            trace!(sensor = self.finder.id(), distance, "reading outside valid window");
            return None;
        }
        (distance <= warning_distance_cm).then(|| DetectionEvent::obstacle(distance))
    }
}

impl SensorSource for RangingSource {
    fn channel(&self) -> Channel {
        Channel::Ranging
    }

    fn sample(&mut self, _profile: &SamplingProfile) -> Vec<DetectionEvent> {
        self.sample_once().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_types::DetectionKind;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedFinder {
        readings: VecDeque<Result<Option<f32>, SightError>>,
    }

    impl RangeFinder for ScriptedFinder {
        fn id(&self) -> &str {
            "scripted"
        }

        fn measure(&mut self) -> Result<Option<f32>, SightError> {
            self.readings.pop_front().unwrap_or(Ok(None))
        }
    }

    fn source(readings: Vec<Result<Option<f32>, SightError>>) -> RangingSource {
        RangingSource::new(
            Box::new(ScriptedFinder {
                readings: readings.into(),
            }),
            RangingLimits::default(),
        )
    }

    fn profile() -> SamplingProfile {
        SamplingProfile {
            interval: Duration::from_millis(100),
            frame_skip: 1,
            reduced_processing: false,
        }
    }

    #[test]
    fn close_reading_becomes_obstacle() {
        let mut src = source(vec![Ok(Some(42.0))]);
        let events = src.sample(&profile());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DetectionKind::Obstacle);
        assert_eq!(events[0].distance_cm, Some(42.0));
    }

    #[test]
    fn warning_distance_is_inclusive() {
        let mut src = source(vec![Ok(Some(100.0)), Ok(Some(100.5))]);
        assert!(src.sample_once().is_some());
        assert!(src.sample_once().is_none());
    }

    #[test]
    fn timeout_and_out_of_range_yield_nothing() {
        let mut src = source(vec![Ok(None), Ok(Some(1.0)), Ok(Some(450.0)), Ok(Some(f32::NAN))]);
        for _ in 0..4 {
            assert!(src.sample(&profile()).is_empty());
        }
    }

    #[test]
    fn driver_error_is_a_miss_not_a_failure() {
        let mut src = source(vec![
            Err(SightError::hardware("scripted", "echo pin stuck")),
            Ok(Some(30.0)),
        ]);
        assert!(src.sample_once().is_none());
        assert!(src.sample_once().is_some());
    }

    #[test]
    fn reports_ranging_channel() {
        assert_eq!(source(vec![]).channel(), Channel::Ranging);
    }
}
