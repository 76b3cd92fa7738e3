//! The `sample()` contract shared by every sensor source.

use sightline_types::{Channel, DetectionEvent, SamplingProfile};

/// A sensor that performs one blocking measurement per call.
///
/// Sources never fail: timeouts, low-confidence results and driver errors
/// all come back as an empty list.  The sampling loop wraps every call in a
/// latency scope, so a source must not add timing of its own.
pub trait SensorSource: Send {
    /// The sampling loop this source feeds.
    fn channel(&self) -> Channel;

    /// Perform one measurement under `profile` and return the resulting
    /// events in detector order.
    fn sample(&mut self, profile: &SamplingProfile) -> Vec<DetectionEvent>;
}
