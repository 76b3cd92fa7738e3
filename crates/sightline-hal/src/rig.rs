//! The bundle of drivers a pipeline is assembled from.

use std::sync::Arc;

use crate::battery::BatteryGauge;
use crate::ranging::RangeFinder;
use crate::resources::ResourceProbe;
use crate::speech::SpeechDevice;
use crate::vision::ObjectDetector;

/// Every hardware collaborator the orchestrator needs, already constructed.
///
/// Built either from physical drivers by the binary or from
/// [`SimRig`][crate::sim::SimRig] in tests.  The speech device is shared
/// because playback runs on a blocking worker while the arbitrator keeps a
/// handle.
pub struct HardwareSet {
    pub range_finder: Box<dyn RangeFinder>,
    pub detector: Box<dyn ObjectDetector>,
    pub speech: Arc<dyn SpeechDevice>,
    pub battery: Box<dyn BatteryGauge>,
    pub probe: Box<dyn ResourceProbe>,
}

impl std::fmt::Debug for HardwareSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSet")
            .field("range_finder", &self.range_finder.id())
            .field("detector", &self.detector.id())
            .field("speech", &self.speech.id())
            .field("battery", &self.battery.id())
            .finish_non_exhaustive()
    }
}
