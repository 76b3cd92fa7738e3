//! `sightline-hal` – Hardware Abstraction Layer.
//!
//! The rest of the workspace only ever talks to the traits defined here, so
//! physical drivers and simulated stand-ins can be swapped at construction
//! time without touching the sampling loops.
//!
//! # Modules
//!
//! - [`ranging`] – [`RangeFinder`][ranging::RangeFinder] driver trait and the
//!   [`RangingSource`][ranging::RangingSource] that turns raw echoes into
//!   obstacle events.
//! - [`vision`] – [`ObjectDetector`][vision::ObjectDetector] driver trait and
//!   the [`VisionSource`][vision::VisionSource] that classifies detections
//!   into objects and signs.
//! - [`source`] – [`SensorSource`][source::SensorSource]: the one-call
//!   `sample()` contract both sources implement.
//! - [`speech`] – [`SpeechDevice`][speech::SpeechDevice]: blocking,
//!   interruptible text-to-speech output.
//! - [`battery`] – [`BatteryGauge`][battery::BatteryGauge] and the sysfs
//!   reader.
//! - [`resources`] – [`ResourceProbe`][resources::ResourceProbe] and the
//!   procfs reader.
//! - [`rig`] – [`HardwareSet`][rig::HardwareSet]: the bundle of drivers a
//!   pipeline is built from.
//! - [`sim`] – simulated drivers and the [`SimRig`][sim::SimRig] builder for
//!   headless tests.

pub mod battery;
pub mod ranging;
pub mod resources;
pub mod rig;
pub mod sim;
pub mod source;
pub mod speech;
pub mod vision;

pub use battery::{BatteryGauge, BatteryReading, SysfsBatteryGauge};
pub use ranging::{RangeFinder, RangingSource, RangingLimits};
pub use resources::{ProcfsResourceProbe, ResourceProbe, ResourceUsage};
pub use rig::HardwareSet;
pub use source::SensorSource;
pub use speech::{CommandSpeechDevice, SpeechDevice, SpeechOutcome};
pub use vision::{DetectionQuality, ObjectDetector, RawDetection, VisionSource};
