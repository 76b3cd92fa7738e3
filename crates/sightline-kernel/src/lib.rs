//! `sightline-kernel` – regulation and bookkeeping.
//!
//! Nothing in here samples a sensor or speaks a word.  These components
//! watch the pipeline and tell it how to behave.
//!
//! # Modules
//!
//! - [`performance`] – [`PerformanceTracker`][performance::PerformanceTracker]:
//!   concurrent latency rings, accuracy counters, resource-pressure checks
//!   and report snapshots.
//! - [`power`] – [`PowerController`][power::PowerController]: maps battery
//!   level to a tier and a sampling profile, with a hysteresis band around
//!   power-save and a one-shot shutdown request on entering the critical
//!   tier.

pub mod performance;
pub mod power;

pub use performance::{
    AccuracyStats, LatencyBreach, LatencyScope, OperationStats, PerformanceReport, PerformanceTracker,
    Resource, ResourcePressure, TrackerConfig,
};
pub use power::{BatteryCapacity, PowerController, PowerProfiles, PowerState, PowerThresholds, PowerTransition};
