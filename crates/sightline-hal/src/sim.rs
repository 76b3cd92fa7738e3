//! In-process simulated drivers for running the whole pipeline headless.
//!
//! [`SimRig`] builds a [`HardwareSet`] out of scripted stand-ins so the
//! orchestrator, its loops and the speech arbitrator can be exercised in
//! tests and CI without sensors, a camera, a speaker or a battery.
//!
//! # Example
//!
//! ```rust
//! use sightline_hal::sim::SimRig;
//!
//! let hw = SimRig::new()
//!     .with_obstacle_readings(vec![Some(42.0), None])
//!     .with_battery_level(80.0)
//!     .build();
//! assert_eq!(hw.range_finder.id(), "sim_ranging");
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use sightline_types::SightError;
use tokio_util::sync::CancellationToken;

use crate::battery::{BatteryGauge, BatteryReading};
use crate::ranging::RangeFinder;
use crate::resources::{ResourceProbe, ResourceUsage};
use crate::rig::HardwareSet;
use crate::speech::{INTERRUPT_POLL, SpeechDevice, SpeechOutcome};
use crate::vision::{DetectionQuality, ObjectDetector, RawDetection};

// ────────────────────────────────────────────────────────────────────────────
// Ranging
// ────────────────────────────────────────────────────────────────────────────

/// Replays a fixed list of readings, cycling back to the start.
/// `None` entries model echo timeouts.
pub struct SimRangeFinder {
    readings: Vec<Option<f32>>,
    cursor: usize,
    delay: Duration,
}

impl SimRangeFinder {
    pub fn new(readings: Vec<Option<f32>>) -> Self {
        Self {
            readings,
            cursor: 0,
            delay: Duration::ZERO,
        }
    }

    /// Never sees anything.
    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    /// Block for `delay` on every measurement.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl RangeFinder for SimRangeFinder {
    fn id(&self) -> &str {
        "sim_ranging"
    }

    fn measure(&mut self) -> Result<Option<f32>, SightError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.readings.is_empty() {
            return Ok(None);
        }
        let reading = self.readings[self.cursor % self.readings.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Ok(reading)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Vision
// ────────────────────────────────────────────────────────────────────────────

/// Replays a fixed list of frames, cycling back to the start.
pub struct SimDetector {
    frames: Vec<Vec<RawDetection>>,
    cursor: usize,
    delay: Duration,
}

impl SimDetector {
    pub fn new(frames: Vec<Vec<RawDetection>>) -> Self {
        Self {
            frames,
            cursor: 0,
            delay: Duration::ZERO,
        }
    }

    /// Every frame is empty.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Block for `delay` on every frame, modelling inference time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ObjectDetector for SimDetector {
    fn id(&self) -> &str {
        "sim_camera"
    }

    fn detect(&mut self, _quality: DetectionQuality) -> Result<Vec<RawDetection>, SightError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.frames.is_empty() {
            return Ok(Vec::new());
        }
        let frame = self.frames[self.cursor % self.frames.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(frame)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Speech
// ────────────────────────────────────────────────────────────────────────────

/// One finished call to [`SimSpeechDevice::speak`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpokenLine {
    pub text: String,
    pub outcome: SpeechOutcome,
}

#[derive(Debug, Default)]
struct SpeechLog {
    started: Vec<String>,
    finished: Vec<SpokenLine>,
    failures_pending: usize,
}

/// A speaker that "plays" each utterance for `per_char` × its length.
///
/// It records what was started and how each utterance ended, and tracks the
/// highest number of overlapping playbacks ever observed so tests can assert
/// that only one utterance is audible at a time.
pub struct SimSpeechDevice {
    per_char: Duration,
    log: Mutex<SpeechLog>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SimSpeechDevice {
    pub fn new(per_char: Duration) -> Self {
        Self {
            per_char,
            log: Mutex::new(SpeechLog::default()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Completes every utterance immediately.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Make the next `count` calls fail with [`SightError::SpeechDevice`].
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_pending += count;
    }

    /// Texts whose playback actually began, in order.
    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// Every utterance that reached an outcome, in order.
    pub fn transcript(&self) -> Vec<SpokenLine> {
        self.lock().finished.clone()
    }

    /// Texts that played to completion, in order.
    pub fn completed(&self) -> Vec<String> {
        self.lock()
            .finished
            .iter()
            .filter(|l| l.outcome == SpeechOutcome::Completed)
            .map(|l| l.text.clone())
            .collect()
    }

    /// Highest number of simultaneous playbacks seen so far.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeechLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpeechDevice for SimSpeechDevice {
    fn id(&self) -> &str {
        "sim_speaker"
    }

    fn speak(&self, text: &str, interrupt: &CancellationToken) -> Result<SpeechOutcome, SightError> {
        if interrupt.is_cancelled() {
            return Ok(SpeechOutcome::Interrupted);
        }
        {
            let mut log = self.lock();
            if log.failures_pending > 0 {
                log.failures_pending -= 1;
                return Err(SightError::SpeechDevice(format!("simulated failure on '{text}'")));
            }
            log.started.push(text.to_string());
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let length = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        let duration = self.per_char.saturating_mul(length);
        let started = Instant::now();
        let outcome = loop {
            if interrupt.is_cancelled() {
                break SpeechOutcome::Interrupted;
            }
            let elapsed = started.elapsed();
            if elapsed >= duration {
                break SpeechOutcome::Completed;
            }
            thread::sleep(INTERRUPT_POLL.min(duration - elapsed));
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.lock().finished.push(SpokenLine {
            text: text.to_string(),
            outcome,
        });
        Ok(outcome)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Battery
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BatteryCell {
    level: f32,
    charging: bool,
    drain_per_read: f32,
}

/// A battery that drains a little on every read and gains while charging.
///
/// Clones share the same cell, so a test can keep one clone to move the
/// level while the pipeline owns another.
#[derive(Debug, Clone)]
pub struct SimBatteryGauge {
    cell: Arc<Mutex<BatteryCell>>,
}

/// Percent gained per read while charging.
pub const SIM_CHARGE_PER_READ: f32 = 0.5;

impl SimBatteryGauge {
    /// Starts at `level` percent and drains 0.1 % per read.
    pub fn new(level: f32) -> Self {
        Self {
            cell: Arc::new(Mutex::new(BatteryCell {
                level: level.clamp(0.0, 100.0),
                charging: false,
                drain_per_read: 0.1,
            })),
        }
    }

    pub fn with_drain(self, drain_per_read: f32) -> Self {
        self.lock().drain_per_read = drain_per_read.max(0.0);
        self
    }

    pub fn set_level(&self, level: f32) {
        self.lock().level = level.clamp(0.0, 100.0);
    }

    pub fn level(&self) -> f32 {
        self.lock().level
    }

    pub fn set_charging(&self, charging: bool) {
        self.lock().charging = charging;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatteryCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BatteryGauge for SimBatteryGauge {
    fn id(&self) -> &str {
        "sim_battery"
    }

    /// Reports the current level, then applies drain or charge.
    fn read(&mut self) -> Result<BatteryReading, SightError> {
        let mut cell = self.lock();
        let reading = BatteryReading {
            percent: cell.level,
            charging: cell.charging,
        };
        let delta = if cell.charging {
            SIM_CHARGE_PER_READ
        } else {
            -cell.drain_per_read
        };
        cell.level = (cell.level + delta).clamp(0.0, 100.0);
        Ok(reading)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Resources
// ────────────────────────────────────────────────────────────────────────────

/// Reports whatever usage was last set.  Clones share the value.
#[derive(Debug, Clone, Default)]
pub struct SimResourceProbe {
    usage: Arc<Mutex<ResourceUsage>>,
}

impl SimResourceProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Arc::new(Mutex::new(usage)),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner) = usage;
    }
}

impl ResourceProbe for SimResourceProbe {
    fn sample(&mut self) -> Result<ResourceUsage, SightError> {
        Ok(*self.usage.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRig builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for a [`HardwareSet`] made entirely of simulated drivers.
///
/// Unset slots get quiet defaults: a ranging sensor that never sees
/// anything, a camera with empty frames, an instant speaker, a full battery
/// and an idle host.
#[derive(Default)]
pub struct SimRig {
    range_finder: Option<Box<dyn RangeFinder>>,
    detector: Option<Box<dyn ObjectDetector>>,
    speech: Option<Arc<dyn SpeechDevice>>,
    battery: Option<Box<dyn BatteryGauge>>,
    probe: Option<Box<dyn ResourceProbe>>,
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a [`SimRangeFinder`] that replays `readings`.
    pub fn with_obstacle_readings(mut self, readings: Vec<Option<f32>>) -> Self {
        self.range_finder = Some(Box::new(SimRangeFinder::new(readings)));
        self
    }

    pub fn with_range_finder(mut self, finder: Box<dyn RangeFinder>) -> Self {
        self.range_finder = Some(finder);
        self
    }

    /// Use a [`SimDetector`] that replays `frames`.
    pub fn with_frames(mut self, frames: Vec<Vec<RawDetection>>) -> Self {
        self.detector = Some(Box::new(SimDetector::new(frames)));
        self
    }

    pub fn with_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Install a speaker.  Pass an `Arc<SimSpeechDevice>` clone to keep a
    /// handle for assertions.
    pub fn with_speech(mut self, speech: Arc<dyn SpeechDevice>) -> Self {
        self.speech = Some(speech);
        self
    }

    /// Use a non-draining [`SimBatteryGauge`] fixed at `level`.
    pub fn with_battery_level(mut self, level: f32) -> Self {
        self.battery = Some(Box::new(SimBatteryGauge::new(level).with_drain(0.0)));
        self
    }

    pub fn with_battery(mut self, battery: Box<dyn BatteryGauge>) -> Self {
        self.battery = Some(battery);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> HardwareSet {
        HardwareSet {
            range_finder: self
                .range_finder
                .unwrap_or_else(|| Box::new(SimRangeFinder::silent())),
            detector: self.detector.unwrap_or_else(|| Box::new(SimDetector::empty())),
            speech: self
                .speech
                .unwrap_or_else(|| Arc::new(SimSpeechDevice::instant())),
            battery: self
                .battery
                .unwrap_or_else(|| Box::new(SimBatteryGauge::new(100.0).with_drain(0.0))),
            probe: self
                .probe
                .unwrap_or_else(|| Box::new(SimResourceProbe::default())),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
