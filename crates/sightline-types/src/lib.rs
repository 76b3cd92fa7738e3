//! `sightline-types` – shared data model for the sightline workspace.
//!
//! Everything that crosses a crate boundary lives here: sensor observations,
//! spoken announcements, sampling profiles, latency samples, the bus event
//! envelope and the workspace-wide [`SightError`].

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Channels and operations
// ────────────────────────────────────────────────────────────────────────────

/// One of the two independent sampling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Short-range ultrasonic ranging worn on the belt.
    Ranging,
    /// Frame-based object and sign detection from the head-mounted camera.
    Vision,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Ranging, Channel::Vision];

    /// Human-facing name used in spoken toggle confirmations.
    pub fn spoken_name(self) -> &'static str {
        match self {
            Channel::Ranging => "Obstacle sensor",
            Channel::Vision => "Camera",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Ranging => write!(f, "ranging"),
            Channel::Vision => write!(f, "vision"),
        }
    }
}

impl FromStr for Channel {
    type Err = SightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ranging" | "belt" | "ultrasonic" => Ok(Channel::Ranging),
            "vision" | "hat" | "camera" => Ok(Channel::Vision),
            other => Err(SightError::InvalidChannel(other.to_string())),
        }
    }
}

/// Operation kinds tracked by the latency rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Obstacle,
    Object,
    Sign,
    Audio,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Obstacle,
        Operation::Object,
        Operation::Sign,
        Operation::Audio,
    ];

    /// Dense index into per-operation arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// `true` for the sensing operations (everything except audio playback).
    pub fn is_detection(self) -> bool {
        !matches!(self, Operation::Audio)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Obstacle => "obstacle",
            Operation::Object => "object",
            Operation::Sign => "sign",
            Operation::Audio => "audio",
        };
        f.write_str(name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Detections
// ────────────────────────────────────────────────────────────────────────────

/// What produced a [`DetectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Obstacle,
    Object,
    Sign,
}

impl From<DetectionKind> for Operation {
    fn from(kind: DetectionKind) -> Self {
        match kind {
            DetectionKind::Obstacle => Operation::Obstacle,
            DetectionKind::Object => Operation::Object,
            DetectionKind::Sign => Operation::Sign,
        }
    }
}

/// Axis-aligned bounding box in pixel coordinates (`x1,y1` top-left,
/// `x2,y2` bottom-right).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Pixel area.  Inverted or non-finite boxes have an area of `0.0`.
    pub fn area(&self) -> f32 {
        let area = self.width().max(0.0) * self.height().max(0.0);
        if area.is_finite() { area } else { 0.0 }
    }
}

/// A single sensor-derived observation ready for downstream handling.
///
/// Created by a sampling loop and consumed exactly once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub kind: DetectionKind,
    pub label: String,
    /// Range to the target, when known.  Vision events usually arrive without
    /// one and get it from the distance estimator.
    pub distance_cm: Option<f32>,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    /// Pixel geometry for vision events.
    pub bbox: Option<BoundingBox>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionEvent {
    /// An obstacle reported by the ranging sensor.
    pub fn obstacle(distance_cm: f32) -> Self {
        Self {
            kind: DetectionKind::Obstacle,
            label: "obstacle".to_string(),
            distance_cm: Some(distance_cm),
            confidence: 1.0,
            bbox: None,
            timestamp: Utc::now(),
        }
    }

    /// A labelled object or sign seen by the vision detector.
    pub fn visual(kind: DetectionKind, label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            kind,
            label: label.into(),
            distance_cm: None,
            confidence: confidence.clamp(0.0, 1.0),
            bbox: Some(bbox),
            timestamp: Utc::now(),
        }
    }

    /// Return a copy with `distance_cm` filled in.
    pub fn with_distance(mut self, distance_cm: f32) -> Self {
        self.distance_cm = Some(distance_cm);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Speech
// ────────────────────────────────────────────────────────────────────────────

/// Priority class of an [`Announcement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// A unit of spoken output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub text: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl Announcement {
    pub fn new(text: impl Into<String>, priority: Priority) -> Self {
        Self {
            text: text.into(),
            priority,
            created_at: Utc::now(),
        }
    }
}

/// The state of the single audio output device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "announcement", rename_all = "lowercase")]
pub enum SpeakerState {
    #[default]
    Idle,
    Speaking(Announcement),
}

impl SpeakerState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SpeakerState::Idle)
    }

    /// Text of the utterance currently playing, if any.
    pub fn current_text(&self) -> Option<&str> {
        match self {
            SpeakerState::Idle => None,
            SpeakerState::Speaking(a) => Some(&a.text),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sampling and metrics
// ────────────────────────────────────────────────────────────────────────────

/// Interval / frame-skip / quality tuple in effect for one loop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingProfile {
    pub interval: Duration,
    /// Only every `frame_skip`-th frame is processed; `1` processes all.
    pub frame_skip: u32,
    pub reduced_processing: bool,
}

impl SamplingProfile {
    /// Sleep between two cycles, stretched by the frame skip.
    pub fn cycle_period(&self) -> Duration {
        self.interval * self.frame_skip.max(1)
    }
}

/// A single latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub operation: Operation,
    pub ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Sink for latency measurements.  Lets components that sit below the
/// performance tracker in the crate graph report timings without depending
/// on it.
pub trait LatencyRecorder: Send + Sync {
    fn record_interval(&self, operation: Operation, started: Instant, finished: Instant);
}

/// Battery tier derived from the charge level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryTier {
    Critical,
    Low,
    Warning,
    Normal,
}

impl fmt::Display for BatteryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatteryTier::Critical => "critical",
            BatteryTier::Low => "low",
            BatteryTier::Warning => "warning",
            BatteryTier::Normal => "normal",
        };
        f.write_str(name)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Envelope for everything routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"sightline-runtime::ranging"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Detection(DetectionEvent),
    LatencyBreach {
        operation: Operation,
        ms: f64,
        threshold_ms: f64,
    },
    ResourcePressure {
        resource: String,
        mean_percent: f32,
        limit_percent: f32,
    },
    BatteryTierChanged {
        level: f32,
        tier: BatteryTier,
    },
    PowerSaveChanged {
        active: bool,
    },
    ShutdownRequested {
        level: f32,
    },
    ChannelToggled {
        channel: Channel,
        enabled: bool,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SightError {
    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Speech device error: {0}")]
    SpeechDevice(String),

    #[error("Unknown channel '{0}' (expected ranging or vision)")]
    InvalidChannel(String),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("pipeline is not running")]
    NotRunning,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SightError {
    /// Shorthand for [`SightError::HardwareFault`].
    pub fn hardware(component: impl Into<String>, details: impl Into<String>) -> Self {
        SightError::HardwareFault {
            component: component.into(),
            details: details.into(),
        }
    }
}
