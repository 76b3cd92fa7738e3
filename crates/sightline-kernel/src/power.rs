//! [`PowerController`] – battery tier, power-save hysteresis and sampling
//! profiles.
//!
//! The controller only signals.  It reports what changed on each reading
//! via [`PowerTransition`] and leaves the decision to stop to its owner.
//!
//! Power-save is entered at or below the warning threshold and left only
//! once the level climbs more than `hysteresis` points above it, so a level
//! hovering around the boundary cannot flip the sampling profile every
//! cycle.
//!
//! Each reading also refreshes a runtime estimate from the configured
//! [`BatteryCapacity`]; there is no estimate while the pack is charging.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sightline_types::{BatteryTier, Channel, SamplingProfile};
use tokio::sync::watch;
use tracing::{info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tier boundaries in percent.  A level equal to a threshold belongs to the
/// lower tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerThresholds {
    pub critical: f32,
    pub low: f32,
    pub warning: f32,
    /// Points above `warning` the level must exceed to leave power-save.
    pub hysteresis: f32,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            critical: 10.0,
            low: 20.0,
            warning: 30.0,
            hysteresis: 10.0,
        }
    }
}

impl PowerThresholds {
    pub fn tier_for(&self, level: f32) -> BatteryTier {
        if level <= self.critical {
            BatteryTier::Critical
        } else if level <= self.low {
            BatteryTier::Low
        } else if level <= self.warning {
            BatteryTier::Warning
        } else {
            BatteryTier::Normal
        }
    }

    pub fn power_save_exit(&self) -> f32 {
        self.warning + self.hysteresis
    }
}

/// Pack size and average draw used for the runtime estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryCapacity {
    pub capacity_mah: f32,
    pub draw_ma: f32,
}

impl Default for BatteryCapacity {
    fn default() -> Self {
        Self {
            capacity_mah: 5000.0,
            draw_ma: 500.0,
        }
    }
}

impl BatteryCapacity {
    /// Hours left at `level` percent, or `None` while charging or when the
    /// draw is not positive.
    pub fn hours_remaining(&self, level: f32, charging: bool) -> Option<f32> {
        if charging || self.draw_ma <= 0.0 || !self.draw_ma.is_finite() {
            return None;
        }
        let remaining_mah = level.clamp(0.0, 100.0) / 100.0 * self.capacity_mah;
        Some((remaining_mah / self.draw_ma).max(0.0))
    }
}

/// Sampling profiles for each channel in normal and power-save mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerProfiles {
    pub ranging_normal: SamplingProfile,
    pub ranging_save: SamplingProfile,
    pub vision_normal: SamplingProfile,
    pub vision_save: SamplingProfile,
}

impl Default for PowerProfiles {
    fn default() -> Self {
        Self {
            ranging_normal: SamplingProfile {
                interval: Duration::from_millis(100),
                frame_skip: 1,
                reduced_processing: false,
            },
            ranging_save: SamplingProfile {
                interval: Duration::from_millis(200),
                frame_skip: 1,
                reduced_processing: true,
            },
            // 5 fps
            vision_normal: SamplingProfile {
                interval: Duration::from_millis(200),
                frame_skip: 1,
                reduced_processing: false,
            },
            // 250 ms frames, every second one processed: 2 fps
            vision_save: SamplingProfile {
                interval: Duration::from_millis(250),
                frame_skip: 2,
                reduced_processing: true,
            },
        }
    }
}

impl PowerProfiles {
    pub fn profile(&self, channel: Channel, power_save: bool) -> SamplingProfile {
        match (channel, power_save) {
            (Channel::Ranging, false) => self.ranging_normal,
            (Channel::Ranging, true) => self.ranging_save,
            (Channel::Vision, false) => self.vision_normal,
            (Channel::Vision, true) => self.vision_save,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State
// ────────────────────────────────────────────────────────────────────────────

/// Immutable snapshot of the controller, swapped whole on every update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    pub level: f32,
    pub tier: BatteryTier,
    pub power_save: bool,
    pub charging: bool,
    pub hours_remaining: Option<f32>,
}

impl Default for PowerState {
    fn default() -> Self {
        Self {
            level: 100.0,
            tier: BatteryTier::Normal,
            power_save: false,
            charging: false,
            hours_remaining: BatteryCapacity::default().hours_remaining(100.0, false),
        }
    }
}

/// What a single [`PowerController::update`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PowerTransition {
    /// `(from, to)` when the tier changed.
    pub tier_changed: Option<(BatteryTier, BatteryTier)>,
    /// `Some(true)` on entering power-save, `Some(false)` on leaving it.
    pub power_save_changed: Option<bool>,
    /// Set only on the reading that crosses into the critical tier.
    pub shutdown_requested: bool,
}

impl PowerTransition {
    pub fn is_empty(&self) -> bool {
        self.tier_changed.is_none() && self.power_save_changed.is_none() && !self.shutdown_requested
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

/// Tracks battery level and exposes the sampling profile in force.
///
/// # Example
///
/// ```
/// use sightline_kernel::power::PowerController;
/// use sightline_types::{BatteryTier, Channel};
///
/// let power = PowerController::default();
/// let t = power.update(25.0);
/// assert_eq!(t.power_save_changed, Some(true));
/// assert_eq!(power.state().tier, BatteryTier::Warning);
/// assert!(power.current_profile(Channel::Vision).reduced_processing);
/// ```
pub struct PowerController {
    thresholds: PowerThresholds,
    profiles: PowerProfiles,
    capacity: BatteryCapacity,
    state: watch::Sender<PowerState>,
}

impl Default for PowerController {
    fn default() -> Self {
        Self::new(PowerThresholds::default(), PowerProfiles::default())
    }
}

impl PowerController {
    /// Starts at 100 % in the normal tier.
    pub fn new(thresholds: PowerThresholds, profiles: PowerProfiles) -> Self {
        let (state, _) = watch::channel(PowerState::default());
        Self {
            thresholds,
            profiles,
            capacity: BatteryCapacity::default(),
            state,
        }
    }

    pub fn with_capacity(self, capacity: BatteryCapacity) -> Self {
        self.state.send_modify(|s| s.hours_remaining = capacity.hours_remaining(s.level, s.charging));
        Self { capacity, ..self }
    }

    pub fn thresholds(&self) -> &PowerThresholds {
        &self.thresholds
    }

    pub fn state(&self) -> PowerState {
        *self.state.borrow()
    }

    /// Watch every state swap.
    pub fn subscribe(&self) -> watch::Receiver<PowerState> {
        self.state.subscribe()
    }

    pub fn current_profile(&self, channel: Channel) -> SamplingProfile {
        self.profiles.profile(channel, self.state.borrow().power_save)
    }

    /// Apply one battery reading, keeping the last known charging state.
    /// Non-finite readings are ignored.
    pub fn update(&self, level: f32) -> PowerTransition {
        self.apply(level, None)
    }

    /// Apply one gauge reading including its charging flag.
    pub fn update_reading(&self, level: f32, charging: bool) -> PowerTransition {
        self.apply(level, Some(charging))
    }

    fn apply(&self, level: f32, charging: Option<bool>) -> PowerTransition {
        if !level.is_finite() {
            warn!(level, "ignoring non-finite battery reading");
            return PowerTransition::default();
        }
        let level = level.clamp(0.0, 100.0);
        let tier = self.thresholds.tier_for(level);
        let mut transition = PowerTransition::default();

        // Read and swap under the channel lock so concurrent readings each
        // see the state left by the one before.
        self.state.send_if_modified(|state| {
            let previous = *state;
            let power_save = if previous.power_save {
                level <= self.thresholds.power_save_exit()
            } else {
                level <= self.thresholds.warning
            };
            let charging = charging.unwrap_or(previous.charging);

            transition = PowerTransition {
                tier_changed: (tier != previous.tier).then_some((previous.tier, tier)),
                power_save_changed: (power_save != previous.power_save).then_some(power_save),
                shutdown_requested: tier == BatteryTier::Critical && previous.tier != BatteryTier::Critical,
            };
            *state = PowerState {
                level,
                tier,
                power_save,
                charging,
                hours_remaining: self.capacity.hours_remaining(level, charging),
            };
            *state != previous
        });

        if let Some((from, to)) = transition.tier_changed {
            info!(level, %from, %to, "battery tier changed");
        }
        match transition.power_save_changed {
            Some(true) => info!(level, "entering power-save mode"),
            Some(false) => info!(level, "leaving power-save mode"),
            None => {}
        }
        if transition.shutdown_requested {
            warn!(level, "critical battery, requesting shutdown");
        }
        transition
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
