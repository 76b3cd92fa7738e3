//! Device configuration – reads/writes `~/.sightline/config.toml`.

use serde::{Deserialize, Serialize};
use sightline_kernel::{BatteryCapacity, PowerThresholds, TrackerConfig};
use sightline_middleware::ArbitratorConfig;
use sightline_runtime::{LogFormat, OrchestratorConfig};
use sightline_types::SightError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where speech, battery and resource readings come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Everything simulated; runs anywhere.
    #[default]
    Sim,
    /// External TTS program, sysfs battery and procfs load.  Sensors stay
    /// simulated until a board driver is plugged in.
    Host,
}

impl std::fmt::Display for HardwareMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareMode::Sim => write!(f, "sim"),
            HardwareMode::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for HardwareMode {
    type Err = SightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" | "simulated" => Ok(HardwareMode::Sim),
            "host" => Ok(HardwareMode::Host),
            other => Err(SightError::Config(format!("unknown hardware mode '{other}'"))),
        }
    }
}

/// Persisted device configuration stored in `~/.sightline/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hardware: HardwareMode,

    /// TTS program used in host mode; the text is passed as its last
    /// argument.
    #[serde(default = "default_speech_program")]
    pub speech_program: String,

    #[serde(default = "default_speech_args")]
    pub speech_args: Vec<String>,

    /// `compact` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_announce_confidence")]
    pub announce_confidence: f32,

    #[serde(default = "default_detector_confidence")]
    pub detector_confidence: f32,

    /// `0` disables repeat suppression.
    #[serde(default = "default_repeat_cooldown_ms")]
    pub repeat_cooldown_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_battery_interval_ms")]
    pub battery_interval_ms: u64,

    /// Starting charge of the simulated battery.
    #[serde(default = "default_sim_battery_level")]
    pub sim_battery_level: f32,

    /// Points the simulated battery loses per reading.
    #[serde(default = "default_sim_battery_drain")]
    pub sim_battery_drain: f32,

    #[serde(default)]
    pub power: PowerThresholds,

    /// Pack size and draw for the remaining-hours estimate.
    #[serde(default)]
    pub battery: BatteryCapacity,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub speech: ArbitratorConfig,
}

fn default_speech_program() -> String {
    "espeak".to_string()
}
fn default_speech_args() -> Vec<String> {
    vec!["-s".to_string(), "160".to_string()]
}
fn default_log_format() -> String {
    LogFormat::Compact.to_string()
}
fn default_announce_confidence() -> f32 {
    0.7
}
fn default_detector_confidence() -> f32 {
    0.5
}
fn default_repeat_cooldown_ms() -> u64 {
    1500
}
fn default_monitor_interval_ms() -> u64 {
    1000
}
fn default_battery_interval_ms() -> u64 {
    5000
}
fn default_sim_battery_level() -> f32 {
    100.0
}
fn default_sim_battery_drain() -> f32 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hardware: HardwareMode::default(),
            speech_program: default_speech_program(),
            speech_args: default_speech_args(),
            log_format: default_log_format(),
            announce_confidence: default_announce_confidence(),
            detector_confidence: default_detector_confidence(),
            repeat_cooldown_ms: default_repeat_cooldown_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            battery_interval_ms: default_battery_interval_ms(),
            sim_battery_level: default_sim_battery_level(),
            sim_battery_drain: default_sim_battery_drain(),
            power: PowerThresholds::default(),
            battery: BatteryCapacity::default(),
            tracker: TrackerConfig::default(),
            speech: ArbitratorConfig::default(),
        }
    }
}

impl Config {
    /// Parsed `log_format`, falling back to compact on garbage.
    pub fn log_format(&self) -> LogFormat {
        self.log_format.parse().unwrap_or_default()
    }

    /// The orchestrator settings this file describes.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            announce_confidence: self.announce_confidence,
            detector_confidence: self.detector_confidence,
            repeat_cooldown: Duration::from_millis(self.repeat_cooldown_ms),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            battery_interval: Duration::from_millis(self.battery_interval_ms),
            thresholds: self.power,
            capacity: self.battery,
            tracker: self.tracker.clone(),
            speech: self.speech.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

/// Return the path to `~/.sightline/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".sightline").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, SightError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, SightError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| SightError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| SightError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SIGHTLINE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SIGHTLINE_HARDWARE` | `hardware` (`sim` / `host`) |
/// | `SIGHTLINE_SPEECH_PROGRAM` | `speech_program` |
/// | `SIGHTLINE_LOG_FORMAT` | `log_format` |
/// | `SIGHTLINE_BATTERY_INTERVAL_MS` | `battery_interval_ms` |
/// | `SIGHTLINE_REPEAT_COOLDOWN_MS` | `repeat_cooldown_ms` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SIGHTLINE_HARDWARE")
        && let Ok(mode) = v.parse::<HardwareMode>()
    {
        cfg.hardware = mode;
    }
    if let Ok(v) = std::env::var("SIGHTLINE_SPEECH_PROGRAM") {
        cfg.speech_program = v;
    }
    if let Ok(v) = std::env::var("SIGHTLINE_LOG_FORMAT")
        && v.parse::<LogFormat>().is_ok()
    {
        cfg.log_format = v;
    }
    if let Ok(v) = std::env::var("SIGHTLINE_BATTERY_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.battery_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("SIGHTLINE_REPEAT_COOLDOWN_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.repeat_cooldown_ms = ms;
    }
}

/// Save the config to disk, creating `~/.sightline/` if necessary.
pub fn save(cfg: &Config) -> Result<(), SightError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), SightError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SightError::Config(format!("failed to create config directory: {e}")))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| SightError::Config(format!("failed to set config directory permissions: {e}")))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| SightError::Config(format!("failed to serialize config: {e}")))?;
    // Owner read/write only (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| SightError::Config(format!("failed to write {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| SightError::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.hardware = HardwareMode::Host;
        cfg.power.warning = 35.0;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.hardware, HardwareMode::Host);
        assert_eq!(loaded.power.warning, 35.0);
        assert_eq!(loaded.repeat_cooldown_ms, 1500);
        assert_eq!(loaded.speech_program, "espeak");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "announce_confidence = 0.8\n[power]\ncritical = 5.0\n[battery]\ncapacity_mah = 10000.0\n",
        )
        .expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.announce_confidence, 0.8);
        assert_eq!(cfg.power.critical, 5.0);
        assert_eq!(cfg.battery.capacity_mah, 10000.0);
        assert_eq!(cfg.battery.draw_ma, 500.0);
        assert_eq!(cfg.orchestrator().capacity, cfg.battery);
        assert_eq!(cfg.power.low, 20.0);
        assert_eq!(cfg.tracker.max_latency_ms, 200.0);
        assert_eq!(cfg.hardware, HardwareMode::Sim);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "hardware = [").expect("write");
        assert!(matches!(load_from(&path), Err(SightError::Config(_))));
    }

    #[test]
    fn config_path_points_to_sightline_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".sightline"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn orchestrator_config_carries_file_values() {
        let cfg = Config {
            repeat_cooldown_ms: 0,
            battery_interval_ms: 250,
            ..Config::default()
        };
        let orch = cfg.orchestrator();
        assert_eq!(orch.repeat_cooldown, Duration::ZERO);
        assert_eq!(orch.battery_interval, Duration::from_millis(250));
        assert_eq!(orch.announce_confidence, 0.7);
    }

    #[test]
    fn apply_env_overrides_changes_hardware_and_ignores_garbage() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SIGHTLINE_HARDWARE", "host") };
        unsafe { std::env::set_var("SIGHTLINE_BATTERY_INTERVAL_MS", "not-a-number") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.hardware, HardwareMode::Host);
        assert_eq!(cfg.battery_interval_ms, 5000);
        unsafe { std::env::remove_var("SIGHTLINE_HARDWARE") };
        unsafe { std::env::remove_var("SIGHTLINE_BATTERY_INTERVAL_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_log_format() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SIGHTLINE_LOG_FORMAT", "json") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.log_format(), LogFormat::Json);
        unsafe { std::env::remove_var("SIGHTLINE_LOG_FORMAT") };
    }
}
