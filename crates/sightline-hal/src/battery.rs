//! Battery collaborator: the [`BatteryGauge`] trait and the Linux sysfs
//! reader.

use std::fs;
use std::path::{Path, PathBuf};

use sightline_types::SightError;

/// Default location of the Linux power-supply class.
pub const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// One reading from a battery gauge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    /// Charge level in percent (`0..=100`).
    pub percent: f32,
    pub charging: bool,
}

/// Anything that can report the current battery percentage.
pub trait BatteryGauge: Send {
    fn id(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`SightError::HardwareFault`] when the gauge cannot be read.
    fn read(&mut self) -> Result<BatteryReading, SightError>;
}

/// Reads `capacity` and `status` from the first battery entry of the power
/// supply class (`BAT*` or anything containing `battery`).
#[derive(Debug, Clone)]
pub struct SysfsBatteryGauge {
    battery_dir: PathBuf,
}

impl SysfsBatteryGauge {
    /// Locate a battery under [`POWER_SUPPLY_DIR`].
    pub fn discover() -> Option<Self> {
        Self::discover_in(Path::new(POWER_SUPPLY_DIR))
    }

    /// Locate a battery under an arbitrary power-supply directory.
    pub fn discover_in(power_supply_dir: &Path) -> Option<Self> {
        let mut candidates: Vec<PathBuf> = fs::read_dir(power_supply_dir)
            .ok()?
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_lowercase();
                name.starts_with("bat") || name.contains("battery")
            })
            .map(|entry| entry.path())
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .next()
            .map(|battery_dir| Self { battery_dir })
    }

    fn read_attr(&self, name: &str) -> Result<String, SightError> {
        let path = self.battery_dir.join(name);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| SightError::hardware("sysfs_battery", format!("{}: {e}", path.display())))
    }
}

impl BatteryGauge for SysfsBatteryGauge {
    fn id(&self) -> &str {
        "sysfs_battery"
    }

    fn read(&mut self) -> Result<BatteryReading, SightError> {
        let raw = self.read_attr("capacity")?;
        let percent: f32 = raw
            .parse()
            .map_err(|_| SightError::hardware("sysfs_battery", format!("unparseable capacity '{raw}'")))?;
        // A missing status file is common on cheap gauges; assume discharging.
        let charging = self
            .read_attr("status")
            .map(|s| {
                let s = s.to_lowercase();
                s.contains("charging") && !s.contains("discharging") || s.contains("full")
            })
            .unwrap_or(false);
        Ok(BatteryReading {
            percent: percent.clamp(0.0, 100.0),
            charging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_supply(entries: &[(&str, &[(&str, &str)])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tmp dir");
        for (name, files) in entries {
            let sub = dir.path().join(name);
            fs::create_dir_all(&sub).unwrap();
            for (file, contents) in *files {
                fs::write(sub.join(file), contents).unwrap();
            }
        }
        dir
    }

    #[test]
    fn discovers_battery_and_reads_capacity() {
        let dir = fake_supply(&[
            ("AC", &[("online", "1\n")]),
            ("BAT0", &[("capacity", "57\n"), ("status", "Discharging\n")]),
        ]);
        let mut gauge = SysfsBatteryGauge::discover_in(dir.path()).expect("battery found");
        let reading = gauge.read().unwrap();
        assert!((reading.percent - 57.0).abs() < f32::EPSILON);
        assert!(!reading.charging);
    }

    #[test]
    fn charging_and_full_statuses_count_as_charging() {
        let dir = fake_supply(&[("BAT1", &[("capacity", "100"), ("status", "Full")])]);
        let mut gauge = SysfsBatteryGauge::discover_in(dir.path()).unwrap();
        assert!(gauge.read().unwrap().charging);

        fs::write(dir.path().join("BAT1").join("status"), "Charging").unwrap();
        assert!(gauge.read().unwrap().charging);
    }

    #[test]
    fn no_battery_entry_means_none() {
        let dir = fake_supply(&[("AC", &[("online", "1")])]);
        assert!(SysfsBatteryGauge::discover_in(dir.path()).is_none());
    }

    #[test]
    fn garbage_capacity_is_a_hardware_fault() {
        let dir = fake_supply(&[("BAT0", &[("capacity", "lots")])]);
        let mut gauge = SysfsBatteryGauge::discover_in(dir.path()).unwrap();
        assert!(matches!(gauge.read(), Err(SightError::HardwareFault { .. })));
    }
}
