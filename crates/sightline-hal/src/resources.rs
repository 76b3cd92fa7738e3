//! Host resource sampling: the [`ResourceProbe`] trait and a procfs reader.

use std::fs;
use std::path::{Path, PathBuf};

use sightline_types::SightError;

/// CPU and memory utilisation at one instant, both in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Samples host CPU and memory utilisation.
pub trait ResourceProbe: Send {
    /// # Errors
    ///
    /// Returns [`SightError::HardwareFault`] when the counters are unreadable.
    fn sample(&mut self) -> Result<ResourceUsage, SightError>;
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Reads `/proc/stat` and `/proc/meminfo`.
///
/// CPU utilisation is the busy share of jiffies since the previous call; the
/// first call reports the share since boot.
#[derive(Debug, Clone)]
pub struct ProcfsResourceProbe {
    root: PathBuf,
    previous: Option<CpuTimes>,
}

impl Default for ProcfsResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsResourceProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from a directory laid out like `/proc`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            previous: None,
        }
    }

    fn read(&self, name: &str) -> Result<String, SightError> {
        let path = self.root.join(name);
        fs::read_to_string(&path)
            .map_err(|e| SightError::hardware("procfs", format!("{}: {e}", path.display())))
    }

    fn cpu_times(&self) -> Result<CpuTimes, SightError> {
        let stat = self.read("stat")?;
        let line = stat
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| SightError::hardware("procfs", "no aggregate cpu line in stat"))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return Err(SightError::hardware("procfs", "truncated cpu line in stat"));
        }
        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Ok(CpuTimes {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    fn memory_percent(&self) -> Result<f32, SightError> {
        let meminfo = self.read("meminfo")?;
        let field = |key: &str| -> Option<f64> {
            meminfo
                .lines()
                .find(|l| l.starts_with(key))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
        };
        let total = field("MemTotal:")
            .filter(|t| *t > 0.0)
            .ok_or_else(|| SightError::hardware("procfs", "MemTotal missing from meminfo"))?;
        let available = field("MemAvailable:")
            .or_else(|| field("MemFree:"))
            .ok_or_else(|| SightError::hardware("procfs", "MemAvailable missing from meminfo"))?;
        Ok(((total - available) / total * 100.0).clamp(0.0, 100.0) as f32)
    }
}

impl ResourceProbe for ProcfsResourceProbe {
    fn sample(&mut self) -> Result<ResourceUsage, SightError> {
        let now = self.cpu_times()?;
        let (busy, total) = match self.previous {
            Some(prev) => (
                now.busy.saturating_sub(prev.busy),
                now.total.saturating_sub(prev.total),
            ),
            None => (now.busy, now.total),
        };
        self.previous = Some(now);
        let cpu_percent = if total == 0 {
            0.0
        } else {
            (busy as f64 / total as f64 * 100.0) as f32
        };
        Ok(ResourceUsage {
            cpu_percent,
            memory_percent: self.memory_percent()?,
        })
    }
}
