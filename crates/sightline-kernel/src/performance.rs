//! [`PerformanceTracker`] – latency, accuracy and resource bookkeeping.
//!
//! Both sampling loops and the speech actor write into the tracker
//! concurrently while the monitor task and report generation read from it.
//! Each operation kind owns its own ring behind its own lock, so writers on
//! different loops never contend and no sample is lost or duplicated.
//!
//! # Example
//!
//! ```
//! use sightline_kernel::performance::PerformanceTracker;
//! use sightline_types::Operation;
//!
//! let tracker = PerformanceTracker::default();
//! for ms in [50.0, 60.0, 55.0, 500.0, 58.0] {
//!     tracker.record_ms(Operation::Object, ms);
//! }
//! let report = tracker.snapshot();
//! let object = report.operation(Operation::Object).unwrap();
//! assert!((object.mean_ms - 144.6).abs() < 1e-9);
//! assert_eq!(report.latency_breaches, 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sightline_types::{LatencyRecorder, LatencySample, Operation};
use tracing::warn;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tunables for a [`PerformanceTracker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A detection sample above this is a breach.
    pub max_latency_ms: f64,
    /// Capacity of each per-operation latency ring.
    pub history: usize,
    /// Number of recent detection samples in the rolling mean.
    pub rolling_window: usize,
    /// Capacity of the CPU and memory rings.
    pub resource_history: usize,
    /// Number of recent resource samples averaged for the pressure check.
    pub resource_window: usize,
    pub cpu_limit_percent: f32,
    pub memory_limit_percent: f32,
    pub accuracy_target: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 200.0,
            history: 1000,
            rolling_window: 10,
            resource_history: 100,
            resource_window: 5,
            cpu_limit_percent: 80.0,
            memory_limit_percent: 85.0,
            accuracy_target: 0.90,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Signals
// ────────────────────────────────────────────────────────────────────────────

/// Non-fatal "latency exceeded" signal for one detection sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyBreach {
    pub operation: Operation,
    pub ms: f64,
    pub threshold_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cpu => f.write_str("cpu"),
            Resource::Memory => f.write_str("memory"),
        }
    }
}

/// Recent mean utilisation of one resource is above its limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourcePressure {
    pub resource: Resource,
    pub mean_percent: f32,
    pub limit_percent: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Report
// ────────────────────────────────────────────────────────────────────────────

/// Aggregates for one operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation: Operation,
    pub samples: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyStats {
    pub total_detections: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Point-in-time view of everything the tracker knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: chrono::DateTime<Utc>,
    pub uptime_secs: f64,
    /// Only operations that have at least one sample.
    pub operations: Vec<OperationStats>,
    pub accuracy: AccuracyStats,
    pub latency_breaches: u64,
    pub max_latency_ms: f64,
    pub avg_cpu_percent: Option<f32>,
    pub avg_memory_percent: Option<f32>,
    /// Every detection operation's mean is within `max_latency_ms`.
    pub latency_within_budget: bool,
    pub accuracy_on_target: bool,
}

impl PerformanceReport {
    pub fn operation(&self, operation: Operation) -> Option<&OperationStats> {
        self.operations.iter().find(|s| s.operation == operation)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tracker
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe collector of latency samples, detection counters and
/// resource readings.  Share it behind an `Arc`.
pub struct PerformanceTracker {
    config: TrackerConfig,
    started: Instant,
    rings: [Mutex<VecDeque<LatencySample>>; 4],
    recent_detections: Mutex<VecDeque<f64>>,
    cpu: Mutex<VecDeque<f32>>,
    memory: Mutex<VecDeque<f32>>,
    total_detections: AtomicU64,
    false_positives: AtomicU64,
    false_negatives: AtomicU64,
    breaches: AtomicU64,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push_bounded<T>(ring: &mut VecDeque<T>, value: T, capacity: usize) {
    ring.push_back(value);
    while ring.len() > capacity.max(1) {
        ring.pop_front();
    }
}

fn mean_of_last(ring: &VecDeque<f32>, n: usize) -> Option<f32> {
    let n = n.min(ring.len());
    if n == 0 {
        return None;
    }
    let sum: f32 = ring.iter().rev().take(n).sum();
    Some(sum / n as f32)
}

/// 95th percentile of an ascending slice, linearly interpolated.
fn p95(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = 0.95 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

impl PerformanceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            rings: Default::default(),
            recent_detections: Mutex::new(VecDeque::new()),
            cpu: Mutex::new(VecDeque::new()),
            memory: Mutex::new(VecDeque::new()),
            total_detections: AtomicU64::new(0),
            false_positives: AtomicU64::new(0),
            false_negatives: AtomicU64::new(0),
            breaches: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Record the time between `started` and `finished` for `operation`.
    ///
    /// Returns a breach when a detection operation took longer than
    /// [`TrackerConfig::max_latency_ms`].
    pub fn record_latency(&self, operation: Operation, started: Instant, finished: Instant) -> Option<LatencyBreach> {
        let ms = finished.saturating_duration_since(started).as_secs_f64() * 1000.0;
        self.record_ms(operation, ms)
    }

    /// Record an already-measured latency in milliseconds.
    pub fn record_ms(&self, operation: Operation, ms: f64) -> Option<LatencyBreach> {
        if !ms.is_finite() || ms < 0.0 {
            return None;
        }
        let sample = LatencySample {
            operation,
            ms,
            timestamp: Utc::now(),
        };
        push_bounded(&mut lock(&self.rings[operation.index()]), sample, self.config.history);

        if !operation.is_detection() {
            return None;
        }
        push_bounded(&mut lock(&self.recent_detections), ms, self.config.rolling_window);

        if ms > self.config.max_latency_ms {
            self.breaches.fetch_add(1, Ordering::Relaxed);
            warn!(
                %operation,
                latency_ms = ms,
                threshold_ms = self.config.max_latency_ms,
                "detection latency exceeded"
            );
            Some(LatencyBreach {
                operation,
                ms,
                threshold_ms: self.config.max_latency_ms,
            })
        } else {
            None
        }
    }

    /// Start a [`LatencyScope`] that records `operation` when dropped.
    pub fn scope(&self, operation: Operation) -> LatencyScope<'_> {
        LatencyScope {
            tracker: self,
            operation,
            started: Some(Instant::now()),
        }
    }

    /// Count one detection routed by the orchestrator.
    pub fn record_detection(&self) {
        self.total_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_false_positive(&self) {
        self.false_positives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_false_negative(&self) {
        self.false_negatives.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the detection and feedback counters.  Latency history is kept.
    pub fn reset_accuracy(&self) {
        self.total_detections.store(0, Ordering::Relaxed);
        self.false_positives.store(0, Ordering::Relaxed);
        self.false_negatives.store(0, Ordering::Relaxed);
    }

    /// Mean of the most recent detection latencies (any detection kind).
    pub fn rolling_detection_mean(&self) -> Option<f64> {
        let recent = lock(&self.recent_detections);
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    /// Store one CPU/memory reading and return any resource whose recent
    /// mean is above its limit.
    pub fn record_resources(&self, cpu_percent: f32, memory_percent: f32) -> Vec<ResourcePressure> {
        let cfg = &self.config;
        let mut pressure = Vec::new();
        for (resource, ring, value, limit) in [
            (Resource::Cpu, &self.cpu, cpu_percent, cfg.cpu_limit_percent),
            (Resource::Memory, &self.memory, memory_percent, cfg.memory_limit_percent),
        ] {
            if !value.is_finite() {
                continue;
            }
            let mut ring = lock(ring);
            push_bounded(&mut ring, value, cfg.resource_history);
            if ring.len() < cfg.resource_window {
                continue;
            }
            if let Some(mean) = mean_of_last(&ring, cfg.resource_window) {
                if mean > limit {
                    warn!(%resource, mean_percent = mean, limit_percent = limit, "resource pressure");
                    pressure.push(ResourcePressure {
                        resource,
                        mean_percent: mean,
                        limit_percent: limit,
                    });
                }
            }
        }
        pressure
    }

    /// Copy of the retained samples for `operation`, oldest first.
    pub fn samples(&self, operation: Operation) -> Vec<LatencySample> {
        lock(&self.rings[operation.index()]).iter().copied().collect()
    }

    pub fn total_detections(&self) -> u64 {
        self.total_detections.load(Ordering::Relaxed)
    }

    pub fn breach_count(&self) -> u64 {
        self.breaches.load(Ordering::Relaxed)
    }

    pub fn accuracy(&self) -> AccuracyStats {
        let total = self.total_detections.load(Ordering::Relaxed);
        let fp = self.false_positives.load(Ordering::Relaxed);
        let fn_ = self.false_negatives.load(Ordering::Relaxed);
        let tp = total.saturating_sub(fp);

        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let accuracy = ratio(tp, total);
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        AccuracyStats {
            total_detections: total,
            false_positives: fp,
            false_negatives: fn_,
            accuracy,
            precision,
            recall,
            f1,
        }
    }

    pub fn snapshot(&self) -> PerformanceReport {
        let operations: Vec<OperationStats> = Operation::ALL
            .iter()
            .filter_map(|&operation| {
                let mut values: Vec<f64> = lock(&self.rings[operation.index()]).iter().map(|s| s.ms).collect();
                if values.is_empty() {
                    return None;
                }
                values.sort_by(f64::total_cmp);
                let samples = values.len();
                Some(OperationStats {
                    operation,
                    samples,
                    mean_ms: values.iter().sum::<f64>() / samples as f64,
                    min_ms: values[0],
                    max_ms: values[samples - 1],
                    p95_ms: p95(&values),
                })
            })
            .collect();

        let latency_within_budget = operations
            .iter()
            .filter(|s| s.operation.is_detection())
            .all(|s| s.mean_ms <= self.config.max_latency_ms);
        let accuracy = self.accuracy();
        let accuracy_on_target = accuracy.accuracy >= self.config.accuracy_target;
        let all = usize::MAX;

        PerformanceReport {
            generated_at: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            operations,
            accuracy,
            latency_breaches: self.breach_count(),
            max_latency_ms: self.config.max_latency_ms,
            avg_cpu_percent: mean_of_last(&lock(&self.cpu), all),
            avg_memory_percent: mean_of_last(&lock(&self.memory), all),
            latency_within_budget,
            accuracy_on_target,
        }
    }
}

impl LatencyRecorder for PerformanceTracker {
    fn record_interval(&self, operation: Operation, started: Instant, finished: Instant) {
        // Breaches are already counted and logged by the tracker.
        let _ = self.record_latency(operation, started, finished);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scoped timing
// ────────────────────────────────────────────────────────────────────────────

/// Times a block of work.  Records on [`finish`][Self::finish] or on drop,
/// whichever comes first, so early returns are still measured.
#[must_use = "the scope records when it is dropped"]
pub struct LatencyScope<'a> {
    tracker: &'a PerformanceTracker,
    operation: Operation,
    started: Option<Instant>,
}

impl LatencyScope<'_> {
    /// Stop timing now.  Returns the measured milliseconds and the breach,
    /// if any.
    pub fn finish(mut self) -> (f64, Option<LatencyBreach>) {
        let Some(started) = self.started.take() else {
            return (0.0, None);
        };
        let ms = Instant::now().saturating_duration_since(started).as_secs_f64() * 1000.0;
        (ms, self.tracker.record_ms(self.operation, ms))
    }
}

impl Drop for LatencyScope<'_> {
    fn drop(&mut self) {
        if let Some(started) = self.started.take() {
            let _ = self.tracker.record_latency(self.operation, started, Instant::now());
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn mean_and_single_breach() {
        let tracker = PerformanceTracker::default();
        let breaches: Vec<_> = [50.0, 60.0, 55.0, 500.0, 58.0]
            .into_iter()
            .filter_map(|ms| tracker.record_ms(Operation::Obstacle, ms))
            .collect();

        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].ms, 500.0);
        assert_eq!(breaches[0].threshold_ms, 200.0);

        let report = tracker.snapshot();
        let stats = report.operation(Operation::Obstacle).unwrap();
        assert_eq!(stats.samples, 5);
        assert!((stats.mean_ms - 144.6).abs() < 1e-9);
        assert_eq!(stats.min_ms, 50.0);
        assert_eq!(stats.max_ms, 500.0);
        // sorted [50,55,58,60,500]; rank 3.8 → 60 + 0.8 × 440
        assert!((stats.p95_ms - 412.0).abs() < 1e-9);
        assert_eq!(report.latency_breaches, 1);
        assert!(report.latency_within_budget);
    }

    #[test]
    fn accuracy_precision_recall() {
        let tracker = PerformanceTracker::default();
        for _ in 0..100 {
            tracker.record_detection();
        }
        for _ in 0..5 {
            tracker.record_false_positive();
        }
        for _ in 0..3 {
            tracker.record_false_negative();
        }
        let acc = tracker.accuracy();
        assert!((acc.accuracy - 0.95).abs() < 1e-12);
        assert!((acc.precision - 0.95).abs() < 1e-12);
        assert!((acc.recall - 95.0 / 98.0).abs() < 1e-12);
        let expected_f1 = 2.0 * 0.95 * (95.0 / 98.0) / (0.95 + 95.0 / 98.0);
        assert!((acc.f1 - expected_f1).abs() < 1e-12);
        assert!(tracker.snapshot().accuracy_on_target);
    }

    #[test]
    fn empty_tracker_reports_zeros() {
        let tracker = PerformanceTracker::default();
        let report = tracker.snapshot();
        assert!(report.operations.is_empty());
        assert_eq!(report.accuracy.accuracy, 0.0);
        assert_eq!(report.accuracy.f1, 0.0);
        assert!(!report.accuracy_on_target);
        assert!(tracker.rolling_detection_mean().is_none());
    }

    #[test]
    fn reset_accuracy_keeps_latency() {
        let tracker = PerformanceTracker::default();
        tracker.record_ms(Operation::Obstacle, 12.0);
        tracker.record_detection();
        tracker.record_false_positive();
        tracker.reset_accuracy();
        assert_eq!(tracker.accuracy().total_detections, 0);
        assert_eq!(tracker.accuracy().false_positives, 0);
        assert_eq!(tracker.samples(Operation::Obstacle).len(), 1);
    }

    #[test]
    fn audio_never_breaches_and_is_not_in_rolling_mean() {
        let tracker = PerformanceTracker::default();
        assert!(tracker.record_ms(Operation::Audio, 2500.0).is_none());
        assert!(tracker.rolling_detection_mean().is_none());
        assert_eq!(tracker.breach_count(), 0);
        assert!(tracker.snapshot().latency_within_budget);
    }

    #[test]
    fn rings_are_bounded() {
        let tracker = PerformanceTracker::new(TrackerConfig {
            history: 3,
            rolling_window: 2,
            ..TrackerConfig::default()
        });
        for ms in [1.0, 2.0, 3.0, 4.0, 5.0] {
            tracker.record_ms(Operation::Sign, ms);
        }
        let kept: Vec<f64> = tracker.samples(Operation::Sign).iter().map(|s| s.ms).collect();
        assert_eq!(kept, vec![3.0, 4.0, 5.0]);
        assert_eq!(tracker.rolling_detection_mean(), Some(4.5));
    }

    #[test]
    fn negative_and_non_finite_samples_are_ignored() {
        let tracker = PerformanceTracker::default();
        tracker.record_ms(Operation::Object, f64::NAN);
        tracker.record_ms(Operation::Object, -1.0);
        assert!(tracker.samples(Operation::Object).is_empty());
    }

    #[test]
    fn resource_pressure_needs_a_full_window() {
        let tracker = PerformanceTracker::default();
        for _ in 0..4 {
            assert!(tracker.record_resources(95.0, 10.0).is_empty());
        }
        let pressure = tracker.record_resources(95.0, 10.0);
        assert_eq!(pressure.len(), 1);
        assert_eq!(pressure[0].resource, Resource::Cpu);
        assert_eq!(pressure[0].limit_percent, 80.0);

        // Five calm readings pull the CPU mean back under the limit.
        for _ in 0..5 {
            tracker.record_resources(10.0, 10.0);
        }
        assert!(tracker.record_resources(10.0, 90.0).is_empty());
        let report = tracker.snapshot();
        assert!(report.avg_cpu_percent.is_some());
    }

    #[test]
    fn scope_records_on_drop_and_finish() {
        let tracker = PerformanceTracker::default();
        {
            let _scope = tracker.scope(Operation::Obstacle);
            thread::sleep(Duration::from_millis(2));
        }
        let (ms, breach) = tracker.scope(Operation::Object).finish();
        assert!(breach.is_none());
        assert!(ms >= 0.0);
        assert_eq!(tracker.samples(Operation::Obstacle).len(), 1);
        assert_eq!(tracker.samples(Operation::Object).len(), 1);
        assert!(tracker.samples(Operation::Obstacle)[0].ms >= 2.0);

        let strict = PerformanceTracker::new(TrackerConfig {
            max_latency_ms: 1.0,
            ..TrackerConfig::default()
        });
        let scope = strict.scope(Operation::Sign);
        thread::sleep(Duration::from_millis(3));
        let (ms, breach) = scope.finish();
        assert!(ms >= 3.0);
        assert_eq!(breach.map(|b| b.operation), Some(Operation::Sign));
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let tracker = Arc::new(PerformanceTracker::default());
        let handles: Vec<_> = [Operation::Obstacle, Operation::Object]
            .into_iter()
            .map(|op| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for i in 0..250 {
                        tracker.record_ms(op, f64::from(i % 50));
                        tracker.record_detection();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.samples(Operation::Obstacle).len(), 250);
        assert_eq!(tracker.samples(Operation::Object).len(), 250);
        assert_eq!(tracker.total_detections(), 500);
    }

    #[test]
    fn report_serialises_to_json() {
        let tracker = PerformanceTracker::default();
        tracker.record_ms(Operation::Sign, 40.0);
        let json = serde_json::to_value(tracker.snapshot()).unwrap();
        assert_eq!(json["operations"][0]["operation"], "sign");
        assert_eq!(json["max_latency_ms"], 200.0);
    }
}
