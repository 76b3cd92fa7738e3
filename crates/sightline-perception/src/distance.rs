//! Monocular range estimation from bounding-box area.
//!
//! A nearer object fills more of the frame, so apparent area falls roughly
//! with the square of distance.  The estimate is therefore proportional to
//! `1 / sqrt(area)`, scaled per object class and blended with a per-class
//! floor so tiny or degenerate boxes never produce absurd ranges:
//!
//! ```text
//! distance = hypot(floor, scale / sqrt(area + 1))
//! ```
//!
//! The blend is a smooth maximum: it never drops below `floor`, it is
//! strictly decreasing in `area`, and it stays finite when `area` is zero.
//!
//! # Example
//!
//! ```rust
//! use sightline_perception::distance::DistanceEstimator;
//! use sightline_types::BoundingBox;
//!
//! let estimator = DistanceEstimator::default();
//! let near = estimator.estimate("car", &BoundingBox::new(0.0, 0.0, 300.0, 200.0));
//! let far = estimator.estimate("car", &BoundingBox::new(0.0, 0.0, 30.0, 20.0));
//! assert!(near < far);
//! assert!(near >= 100.0);
//! ```

use sightline_types::BoundingBox;
use tracing::trace;

// ────────────────────────────────────────────────────────────────────────────
// Classes
// ────────────────────────────────────────────────────────────────────────────

/// Label buckets that share one set of estimation constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistanceClass {
    /// `person`, `bicycle`
    Pedestrian,
    /// `car`, `truck`, `bus`
    Vehicle,
    Generic,
}

impl DistanceClass {
    pub fn for_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "person" | "bicycle" => DistanceClass::Pedestrian,
            "car" | "truck" | "bus" => DistanceClass::Vehicle,
            _ => DistanceClass::Generic,
        }
    }
}

/// Scale constant and minimum plausible distance for one class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassScale {
    pub scale: f32,
    pub floor_cm: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Estimator
// ────────────────────────────────────────────────────────────────────────────

/// Per-class area-to-range heuristic.  Deterministic and side-effect free.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimator {
    pub pedestrian: ClassScale,
    pub vehicle: ClassScale,
    pub generic: ClassScale,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        Self {
            pedestrian: ClassScale {
                scale: 1000.0,
                floor_cm: 50.0,
            },
            vehicle: ClassScale {
                scale: 2000.0,
                floor_cm: 100.0,
            },
            generic: ClassScale {
                scale: 800.0,
                floor_cm: 30.0,
            },
        }
    }
}

impl DistanceEstimator {
    pub fn constants(&self, class: DistanceClass) -> ClassScale {
        match class {
            DistanceClass::Pedestrian => self.pedestrian,
            DistanceClass::Vehicle => self.vehicle,
            DistanceClass::Generic => self.generic,
        }
    }

    /// Estimated distance in centimetres for a box of the given area
    /// (square pixels).  Negative or non-finite areas count as zero.
    pub fn estimate_from_area(&self, class: DistanceClass, area: f32) -> f32 {
        let ClassScale { scale, floor_cm } = self.constants(class);
        let area = if area.is_finite() { area.max(0.0) } else { 0.0 };
        let apparent = f64::from(scale) / (f64::from(area) + 1.0).sqrt();
        f64::from(floor_cm).hypot(apparent) as f32
    }

    /// Estimated distance in centimetres for `label` detected in `bbox`.
    pub fn estimate(&self, label: &str, bbox: &BoundingBox) -> f32 {
        let class = DistanceClass::for_label(label);
        let distance = self.estimate_from_area(class, bbox.area());
        trace!(label, ?class, area = bbox.area(), distance, "estimated range");
        distance
    }
}

/// [`DistanceEstimator::estimate`] with the default constants.
pub fn estimate_distance_cm(label: &str, bbox: &BoundingBox) -> f32 {
    DistanceEstimator::default().estimate(label, bbox)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: f32) -> BoundingBox {
        BoundingBox::new(10.0, 10.0, 10.0 + side, 10.0 + side)
    }

    #[test]
    fn labels_map_to_buckets() {
        assert_eq!(DistanceClass::for_label("person"), DistanceClass::Pedestrian);
        assert_eq!(DistanceClass::for_label("bicycle"), DistanceClass::Pedestrian);
        assert_eq!(DistanceClass::for_label("Bus"), DistanceClass::Vehicle);
        assert_eq!(DistanceClass::for_label("truck"), DistanceClass::Vehicle);
        assert_eq!(DistanceClass::for_label("stop sign"), DistanceClass::Generic);
        assert_eq!(DistanceClass::for_label(""), DistanceClass::Generic);
    }

    #[test]
    fn car_estimate_is_above_floor_and_strictly_decreasing() {
        let est = DistanceEstimator::default();
        let floor = est.vehicle.floor_cm;
        let mut previous = f32::INFINITY;
        for side in [1.0_f32, 2.0, 5.0, 10.0, 40.0, 100.0, 400.0, 1000.0, 3000.0] {
            let d = est.estimate("car", &square(side));
            assert!(d >= floor, "side {side}: {d} below floor");
            assert!(d < previous, "side {side}: {d} not below {previous}");
            previous = d;
        }
    }

    #[test]
    fn zero_and_degenerate_area_are_finite() {
        let est = DistanceEstimator::default();
        let zero = est.estimate("person", &square(0.0));
        let inverted = est.estimate("person", &BoundingBox::new(50.0, 50.0, 10.0, 10.0));
        let nan = est.estimate("person", &BoundingBox::new(0.0, 0.0, f32::NAN, 5.0));
        assert!(zero.is_finite());
        assert_eq!(zero, inverted);
        assert_eq!(zero, nan);
        // hypot(50, 1000 / 1)
        assert!((zero - 1001.249).abs() < 0.01);
    }

    #[test]
    fn huge_box_settles_on_class_floor() {
        let est = DistanceEstimator::default();
        let d = est.estimate("cup", &square(100_000.0));
        assert!((d - est.generic.floor_cm).abs() < 0.01);
    }

    #[test]
    fn estimate_is_deterministic() {
        let bbox = BoundingBox::new(100.0, 40.0, 260.0, 400.0);
        let a = estimate_distance_cm("person", &bbox);
        let b = estimate_distance_cm("person", &bbox);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn vehicles_read_farther_than_pedestrians_for_same_box() {
        let bbox = square(120.0);
        assert!(estimate_distance_cm("car", &bbox) > estimate_distance_cm("person", &bbox));
    }
}
