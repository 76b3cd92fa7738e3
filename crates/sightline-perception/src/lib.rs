//! `sightline-perception` – geometry helpers for the vision path.
//!
//! Turns the 2-D output of an opaque detector into something the user can
//! act on: an approximate range in centimetres.
//!
//! # Modules
//!
//! - [`distance`] – [`DistanceEstimator`][distance::DistanceEstimator]:
//!   pure, per-class bounding-box-area heuristic for range estimation.

pub mod distance;

pub use distance::{ClassScale, DistanceClass, DistanceEstimator, estimate_distance_cm};
