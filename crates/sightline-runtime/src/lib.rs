//! `sightline-runtime` – the fusion pipeline.
//!
//! Wires the hardware sources, the perception helpers, the kernel's
//! bookkeeping and the speech arbitrator into one running system.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`FusionOrchestrator`][orchestrator::FusionOrchestrator]:
//!   owns the lifecycle, the two independent sampling loops, the
//!   performance and battery monitors, and routes every detection to the
//!   speaker, the tracker and the event bus.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod orchestrator;
pub mod telemetry;

pub use orchestrator::{FusionOrchestrator, OrchestratorConfig, OrchestratorStatus, ShutdownRequest, phrase};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
