//! [`FusionOrchestrator`] – lifecycle, sampling loops and event routing.
//!
//! While running, the orchestrator owns four Tokio tasks, a critical-battery
//! watcher and the speech actor:
//!
//! | Task | Cadence | Work |
//! |---|---|---|
//! | ranging loop | ranging profile | sample, time, route obstacles |
//! | vision loop | vision profile | sample, time, estimate range, route |
//! | performance monitor | `monitor_interval` | rolling mean, CPU/memory pressure |
//! | battery monitor | `battery_interval` | power tier, power-save, shutdown request |
//!
//! Each sampling cycle reads the current [`SamplingProfile`], runs the
//! blocking `sample()` call on the blocking pool inside a [`LatencyScope`],
//! routes every resulting event, and then sleeps for the profile's cycle
//! period.  Cancellation is observed at the top of each
//! cycle and during the sleep, never in the middle of a measurement.
//!
//! # Routing
//!
//! For every [`DetectionEvent`]:
//!
//! 1. vision events without a range get one from the [`DistanceEstimator`];
//! 2. obstacles are High priority, everything else Normal;
//! 3. objects below `announce_confidence` are counted but stay silent;
//! 4. a per-label cooldown suppresses immediate repeats of objects and
//!    signs; obstacles are announced on every reading;
//! 5. the phrase is handed to the [`SpeechArbitrator`], the detection is
//!    counted, and the event is published on the detections topic.
//!
//! # Critical battery
//!
//! A reading that crosses into the critical tier publishes
//! `ShutdownRequested` and wakes the watcher, which stops the loops, clears
//! the speaker and says [`CRITICAL_MESSAGE`] last.  Hosts learn about it
//! through [`FusionOrchestrator::critical_shutdown`].
//!
//! [`LatencyScope`]: sightline_kernel::LatencyScope

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use sightline_hal::{
    BatteryGauge, HardwareSet, RangingLimits, RangingSource, ResourceProbe, SensorSource, SpeechDevice,
    VisionSource,
};
use sightline_kernel::{
    BatteryCapacity, LatencyBreach, PerformanceReport, PerformanceTracker, PowerController, PowerProfiles,
    PowerThresholds, PowerTransition, TrackerConfig,
};
use sightline_middleware::{ArbitratorConfig, EventBus, SpeechArbitrator};
use sightline_perception::DistanceEstimator;
use sightline_types::{
    BatteryTier, Channel, DetectionEvent, DetectionKind, Event, EventPayload, LatencyRecorder, Operation, Priority,
    SamplingProfile, SightError, SpeakerState,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const READY_MESSAGE: &str = "System ready";
pub const BATTERY_WARNING_MESSAGE: &str = "Battery warning";
pub const BATTERY_LOW_MESSAGE: &str = "Battery low, please recharge";
pub const CRITICAL_MESSAGE: &str = "Critical battery level, shutting down";

type Shared<T> = Arc<Mutex<Box<T>>>;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slot(channel: Channel) -> usize {
    match channel {
        Channel::Ranging => 0,
        Channel::Vision => 1,
    }
}

/// The operation a channel's sampling cycle is timed under.
fn timed_operation(channel: Channel) -> Operation {
    match channel {
        Channel::Ranging => Operation::Obstacle,
        Channel::Vision => Operation::Object,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration and public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Objects below this confidence are counted but not spoken.
    pub announce_confidence: f32,
    /// Detections below this never leave the vision source.
    pub detector_confidence: f32,
    /// Minimum gap between two announcements of the same label.
    /// [`Duration::ZERO`] disables the cooldown.
    pub repeat_cooldown: Duration,
    pub monitor_interval: Duration,
    pub battery_interval: Duration,
    /// Upper bound on waiting for the final critical-battery message.
    pub shutdown_grace: Duration,
    /// Speak [`READY_MESSAGE`] on start.
    pub announce_startup: bool,
    pub ranging: RangingLimits,
    pub speech: ArbitratorConfig,
    pub tracker: TrackerConfig,
    pub thresholds: PowerThresholds,
    pub profiles: PowerProfiles,
    pub capacity: BatteryCapacity,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            announce_confidence: 0.7,
            detector_confidence: 0.5,
            repeat_cooldown: Duration::from_millis(1500),
            monitor_interval: Duration::from_secs(1),
            battery_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            announce_startup: true,
            ranging: RangingLimits::default(),
            speech: ArbitratorConfig::default(),
            tracker: TrackerConfig::default(),
            thresholds: PowerThresholds::default(),
            profiles: PowerProfiles::default(),
            capacity: BatteryCapacity::default(),
        }
    }
}

/// Raised when a reading crosses into the critical tier.  The running
/// pipeline acts on it by itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShutdownRequest {
    pub level: f32,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub ranging_enabled: bool,
    pub vision_enabled: bool,
    pub battery_level: f32,
    pub battery_tier: BatteryTier,
    pub power_save: bool,
    pub charging: bool,
    /// `None` while charging.
    pub battery_hours_remaining: Option<f32>,
    pub speaker: SpeakerState,
    pub backlog_len: usize,
    pub total_detections: u64,
    pub uptime_secs: Option<f64>,
}

/// Spoken text for a detection.  Distances are truncated to whole
/// centimetres.
pub fn phrase(event: &DetectionEvent) -> String {
    let cm = event.distance_cm.filter(|d| d.is_finite()).map(|d| d.max(0.0) as u32);
    let at = cm.map(|cm| format!(" at {cm} centimeters")).unwrap_or_default();
    match event.kind {
        DetectionKind::Obstacle => match cm {
            Some(cm) => format!("Obstacle detected at {cm} centimeters"),
            None => "Obstacle detected".to_string(),
        },
        DetectionKind::Sign => format!("Road sign detected: {}{at}", event.label),
        DetectionKind::Object => format!("Object detected: {}{at}", event.label),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared pipeline state
// ────────────────────────────────────────────────────────────────────────────

/// Everything the background tasks need, shared behind one `Arc`.
struct Pipeline {
    config: OrchestratorConfig,
    tracker: Arc<PerformanceTracker>,
    power: PowerController,
    estimator: DistanceEstimator,
    bus: EventBus,
    enabled: [watch::Sender<bool>; 2],
    cooldown: Option<DefaultKeyedRateLimiter<String>>,
    /// The running arbitrator, if any.
    speech: Mutex<Option<SpeechArbitrator>>,
    run: Mutex<Option<Run>>,
    /// Latest critical reading; the watcher wakes on every send.
    shutdown: watch::Sender<Option<ShutdownRequest>>,
    /// Set once a critical shutdown has finished.
    halted: watch::Sender<Option<ShutdownRequest>>,
}

impl Pipeline {
    fn publish(&self, source: &str, payload: EventPayload) {
        self.bus.publish(Event::new(format!("sightline-runtime::{source}"), payload));
    }

    fn speak(&self, text: &str, priority: Priority) {
        if let Some(speech) = lock(&self.speech).as_ref()
            && let Err(e) = speech.announce(text, priority)
        {
            debug!(error = %e, text, "announcement dropped");
        }
    }

    fn cooldown_allows(&self, event: &DetectionEvent) -> bool {
        if event.kind == DetectionKind::Obstacle {
            return true;
        }
        match &self.cooldown {
            None => true,
            Some(limiter) => {
                let key = format!("{}:{}", Operation::from(event.kind), event.label);
                limiter.check_key(&key).is_ok()
            }
        }
    }

    /// Publish the breaches of one finished cycle and route its events.
    fn finish_cycle(
        &self,
        channel: Channel,
        speech: &SpeechArbitrator,
        events: Vec<DetectionEvent>,
        breaches: Vec<LatencyBreach>,
    ) {
        for breach in breaches {
            self.publish(
                "performance",
                EventPayload::LatencyBreach {
                    operation: breach.operation,
                    ms: breach.ms,
                    threshold_ms: breach.threshold_ms,
                },
            );
        }
        for event in events {
            self.route(channel, speech, event);
        }
    }

    fn route(&self, channel: Channel, speech: &SpeechArbitrator, mut event: DetectionEvent) {
        if event.kind != DetectionKind::Obstacle
            && event.distance_cm.is_none()
            && let Some(bbox) = event.bbox
        {
            event.distance_cm = Some(self.estimator.estimate(&event.label, &bbox));
        }

        let priority = match event.kind {
            DetectionKind::Obstacle => Priority::High,
            DetectionKind::Object | DetectionKind::Sign => Priority::Normal,
        };
        let confident = event.kind != DetectionKind::Object || event.confidence >= self.config.announce_confidence;

        if confident && self.cooldown_allows(&event) {
            let text = phrase(&event);
            debug!(%channel, text = %text, ?priority, "announcing detection");
            if let Err(e) = speech.announce(text, priority) {
                debug!(%channel, error = %e, "speech unavailable");
            }
        }
        self.tracker.record_detection();
        self.publish(&channel.to_string(), EventPayload::Detection(event));
    }

    /// Feed one battery reading through the power controller and act on the
    /// resulting transition.  `charging` is `None` for injected levels.
    fn apply_battery_reading(&self, level: f32, charging: Option<bool>) -> PowerTransition {
        let transition = match charging {
            Some(charging) => self.power.update_reading(level, charging),
            None => self.power.update(level),
        };
        let state = self.power.state();

        if let Some((from, to)) = transition.tier_changed {
            self.publish(
                "battery",
                EventPayload::BatteryTierChanged {
                    level: state.level,
                    tier: to,
                },
            );
            if to < from {
                match to {
                    BatteryTier::Warning => self.speak(BATTERY_WARNING_MESSAGE, Priority::Normal),
                    BatteryTier::Low => self.speak(BATTERY_LOW_MESSAGE, Priority::Normal),
                    BatteryTier::Critical | BatteryTier::Normal => {}
                }
            }
        }
        if let Some(active) = transition.power_save_changed {
            self.publish("battery", EventPayload::PowerSaveChanged { active });
        }
        if transition.shutdown_requested {
            self.publish("battery", EventPayload::ShutdownRequested { level: state.level });
            self.shutdown.send_replace(Some(ShutdownRequest {
                level: state.level,
                requested_at: Utc::now(),
            }));
        }
        transition
    }

    /// Detach the current run, cancel its tasks and unpublish its speech
    /// handle so nothing new reaches the speaker.
    fn take_run(&self) -> Option<Run> {
        let run = lock(&self.run).take()?;
        run.cancel.cancel();
        *lock(&self.speech) = None;
        Some(run)
    }

    async fn shutdown_critical(&self, request: ShutdownRequest) -> Result<(), SightError> {
        let run = self.take_run().ok_or(SightError::NotRunning)?;
        warn!(level = request.level, "critical battery, shutting down");
        // The watcher may be the caller; it ends on its own once cancelled.
        let Run {
            tasks, speech, started, ..
        } = run;
        // No loop may announce after the final message.
        join_tasks(tasks).await;

        let _ = speech.stop();
        let _ = speech.announce(CRITICAL_MESSAGE, Priority::High);
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, speech.wait_idle()).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "final announcement cut short");
        }
        close_speech(speech, started).await;
        self.halted.send_replace(Some(request));
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background tasks
// ────────────────────────────────────────────────────────────────────────────

async fn sampling_loop(
    pipeline: Arc<Pipeline>,
    channel: Channel,
    source: Shared<dyn SensorSource>,
    speech: SpeechArbitrator,
    cancel: CancellationToken,
) {
    let mut enabled = pipeline.enabled[slot(channel)].subscribe();
    info!(%channel, "sampling loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if !*enabled.borrow_and_update() {
            debug!(%channel, "sampling loop parked");
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = enabled.changed() => if changed.is_err() { break },
            }
            continue;
        }

        let profile: SamplingProfile = pipeline.power.current_profile(channel);
        let src = Arc::clone(&source);
        let tracker = Arc::clone(&pipeline.tracker);
        let sampled = tokio::task::spawn_blocking(move || {
            let scope = tracker.scope(timed_operation(channel));
            let events = lock(&src).sample(&profile);
            let (ms, breach) = scope.finish();
            let mut breaches: Vec<_> = breach.into_iter().collect();
            if events.iter().any(|e| e.kind == DetectionKind::Sign) {
                breaches.extend(tracker.record_ms(Operation::Sign, ms));
            }
            (events, breaches)
        })
        .await;

        match sampled {
            Ok((events, breaches)) => pipeline.finish_cycle(channel, &speech, events, breaches),
            Err(e) => error!(%channel, error = %e, "sampling cycle failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(profile.cycle_period()) => {}
        }
    }
    info!(%channel, "sampling loop stopped");
}

async fn performance_monitor(pipeline: Arc<Pipeline>, probe: Shared<dyn ResourceProbe>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(pipeline.config.monitor_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(mean) = pipeline.tracker.rolling_detection_mean() {
            let threshold_ms = pipeline.tracker.config().max_latency_ms;
            if mean > threshold_ms {
                warn!(rolling_mean_ms = mean, threshold_ms, "detection latency above budget");
            } else {
                debug!(rolling_mean_ms = mean, threshold_ms, "detection latency");
            }
        }

        let p = Arc::clone(&probe);
        match tokio::task::spawn_blocking(move || lock(&p).sample()).await {
            Ok(Ok(usage)) => {
                for pressure in pipeline.tracker.record_resources(usage.cpu_percent, usage.memory_percent) {
                    pipeline.publish(
                        "performance",
                        EventPayload::ResourcePressure {
                            resource: pressure.resource.to_string(),
                            mean_percent: pressure.mean_percent,
                            limit_percent: pressure.limit_percent,
                        },
                    );
                }
            }
            Ok(Err(e)) => debug!(error = %e, "resource probe unavailable"),
            Err(e) => error!(error = %e, "resource probe failed"),
        }

        if let Some(limiter) = &pipeline.cooldown {
            limiter.retain_recent();
        }
    }
}

async fn battery_monitor(pipeline: Arc<Pipeline>, gauge: Shared<dyn BatteryGauge>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(pipeline.config.battery_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let g = Arc::clone(&gauge);
        match tokio::task::spawn_blocking(move || lock(&g).read()).await {
            Ok(Ok(reading)) => {
                debug!(level = reading.percent, charging = reading.charging, "battery reading");
                pipeline.apply_battery_reading(reading.percent, Some(reading.charging));
            }
            Ok(Err(e)) => warn!(error = %e, "battery read failed"),
            Err(e) => error!(error = %e, "battery monitor failed"),
        }
    }
}

/// Runs the critical shutdown for the request that wakes it, unless the run
/// is cancelled first.
async fn critical_watcher(
    pipeline: Arc<Pipeline>,
    mut requests: watch::Receiver<Option<ShutdownRequest>>,
    cancel: CancellationToken,
) {
    let request = tokio::select! {
        _ = cancel.cancelled() => return,
        changed = requests.changed() => match changed {
            Ok(()) => *requests.borrow_and_update(),
            Err(_) => return,
        },
    };
    if let Some(request) = request
        && let Err(e) = pipeline.shutdown_critical(request).await
    {
        debug!(error = %e, "critical shutdown skipped");
    }
}

async fn join_tasks(tasks: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "pipeline task ended abnormally");
        }
    }
}

async fn close_speech(speech: SpeechArbitrator, started: Instant) {
    speech.shutdown().await;
    info!(uptime_secs = started.elapsed().as_secs_f64(), "pipeline stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

struct Run {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    watcher: JoinHandle<()>,
    speech: SpeechArbitrator,
    started: Instant,
}

/// Owns the sources, the monitors and the speech actor for one device.
///
/// All methods take `&self`; share the orchestrator behind an `Arc` to
/// drive it from a REPL and a signal handler at once.
pub struct FusionOrchestrator {
    pipeline: Arc<Pipeline>,
    ranging: Shared<dyn SensorSource>,
    vision: Shared<dyn SensorSource>,
    battery: Shared<dyn BatteryGauge>,
    probe: Shared<dyn ResourceProbe>,
    speech_device: Arc<dyn SpeechDevice>,
}

impl FusionOrchestrator {
    pub fn new(hardware: HardwareSet, config: OrchestratorConfig) -> Self {
        Self::with_bus(hardware, config, EventBus::default())
    }

    /// Build with an existing bus so outside subscribers see pipeline events.
    pub fn with_bus(hardware: HardwareSet, config: OrchestratorConfig, bus: EventBus) -> Self {
        let HardwareSet {
            range_finder,
            detector,
            speech,
            battery,
            probe,
        } = hardware;

        let ranging: Box<dyn SensorSource> = Box::new(RangingSource::new(range_finder, config.ranging));
        let vision: Box<dyn SensorSource> = Box::new(VisionSource::new(detector, config.detector_confidence));
        let cooldown = Quota::with_period(config.repeat_cooldown).map(RateLimiter::keyed);

        let pipeline = Pipeline {
            tracker: Arc::new(PerformanceTracker::new(config.tracker.clone())),
            power: PowerController::new(config.thresholds, config.profiles).with_capacity(config.capacity),
            estimator: DistanceEstimator::default(),
            bus,
            enabled: [watch::channel(true).0, watch::channel(true).0],
            cooldown,
            speech: Mutex::new(None),
            run: Mutex::new(None),
            shutdown: watch::channel(None).0,
            halted: watch::channel(None).0,
            config,
        };

        Self {
            pipeline: Arc::new(pipeline),
            ranging: Arc::new(Mutex::new(ranging)),
            vision: Arc::new(Mutex::new(vision)),
            battery: Arc::new(Mutex::new(battery)),
            probe: Arc::new(Mutex::new(probe)),
            speech_device: speech,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the loops, the monitors, the critical-battery watcher and the
    /// speech actor.
    ///
    /// # Errors
    ///
    /// [`SightError::AlreadyRunning`] when already started, and
    /// [`SightError::Config`] outside a Tokio runtime.
    pub fn start(&self) -> Result<(), SightError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SightError::Config(format!("start() needs a Tokio runtime: {e}")))?;
        let mut run = lock(&self.pipeline.run);
        if run.is_some() {
            return Err(SightError::AlreadyRunning);
        }
        self.pipeline.halted.send_replace(None);

        let recorder: Arc<dyn LatencyRecorder> = self.pipeline.tracker.clone();
        let speech = SpeechArbitrator::spawn(
            Arc::clone(&self.speech_device),
            self.pipeline.config.speech.clone(),
            Some(recorder),
        );
        *lock(&self.pipeline.speech) = Some(speech.clone());

        let cancel = CancellationToken::new();
        let tasks = vec![
            (
                "ranging",
                runtime.spawn(sampling_loop(
                    Arc::clone(&self.pipeline),
                    Channel::Ranging,
                    Arc::clone(&self.ranging),
                    speech.clone(),
                    cancel.clone(),
                )),
            ),
            (
                "vision",
                runtime.spawn(sampling_loop(
                    Arc::clone(&self.pipeline),
                    Channel::Vision,
                    Arc::clone(&self.vision),
                    speech.clone(),
                    cancel.clone(),
                )),
            ),
            (
                "performance",
                runtime.spawn(performance_monitor(
                    Arc::clone(&self.pipeline),
                    Arc::clone(&self.probe),
                    cancel.clone(),
                )),
            ),
            (
                "battery",
                runtime.spawn(battery_monitor(
                    Arc::clone(&self.pipeline),
                    Arc::clone(&self.battery),
                    cancel.clone(),
                )),
            ),
        ];

        // Subscribed here so a reading that lands during start is not missed.
        let watcher = runtime.spawn(critical_watcher(
            Arc::clone(&self.pipeline),
            self.pipeline.shutdown.subscribe(),
            cancel.clone(),
        ));

        if self.pipeline.config.announce_startup {
            let _ = speech.announce(READY_MESSAGE, Priority::Normal);
        }
        *run = Some(Run {
            cancel,
            tasks,
            watcher,
            speech,
            started: Instant::now(),
        });
        info!(
            ranging = self.is_enabled(Channel::Ranging),
            vision = self.is_enabled(Channel::Vision),
            "pipeline started"
        );
        Ok(())
    }

    /// Cancel every loop, hard-stop the speaker and wait for all tasks.
    /// Calling it while stopped does nothing.
    pub async fn stop(&self) {
        let Some(run) = self.pipeline.take_run() else {
            return;
        };
        let _ = run.speech.stop();
        let Run {
            tasks,
            watcher,
            speech,
            started,
            ..
        } = run;
        join_tasks(tasks).await;
        join_tasks(vec![("critical-watcher", watcher)]).await;
        close_speech(speech, started).await;
    }

    /// Critical-battery shutdown: stop sampling, drop queued speech, say
    /// [`CRITICAL_MESSAGE`] and wait (bounded) for it before tearing down.
    /// The running pipeline does this by itself on a critical reading.
    ///
    /// # Errors
    ///
    /// [`SightError::NotRunning`] when the pipeline is already stopped.
    pub async fn shutdown_critical(&self, request: ShutdownRequest) -> Result<(), SightError> {
        self.pipeline.shutdown_critical(request).await
    }

    /// Resolves once a critical-battery shutdown of the current (or last)
    /// run has finished.
    pub async fn critical_shutdown(&self) -> Option<ShutdownRequest> {
        let mut halted = self.pipeline.halted.subscribe();
        let request = halted.wait_for(Option::is_some).await.ok()?;
        *request
    }

    pub fn is_running(&self) -> bool {
        lock(&self.pipeline.run).is_some()
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Resume `channel`'s loop.  Returns `false` when it was already on.
    pub fn enable(&self, channel: Channel) -> bool {
        self.set_enabled(channel, true)
    }

    /// Park `channel`'s loop after its current cycle.  Returns `false` when
    /// it was already off.
    pub fn disable(&self, channel: Channel) -> bool {
        self.set_enabled(channel, false)
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        *self.pipeline.enabled[slot(channel)].borrow()
    }

    fn set_enabled(&self, channel: Channel, on: bool) -> bool {
        let previous = self.pipeline.enabled[slot(channel)].send_replace(on);
        if previous == on {
            return false;
        }
        info!(%channel, enabled = on, "channel toggled");
        self.pipeline
            .publish("control", EventPayload::ChannelToggled { channel, enabled: on });
        let state = if on { "enabled" } else { "disabled" };
        self.pipeline
            .speak(&format!("{} {state}", channel.spoken_name()), Priority::Normal);
        true
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Speak arbitrary text through the arbitrator.
    ///
    /// # Errors
    ///
    /// [`SightError::NotRunning`] when the pipeline is stopped.
    pub fn say(&self, text: impl Into<String>, priority: Priority) -> Result<(), SightError> {
        match lock(&self.pipeline.speech).as_ref() {
            Some(speech) => speech.announce(text, priority),
            None => Err(SightError::NotRunning),
        }
    }

    /// Handle to the running speech arbitrator.
    pub fn speech(&self) -> Option<SpeechArbitrator> {
        lock(&self.pipeline.speech).clone()
    }

    /// Apply a battery level now instead of waiting for the monitor.
    pub fn apply_battery_reading(&self, level: f32) -> PowerTransition {
        self.pipeline.apply_battery_reading(level, None)
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.pipeline.tracker
    }

    pub fn power(&self) -> &PowerController {
        &self.pipeline.power
    }

    pub fn bus(&self) -> &EventBus {
        &self.pipeline.bus
    }

    pub fn report(&self) -> PerformanceReport {
        self.pipeline.tracker.snapshot()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let uptime_secs = lock(&self.pipeline.run).as_ref().map(|r| r.started.elapsed().as_secs_f64());
        let speech = self.speech();
        let power = self.pipeline.power.state();
        OrchestratorStatus {
            running: uptime_secs.is_some(),
            ranging_enabled: self.is_enabled(Channel::Ranging),
            vision_enabled: self.is_enabled(Channel::Vision),
            battery_level: power.level,
            battery_tier: power.tier,
            power_save: power.power_save,
            charging: power.charging,
            battery_hours_remaining: power.hours_remaining,
            speaker: speech.as_ref().map(SpeechArbitrator::state).unwrap_or_default(),
            backlog_len: speech.as_ref().map_or(0, SpeechArbitrator::backlog_len),
            total_detections: self.pipeline.tracker.total_detections(),
            uptime_secs,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_middleware::Topic;
    use sightline_hal::sim::{SimBatteryGauge, SimDetector, SimResourceProbe, SimRig, SimSpeechDevice};
    use sightline_hal::{RangeFinder, ResourceUsage};
    use sightline_hal::vision::RawDetection;
    use sightline_perception::estimate_distance_cm;
    use sightline_types::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Ranging and vision at 20 ms so tests see many cycles quickly.
    fn fast_profiles() -> PowerProfiles {
        let fast = SamplingProfile {
            interval: Duration::from_millis(20),
            frame_skip: 1,
            reduced_processing: false,
        };
        PowerProfiles {
            ranging_normal: fast,
            ranging_save: fast,
            vision_normal: fast,
            vision_save: fast,
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            announce_startup: false,
            repeat_cooldown: Duration::ZERO,
            profiles: fast_profiles(),
            ..OrchestratorConfig::default()
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    struct CountingFinder {
        calls: Arc<AtomicUsize>,
    }

    impl RangeFinder for CountingFinder {
        fn id(&self) -> &str {
            "counting"
        }

        fn measure(&mut self) -> Result<Option<f32>, SightError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    struct CountingDetector {
        calls: Arc<AtomicUsize>,
    }

    impl sightline_hal::ObjectDetector for CountingDetector {
        fn id(&self) -> &str {
            "counting"
        }

        fn detect(
            &mut self,
            _quality: sightline_hal::DetectionQuality,
        ) -> Result<Vec<RawDetection>, SightError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[test]
    fn phrases_match_detection_kind() {
        assert_eq!(phrase(&DetectionEvent::obstacle(42.7)), "Obstacle detected at 42 centimeters");
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let sign = DetectionEvent::visual(DetectionKind::Sign, "stop sign", 0.9, bbox);
        assert_eq!(phrase(&sign), "Road sign detected: stop sign");
        assert_eq!(
            phrase(&sign.with_distance(310.2)),
            "Road sign detected: stop sign at 310 centimeters"
        );
        let object = DetectionEvent::visual(DetectionKind::Object, "person", 0.9, bbox).with_distance(88.0);
        assert_eq!(phrase(&object), "Object detected: person at 88 centimeters");
    }

    #[tokio::test]
    async fn obstacles_are_announced_and_published() {
        let speaker = Arc::new(SimSpeechDevice::instant());
        let hw = SimRig::new()
            .with_obstacle_readings(vec![Some(42.0)])
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(hw, config());
        let mut detections = orch.bus().subscribe_to(Topic::Detections);

        orch.start().unwrap();
        let event = tokio::time::timeout(TIMEOUT, detections.recv())
            .await
            .unwrap()
            .expect("bus open");
        match event.payload {
            EventPayload::Detection(d) => {
                assert_eq!(d.kind, DetectionKind::Obstacle);
                assert_eq!(d.distance_cm, Some(42.0));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        eventually("obstacle announcement", || {
            speaker
                .completed()
                .iter()
                .any(|t| t == "Obstacle detected at 42 centimeters")
        })
        .await;
        assert!(orch.tracker().total_detections() >= 1);
        assert!(!orch.tracker().samples(Operation::Obstacle).is_empty());
        orch.stop().await;
    }

    #[tokio::test]
    async fn vision_events_get_range_and_low_confidence_stays_silent() {
        let speaker = Arc::new(SimSpeechDevice::instant());
        let sign_box = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let hw = SimRig::new()
            .with_frames(vec![vec![
                RawDetection::new("stop sign", 0.9, sign_box),
                RawDetection::new("dog", 0.6, sign_box),
            ]])
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(hw, config());
        orch.disable(Channel::Ranging);
        orch.start().unwrap();

        let expected_cm = estimate_distance_cm("stop sign", &sign_box) as u32;
        let expected = format!("Road sign detected: stop sign at {expected_cm} centimeters");
        eventually("sign announcement", || speaker.completed().contains(&expected)).await;
        eventually("sign latency", || !orch.tracker().samples(Operation::Sign).is_empty()).await;

        assert!(speaker.started().iter().all(|t| !t.contains("dog")));
        // Both detections are counted, spoken or not.
        assert!(orch.tracker().total_detections() >= 2);
        orch.stop().await;
    }

    #[tokio::test]
    async fn repeat_cooldown_suppresses_duplicate_signs() {
        let speaker = Arc::new(SimSpeechDevice::instant());
        let hw = SimRig::new()
            .with_frames(vec![vec![RawDetection::new(
                "stop sign",
                0.9,
                BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            )]])
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                repeat_cooldown: Duration::from_secs(30),
                ..config()
            },
        );
        orch.disable(Channel::Ranging);
        orch.start().unwrap();
        eventually("several cycles", || orch.tracker().total_detections() >= 5).await;
        orch.stop().await;

        let spoken = speaker.started().iter().filter(|t| t.starts_with("Road sign")).count();
        assert_eq!(spoken, 1);
    }

    #[tokio::test]
    async fn approaching_obstacle_is_announced_at_every_range() {
        let speaker = Arc::new(SimSpeechDevice::instant());
        let hw = SimRig::new()
            .with_obstacle_readings(vec![Some(90.0), Some(60.0), Some(30.0), Some(10.0)])
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                repeat_cooldown: Duration::from_secs(30),
                ..config()
            },
        );
        orch.disable(Channel::Vision);
        orch.start().unwrap();

        eventually("every range spoken", || {
            let started = speaker.started();
            [90, 60, 30, 10]
                .iter()
                .all(|cm| started.contains(&format!("Obstacle detected at {cm} centimeters")))
        })
        .await;
        orch.stop().await;
    }

    #[tokio::test]
    async fn disabling_vision_leaves_ranging_running() {
        let ranging_calls = Arc::new(AtomicUsize::new(0));
        let vision_calls = Arc::new(AtomicUsize::new(0));
        let hw = SimRig::new()
            .with_range_finder(Box::new(CountingFinder {
                calls: ranging_calls.clone(),
            }))
            .with_detector(Box::new(CountingDetector {
                calls: vision_calls.clone(),
            }))
            .build();
        let orch = FusionOrchestrator::new(hw, config());
        orch.start().unwrap();
        eventually("vision cycles", || vision_calls.load(Ordering::SeqCst) >= 3).await;

        assert!(orch.disable(Channel::Vision));
        assert!(!orch.disable(Channel::Vision));
        // Let an in-flight cycle drain.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let vision_parked = vision_calls.load(Ordering::SeqCst);
        let ranging_before = ranging_calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(vision_calls.load(Ordering::SeqCst), vision_parked);
        assert!(ranging_calls.load(Ordering::SeqCst) >= ranging_before + 3);

        assert!(orch.enable(Channel::Vision));
        eventually("vision resumed", || vision_calls.load(Ordering::SeqCst) > vision_parked).await;
        assert!(orch.status().vision_enabled);
        orch.stop().await;
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_is_idempotent() {
        let orch = FusionOrchestrator::new(SimRig::new().build(), config());
        orch.start().unwrap();
        assert_eq!(orch.start(), Err(SightError::AlreadyRunning));
        orch.stop().await;
        orch.stop().await;
        assert!(!orch.is_running());
        assert_eq!(orch.say("hello", Priority::Normal), Err(SightError::NotRunning));

        // A stopped pipeline can be started again.
        orch.start().unwrap();
        assert!(orch.is_running());
        orch.stop().await;
    }

    #[tokio::test]
    async fn stop_mid_speech_leaves_speaker_idle() {
        let speaker = Arc::new(SimSpeechDevice::new(Duration::from_millis(50)));
        let hw = SimRig::new().with_speech(speaker.clone()).build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                announce_startup: true,
                ..config()
            },
        );
        orch.start().unwrap();
        orch.say("and then some more words", Priority::Normal).unwrap();
        eventually("speaker busy", || speaker.is_playing()).await;

        orch.stop().await;
        let status = orch.status();
        assert!(!status.running);
        assert_eq!(status.speaker, SpeakerState::Idle);
        assert_eq!(status.backlog_len, 0);
        assert!(!speaker.is_playing());
    }

    #[tokio::test]
    async fn low_battery_enters_power_save_and_warns() {
        let speaker = Arc::new(SimSpeechDevice::instant());
        let hw = SimRig::new()
            .with_battery(Box::new(SimBatteryGauge::new(25.0).with_drain(0.0)))
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                battery_interval: Duration::from_millis(20),
                ..config()
            },
        );
        let mut power_events = orch.bus().subscribe_to(Topic::Power);
        orch.start().unwrap();

        eventually("power save", || orch.status().power_save).await;
        assert_eq!(orch.status().battery_tier, BatteryTier::Warning);
        eventually("battery warning", || {
            speaker.completed().iter().any(|t| t == BATTERY_WARNING_MESSAGE)
        })
        .await;

        let mut saw_power_save = false;
        while let Some(event) = power_events.try_recv() {
            saw_power_save |= matches!(event.payload, EventPayload::PowerSaveChanged { active: true });
        }
        assert!(saw_power_save);
        orch.stop().await;
    }

    #[tokio::test]
    async fn critical_battery_shuts_down_and_speaks_last() {
        let speaker = Arc::new(SimSpeechDevice::new(Duration::from_millis(1)));
        let gauge = SimBatteryGauge::new(60.0).with_drain(0.0);
        let hw = SimRig::new()
            .with_battery(Box::new(gauge.clone()))
            .with_obstacle_readings(vec![Some(50.0)])
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                battery_interval: Duration::from_millis(20),
                ..config()
            },
        );
        let mut power_events = orch.bus().subscribe_to(Topic::Power);
        orch.start().unwrap();
        eventually("first battery reading", || orch.status().battery_level == 60.0).await;

        gauge.set_level(5.0);
        let request = tokio::time::timeout(TIMEOUT, orch.critical_shutdown())
            .await
            .expect("pipeline halted")
            .expect("halt recorded");
        assert_eq!(request.level, 5.0);

        let status = orch.status();
        assert!(!status.running);
        assert_eq!(status.speaker, SpeakerState::Idle);
        assert_eq!(speaker.completed().last().map(String::as_str), Some(CRITICAL_MESSAGE));
        assert_eq!(orch.shutdown_critical(request).await, Err(SightError::NotRunning));

        let mut saw_request = false;
        while let Some(event) = power_events.try_recv() {
            saw_request |= matches!(event.payload, EventPayload::ShutdownRequested { .. });
        }
        assert!(saw_request);
    }

    #[tokio::test]
    async fn injected_critical_level_stops_without_a_host() {
        let speaker = Arc::new(SimSpeechDevice::instant());
        let hw = SimRig::new()
            .with_obstacle_readings(vec![Some(70.0)])
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(hw, config());
        orch.start().unwrap();
        eventually("sampling", || orch.tracker().total_detections() >= 2).await;

        assert!(orch.apply_battery_reading(5.0).shutdown_requested);
        eventually("pipeline stopped", || !orch.is_running()).await;
        eventually("final message", || {
            speaker.completed().last().map(String::as_str) == Some(CRITICAL_MESSAGE)
        })
        .await;

        // Nothing samples or speaks after the halt.
        let detections = orch.tracker().total_detections();
        let spoken = speaker.started().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orch.tracker().total_detections(), detections);
        assert_eq!(speaker.started().len(), spoken);

        // A restarted pipeline clears the halt.
        orch.apply_battery_reading(80.0);
        orch.start().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), orch.critical_shutdown())
                .await
                .is_err()
        );
        orch.stop().await;
    }

    #[tokio::test]
    async fn panicking_source_does_not_kill_its_loop() {
        struct Flaky {
            calls: usize,
        }
        impl RangeFinder for Flaky {
            fn id(&self) -> &str {
                "flaky"
            }
            fn measure(&mut self) -> Result<Option<f32>, SightError> {
                self.calls += 1;
                if self.calls == 1 {
                    panic!("driver bug");
                }
                Ok(Some(25.0))
            }
        }

        let speaker = Arc::new(SimSpeechDevice::instant());
        let hw = SimRig::new()
            .with_range_finder(Box::new(Flaky { calls: 0 }))
            .with_speech(speaker.clone())
            .build();
        let orch = FusionOrchestrator::new(hw, config());
        orch.start().unwrap();
        eventually("recovered obstacle", || {
            speaker.completed().iter().any(|t| t.starts_with("Obstacle"))
        })
        .await;
        orch.stop().await;
    }

    #[tokio::test]
    async fn resource_pressure_is_published() {
        let hw = SimRig::new()
            .with_probe(Box::new(SimResourceProbe::new(ResourceUsage {
                cpu_percent: 97.0,
                memory_percent: 20.0,
            })))
            .build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                monitor_interval: Duration::from_millis(10),
                ..config()
            },
        );
        let mut perf = orch.bus().subscribe_to(Topic::Performance);
        orch.start().unwrap();

        let event = tokio::time::timeout(TIMEOUT, perf.recv()).await.unwrap().unwrap();
        match event.payload {
            EventPayload::ResourcePressure { resource, .. } => assert_eq!(resource, "cpu"),
            other => panic!("unexpected payload {other:?}"),
        }
        orch.stop().await;
    }

    #[tokio::test]
    async fn slow_detector_breach_reaches_the_bus() {
        let hw = SimRig::new()
            .with_detector(Box::new(SimDetector::empty().with_delay(Duration::from_millis(40))))
            .build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                tracker: TrackerConfig {
                    max_latency_ms: 10.0,
                    ..TrackerConfig::default()
                },
                ..config()
            },
        );
        orch.disable(Channel::Ranging);
        let mut perf = orch.bus().subscribe_to(Topic::Performance);
        orch.start().unwrap();

        let event = tokio::time::timeout(TIMEOUT, perf.recv()).await.unwrap().unwrap();
        match event.payload {
            EventPayload::LatencyBreach { operation, ms, threshold_ms } => {
                assert_eq!(operation, Operation::Object);
                assert!(ms >= threshold_ms);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        orch.stop().await;
        assert!(orch.report().latency_breaches >= 1);
    }

    #[test]
    fn status_serialises_for_json_reports() {
        let orch = FusionOrchestrator::new(SimRig::new().build(), config());
        let json = serde_json::to_value(orch.status()).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["speaker"]["state"], "idle");
        assert_eq!(json["battery_tier"], "normal");
        assert_eq!(json["battery_hours_remaining"], 10.0);
        assert_eq!(json["charging"], false);
    }

    #[tokio::test]
    async fn status_tracks_charging_and_remaining_hours() {
        let gauge = SimBatteryGauge::new(50.0).with_drain(0.0);
        let hw = SimRig::new().with_battery(Box::new(gauge.clone())).build();
        let orch = FusionOrchestrator::new(
            hw,
            OrchestratorConfig {
                battery_interval: Duration::from_millis(20),
                ..config()
            },
        );
        orch.start().unwrap();
        eventually("discharging estimate", || {
            orch.status().battery_hours_remaining == Some(5.0)
        })
        .await;

        gauge.set_charging(true);
        eventually("charging", || orch.status().charging).await;
        assert_eq!(orch.status().battery_hours_remaining, None);
        orch.stop().await;
    }
}
