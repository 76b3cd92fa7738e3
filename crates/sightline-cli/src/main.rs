//! `sightline-cli` – host binary for the Sightline wearable pipeline.
//!
//! It:
//!
//! 1. Loads `~/.sightline/config.toml`, writing the defaults on first run.
//! 2. Initialises tracing (`SIGHTLINE_LOG_FORMAT=json` for JSON lines,
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` for span export).
//! 3. Builds the hardware set (simulated or host) and starts the
//!    [`FusionOrchestrator`].
//! 4. Reports power alerts and the critical-battery halt.
//! 5. Drops the user into an **interactive REPL**; **Ctrl-C** stops the
//!    pipeline and exits.

mod config;
mod repl;
mod speaker;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use config::{Config, HardwareMode};
use sightline_hal::sim::{SimBatteryGauge, SimDetector, SimRangeFinder, SimRig};
use sightline_hal::{
    BatteryGauge, CommandSpeechDevice, HardwareSet, ProcfsResourceProbe, RawDetection, SysfsBatteryGauge,
};
use sightline_middleware::Topic;
use sightline_runtime::{FusionOrchestrator, init_tracing};
use sightline_types::{BoundingBox, EventPayload};

fn main() {
    // ── Configuration ─────────────────────────────────────────────────────
    let (cfg, first_run) = match config::load() {
        Ok(Some(cfg)) => (cfg, false),
        Ok(None) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            (cfg, true)
        }
        Err(e) => {
            eprintln!("{}: {} – using defaults", "Config error".red(), e);
            (Config::default(), false)
        }
    };

    // ── Structured logging ────────────────────────────────────────────────
    let _tracing = init_tracing("sightline", cfg.log_format());

    print_banner();
    if first_run {
        match config::save(&cfg) {
            Ok(()) => println!(
                "  {} Default config written to {}",
                "✓".green().bold(),
                config::config_path().display().to_string().bold()
            ),
            Err(e) => println!("{}: {}", "Error saving config".red(), e),
        }
    } else {
        println!(
            "  Config loaded from {}",
            config::config_path().display().to_string().bold()
        );
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    // ── Pipeline ──────────────────────────────────────────────────────────
    let (hardware, sim_battery) = build_hardware(&cfg);
    println!(
        "  Hardware: {} (speech {}, battery {})",
        cfg.hardware.to_string().bold(),
        hardware.speech.id().yellow(),
        hardware.battery.id().yellow()
    );
    let orchestrator = Arc::new(FusionOrchestrator::new(hardware, cfg.orchestrator()));
    {
        let _enter = runtime.enter();
        if let Err(e) = orchestrator.start() {
            eprintln!("{}: {}", "Failed to start pipeline".red(), e);
            std::process::exit(1);
        }
    }
    println!("  {} Pipeline {}.", "✓".green().bold(), "RUNNING".green().bold());

    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Critical-battery halt ─────────────────────────────────────────────
    {
        let orch = Arc::clone(&orchestrator);
        let shutdown = Arc::clone(&shutdown);
        runtime.spawn(async move {
            if let Some(request) = orch.critical_shutdown().await {
                shutdown.store(true, Ordering::SeqCst);
                println!();
                println!(
                    "{}",
                    format!("⚠  Battery critical ({:.1}%) – pipeline stopped.", request.level)
                        .red()
                        .bold()
                );
                println!("{}", "  Press Enter to exit.".yellow());
            }
        });
    }

    // ── Power alerts ──────────────────────────────────────────────────────
    {
        let mut power = orchestrator.bus().subscribe_to(Topic::Power);
        runtime.spawn(async move {
            while let Some(event) = power.recv().await {
                match event.payload {
                    EventPayload::BatteryTierChanged { level, tier } => {
                        println!("\r  {} battery {:.1}% → {}", "⚡".yellow(), level, tier.to_string().yellow());
                    }
                    EventPayload::PowerSaveChanged { active } => {
                        let mode = if active { "entered" } else { "left" };
                        println!("\r  {} power-save {}", "⚡".yellow(), mode.bold());
                    }
                    _ => {}
                }
            }
        });
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    {
        let orch = Arc::clone(&orchestrator);
        let handle = runtime.handle().clone();
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – stopping pipeline …".yellow().bold());
            shutdown.store(true, Ordering::SeqCst);
            handle.block_on(orch.stop());
            println!("{}", "  ✓ Exiting Sightline.".green());
            std::process::exit(0);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let session = repl::Session {
        orchestrator: Arc::clone(&orchestrator),
        runtime: runtime.handle().clone(),
        sim_battery,
        shutdown,
    };
    repl::run(&session);

    runtime.block_on(orchestrator.stop());
    info!("sightline exited");
}

// ─────────────────────────────────────────────────────────────────────────────
// Hardware
// ─────────────────────────────────────────────────────────────────────────────

/// Scripted walk past a few obstacles, people and signs.
fn demo_sensors() -> (SimRangeFinder, SimDetector) {
    let readings = vec![None, Some(250.0), Some(95.0), Some(62.0), Some(40.0), None, None, Some(180.0)];
    let person = RawDetection::new("person", 0.91, BoundingBox::new(220.0, 80.0, 380.0, 420.0));
    let stop = RawDetection::new("stop sign", 0.84, BoundingBox::new(500.0, 40.0, 560.0, 100.0));
    let dog = RawDetection::new("dog", 0.58, BoundingBox::new(40.0, 300.0, 140.0, 400.0));
    let car = RawDetection::new("car", 0.77, BoundingBox::new(0.0, 200.0, 260.0, 360.0));
    let frames = vec![vec![], vec![person.clone()], vec![person, dog], vec![], vec![stop], vec![car], vec![]];
    (SimRangeFinder::new(readings), SimDetector::new(frames))
}

/// Returns the hardware and, in simulated mode, a handle on the battery.
fn build_hardware(cfg: &Config) -> (HardwareSet, Option<SimBatteryGauge>) {
    let (finder, detector) = demo_sensors();
    let sim_battery = SimBatteryGauge::new(cfg.sim_battery_level).with_drain(cfg.sim_battery_drain);
    let rig = SimRig::new()
        .with_range_finder(Box::new(finder))
        .with_detector(Box::new(detector));

    match cfg.hardware {
        HardwareMode::Sim => {
            let hardware = rig
                .with_speech(Arc::new(speaker::ConsoleSpeech::new()))
                .with_battery(Box::new(sim_battery.clone()))
                .build();
            (hardware, Some(sim_battery))
        }
        HardwareMode::Host => {
            let (battery, sim_battery) = match SysfsBatteryGauge::discover() {
                Some(gauge) => (Box::new(gauge) as Box<dyn BatteryGauge>, None),
                None => {
                    warn!("no battery found under /sys/class/power_supply, simulating one");
                    (Box::new(sim_battery.clone()) as Box<dyn BatteryGauge>, Some(sim_battery))
                }
            };
            let speech = CommandSpeechDevice::new(cfg.speech_program.clone(), cfg.speech_args.clone());
            let hardware = rig
                .with_speech(Arc::new(speech))
                .with_battery(battery)
                .with_probe(Box::new(ProcfsResourceProbe::new()))
                .build();
            (hardware, sim_battery)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _____ _       __    __  ___          "#.bold().cyan());
    println!("{}", r#"  / ___/(_)___ _/ /_  / /_/ (_)___  ___ "#.bold().cyan());
    println!("{}", r#"  \__ \/ / __ `/ __ \/ __/ / / __ \/ _ \"#.bold().cyan());
    println!("{}", r#" ___/ / / /_/ / / / / /_/ / / / / /  __/"#.bold().cyan());
    println!("{}", r#"/____/_/\__, /_/ /_/\__/_/_/_/ /_/\___/ "#.bold().cyan());
    println!("{}", r#"       /____/                           "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Sightline".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Wearable obstacle and sign announcer");
    println!();
}
