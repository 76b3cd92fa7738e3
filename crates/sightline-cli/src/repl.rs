//! REPL – line-based control surface for a running pipeline.
//!
//! Supported slash-commands:
//!   /help                 – show this list
//!   /status               – pipeline, battery and speaker state
//!   /report [json]        – performance report
//!   /enable <channel>     – resume `ranging` (belt) or `vision` (hat)
//!   /disable <channel>    – park a channel
//!   /battery <percent>    – inject a battery reading
//!   /fp  /fn              – record a false positive / false negative
//!   /reset                – reset accuracy counters
//!   /say <text>           – speak arbitrary text
//!   /quit | /exit         – stop the pipeline and exit

use colored::Colorize;
use sightline_hal::sim::SimBatteryGauge;
use sightline_runtime::FusionOrchestrator;
use sightline_types::{Channel, Priority, SpeakerState};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Report { json: bool },
    Enable(Channel),
    Disable(Channel),
    Battery(f32),
    FalsePositive,
    FalseNegative,
    Reset,
    Say(String),
    Quit,
}

impl Command {
    /// Parse one input line.  The error is the message to show the user.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match head {
            "/help" => Ok(Command::Help),
            "/status" => Ok(Command::Status),
            "/report" => match rest {
                "" => Ok(Command::Report { json: false }),
                "json" => Ok(Command::Report { json: true }),
                other => Err(format!("unknown report format '{other}'")),
            },
            "/enable" => parse_channel(rest).map(Command::Enable),
            "/disable" => parse_channel(rest).map(Command::Disable),
            "/battery" => rest
                .parse::<f32>()
                .ok()
                .filter(|p| (0.0..=100.0).contains(p))
                .map(Command::Battery)
                .ok_or_else(|| format!("'{rest}' is not a percentage between 0 and 100")),
            "/fp" => Ok(Command::FalsePositive),
            "/fn" => Ok(Command::FalseNegative),
            "/reset" => Ok(Command::Reset),
            "/say" if !rest.is_empty() => Ok(Command::Say(rest.to_string())),
            "/say" => Err("nothing to say".to_string()),
            "/quit" | "/exit" => Ok(Command::Quit),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

fn parse_channel(raw: &str) -> Result<Channel, String> {
    if raw.is_empty() {
        return Err("which channel? ranging or vision".to_string());
    }
    raw.parse::<Channel>().map_err(|e| e.to_string())
}

/// What the REPL drives.
pub struct Session {
    pub orchestrator: Arc<FusionOrchestrator>,
    pub runtime: Handle,
    /// Present in simulated mode so `/battery` also moves the gauge.
    pub sim_battery: Option<SimBatteryGauge>,
    pub shutdown: Arc<AtomicBool>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(session: &Session) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if session.shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "sightline>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if session.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(Command::Quit) => {
                println!("{}", "Stopping pipeline …".dimmed());
                session.runtime.block_on(session.orchestrator.stop());
                println!("{}", "Goodbye.".green());
                session.shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => execute(session, cmd),
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn execute(session: &Session, cmd: Command) {
    let orch = &session.orchestrator;
    match cmd {
        Command::Help => cmd_help(),
        Command::Status => cmd_status(orch),
        Command::Report { json } => cmd_report(orch, json),
        Command::Enable(channel) => {
            if orch.enable(channel) {
                println!("  {} {} enabled", "✓".green(), channel.to_string().bold());
            } else {
                println!("  {} is already enabled", channel.to_string().bold());
            }
        }
        Command::Disable(channel) => {
            if orch.disable(channel) {
                println!("  {} {} disabled", "✓".green(), channel.to_string().bold());
            } else {
                println!("  {} is already disabled", channel.to_string().bold());
            }
        }
        Command::Battery(percent) => {
            if let Some(gauge) = &session.sim_battery {
                gauge.set_level(percent);
            }
            let t = orch.apply_battery_reading(percent);
            let state = orch.power().state();
            println!(
                "  Battery {:.1}% – tier {}{}",
                state.level,
                state.tier.to_string().yellow(),
                if state.power_save { ", power-save".to_string() } else { String::new() }
            );
            if t.shutdown_requested {
                println!("  {}", "Critical level reached, shutting down.".red().bold());
            }
        }
        Command::FalsePositive => {
            orch.tracker().record_false_positive();
            println!("  {} false positive recorded", "✓".green());
        }
        Command::FalseNegative => {
            orch.tracker().record_false_negative();
            println!("  {} false negative recorded", "✓".green());
        }
        Command::Reset => {
            orch.tracker().reset_accuracy();
            println!("  {} accuracy counters reset", "✓".green());
        }
        Command::Say(text) => {
            if let Err(e) = orch.say(text, Priority::Normal) {
                println!("{}: {}", "Speech error".red(), e);
            }
        }
        Command::Quit => {}
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Sightline Commands".bold().underline());
    println!("  {}             – pipeline, battery and speaker state", "/status".bold().cyan());
    println!("  {}      – performance report", "/report [json]".bold().cyan());
    println!("  {}    – resume ranging | vision", "/enable <ch>".bold().cyan());
    println!("  {}   – park ranging | vision", "/disable <ch>".bold().cyan());
    println!("  {}    – inject a battery reading", "/battery <%>".bold().cyan());
    println!("  {}            – record false positive / negative", "/fp  /fn".bold().cyan());
    println!("  {}              – reset accuracy counters", "/reset".bold().cyan());
    println!("  {}       – speak arbitrary text", "/say <text>".bold().cyan());
    println!("  {}        – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn on_off(enabled: bool) -> colored::ColoredString {
    if enabled { "on".green() } else { "off".red() }
}

fn cmd_status(orch: &FusionOrchestrator) {
    let s = orch.status();
    println!("{}", "Status".bold().underline());
    println!(
        "  Pipeline : {}{}",
        if s.running { "RUNNING".green().bold() } else { "STOPPED".red().bold() },
        s.uptime_secs.map(|u| format!(" ({u:.0}s)")).unwrap_or_default()
    );
    println!("  Ranging  : {}", on_off(s.ranging_enabled));
    println!("  Vision   : {}", on_off(s.vision_enabled));
    let remaining = match (s.charging, s.battery_hours_remaining) {
        (true, _) => ", charging".to_string(),
        (false, Some(hours)) => format!(", ~{hours:.1}h left"),
        (false, None) => String::new(),
    };
    println!(
        "  Battery  : {:.1}% ({}{remaining}){}",
        s.battery_level,
        s.battery_tier,
        if s.power_save { " – power-save".yellow().to_string() } else { String::new() }
    );
    let speaker = match &s.speaker {
        SpeakerState::Idle => "idle".dimmed().to_string(),
        SpeakerState::Speaking(a) => format!("speaking \"{}\"", a.text),
    };
    println!("  Speaker  : {speaker} (backlog {})", s.backlog_len);
    println!("  Detected : {}", s.total_detections);
}

fn cmd_report(orch: &FusionOrchestrator, json: bool) {
    let report = orch.report();
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => println!("{}: {}", "Report error".red(), e),
        }
        return;
    }

    println!("{}", "Performance Report".bold().underline());
    println!("  Uptime       : {:.0}s", report.uptime_secs);
    for op in &report.operations {
        println!(
            "  {:<8} n={:<5} mean={:>7.1}ms  p95={:>7.1}ms  max={:>7.1}ms",
            op.operation.to_string(),
            op.samples,
            op.mean_ms,
            op.p95_ms,
            op.max_ms
        );
    }
    let a = &report.accuracy;
    println!(
        "  Accuracy     : {:.1}% (precision {:.2}, recall {:.2}, F1 {:.2})",
        a.accuracy * 100.0,
        a.precision,
        a.recall,
        a.f1
    );
    println!(
        "  Detections   : {} ({} FP, {} FN)",
        a.total_detections, a.false_positives, a.false_negatives
    );
    println!("  Breaches     : {} over {:.0}ms", report.latency_breaches, report.max_latency_ms);
    if let (Some(cpu), Some(mem)) = (report.avg_cpu_percent, report.avg_memory_percent) {
        println!("  Resources    : cpu {cpu:.1}%  mem {mem:.1}%");
    }
    let check = |ok: bool| if ok { "✓".green() } else { "✗".red() };
    println!(
        "  Targets      : latency {}  accuracy {}",
        check(report.latency_within_budget),
        check(report.accuracy_on_target)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_commands_with_aliases() {
        assert_eq!(Command::parse("/enable vision"), Ok(Command::Enable(Channel::Vision)));
        assert_eq!(Command::parse("  /disable   belt "), Ok(Command::Disable(Channel::Ranging)));
        assert!(Command::parse("/enable").is_err());
        assert!(Command::parse("/enable radar").is_err());
    }

    #[test]
    fn parses_report_and_battery() {
        assert_eq!(Command::parse("/report"), Ok(Command::Report { json: false }));
        assert_eq!(Command::parse("/report json"), Ok(Command::Report { json: true }));
        assert!(Command::parse("/report xml").is_err());
        assert_eq!(Command::parse("/battery 18.5"), Ok(Command::Battery(18.5)));
        assert!(Command::parse("/battery 140").is_err());
        assert!(Command::parse("/battery lots").is_err());
    }

    #[test]
    fn say_keeps_the_whole_text() {
        assert_eq!(
            Command::parse("/say turn left  now"),
            Ok(Command::Say("turn left  now".to_string()))
        );
        assert!(Command::parse("/say").is_err());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(Command::parse("/launch").is_err());
        assert!(Command::parse("hello").is_err());
        assert_eq!(Command::parse("/exit"), Ok(Command::Quit));
    }
}
