//! Terminal stand-in for the speaker in simulated mode.

use colored::Colorize;
use sightline_hal::sim::SimSpeechDevice;
use sightline_hal::{SpeechDevice, SpeechOutcome};
use sightline_types::SightError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Prints each utterance and then "plays" it at roughly speaking pace.
pub struct ConsoleSpeech {
    inner: SimSpeechDevice,
}

impl ConsoleSpeech {
    pub fn new() -> Self {
        Self {
            inner: SimSpeechDevice::new(Duration::from_millis(60)),
        }
    }
}

impl SpeechDevice for ConsoleSpeech {
    fn id(&self) -> &str {
        "console"
    }

    fn speak(&self, text: &str, interrupt: &CancellationToken) -> Result<SpeechOutcome, SightError> {
        if interrupt.is_cancelled() {
            return Ok(SpeechOutcome::Interrupted);
        }
        println!("\r  {} {}", "🔊".bold(), text.bold().magenta());
        let outcome = self.inner.speak(text, interrupt)?;
        if outcome == SpeechOutcome::Interrupted {
            println!("\r  {} {}", "✂".dimmed(), "interrupted".dimmed());
        }
        Ok(outcome)
    }
}
