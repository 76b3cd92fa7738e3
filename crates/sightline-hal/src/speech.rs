//! Audio output: the [`SpeechDevice`] trait and an external-program driver.
//!
//! A device plays one utterance per [`SpeechDevice::speak`] call and blocks
//! until playback finishes.  The caller hands in a per-utterance
//! [`CancellationToken`]; cancelling it is the "interrupt current playback"
//! primitive.  A token cancelled before playback starts must make `speak`
//! return [`SpeechOutcome::Interrupted`] without producing sound, so an
//! interrupt can never be lost in the gap between scheduling and playback.

use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use sightline_types::SightError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often a blocking device polls its interrupt token.
pub const INTERRUPT_POLL: Duration = Duration::from_millis(5);

/// How a call to [`SpeechDevice::speak`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    Completed,
    Interrupted,
}

/// A text-to-speech output device.
///
/// Voice, rate and volume are configured on the device itself.
pub trait SpeechDevice: Send + Sync {
    /// Stable identifier, e.g. `"espeak"`.
    fn id(&self) -> &str;

    /// Speak `text`, blocking until playback completes or `interrupt` fires.
    ///
    /// # Errors
    ///
    /// Returns [`SightError::SpeechDevice`] when playback could not be
    /// started or the backend reported a failure.
    fn speak(&self, text: &str, interrupt: &CancellationToken) -> Result<SpeechOutcome, SightError>;
}

/// Speaks by running an external program (e.g. `espeak` or `say`) with the
/// text as its last argument.  Interrupting kills the child process.
#[derive(Debug, Clone)]
pub struct CommandSpeechDevice {
    program: String,
    args: Vec<String>,
}

impl CommandSpeechDevice {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl SpeechDevice for CommandSpeechDevice {
    fn id(&self) -> &str {
        &self.program
    }

    fn speak(&self, text: &str, interrupt: &CancellationToken) -> Result<SpeechOutcome, SightError> {
        if interrupt.is_cancelled() {
            return Ok(SpeechOutcome::Interrupted);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SightError::SpeechDevice(format!("failed to spawn {}: {e}", self.program)))?;

        loop {
            if interrupt.is_cancelled() {
                // The process may already have exited; either way reap it.
                let _ = child.kill();
                let _ = child.wait();
                debug!(program = %self.program, "playback interrupted");
                return Ok(SpeechOutcome::Interrupted);
            }
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(SpeechOutcome::Completed),
                Ok(Some(status)) => {
                    return Err(SightError::SpeechDevice(format!(
                        "{} exited with {status}",
                        self.program
                    )));
                }
                Ok(None) => thread::sleep(INTERRUPT_POLL),
                Err(e) => {
                    return Err(SightError::SpeechDevice(format!(
                        "failed to poll {}: {e}",
                        self.program
                    )));
                }
            }
        }
    }
}
