//! [`SpeechArbitrator`] – the single owner of the audio device.
//!
//! Every caller holds a cheap clone of the arbitrator handle and sends
//! commands into one actor task.  The actor owns the backlog and the
//! utterance in flight, so there is exactly one mutual-exclusion domain for
//! the speaker and at most one [`SpeechDevice::speak`] call is active at a
//! time.
//!
//! Scheduling rules:
//!
//! * **High** preempts: the current utterance is interrupted and dropped
//!   (never requeued) and the new text is spoken next.  The backlog is kept.
//! * **Normal** speaks immediately when idle, otherwise joins the back of
//!   the backlog.  A full backlog drops its oldest entry.
//! * When an utterance ends (completed, interrupted by the device, or
//!   failed) the oldest backlog entry is spoken; an empty backlog means
//!   [`SpeakerState::Idle`].
//!
//! Playback itself runs on Tokio's blocking pool.  `announce`, `stop` and
//! `clear` only enqueue a command and never wait on the speaker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sightline_hal::{SpeechDevice, SpeechOutcome};
use sightline_types::{Announcement, LatencyRecorder, Operation, Priority, SightError, SpeakerState};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitratorConfig {
    /// Maximum queued Normal announcements; the oldest is dropped on
    /// overflow.
    pub backlog_capacity: usize,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self { backlog_capacity: 32 }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Handle
// ────────────────────────────────────────────────────────────────────────────

enum Command {
    Announce(Announcement),
    Stop,
    Clear,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the speech actor.  Clone freely; all clones drive the same
/// speaker.  The actor exits on [`shutdown`][Self::shutdown] or once every
/// clone has been dropped.
#[derive(Clone)]
pub struct SpeechArbitrator {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SpeakerState>,
    /// Commands sent but not yet handled by the actor.
    pending: Arc<AtomicUsize>,
    backlog_len: Arc<AtomicUsize>,
}

impl SpeechArbitrator {
    /// Spawn the actor on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn spawn(
        device: Arc<dyn SpeechDevice>,
        config: ArbitratorConfig,
        recorder: Option<Arc<dyn LatencyRecorder>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SpeakerState::Idle);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let backlog_len = Arc::new(AtomicUsize::new(0));

        let actor = Actor {
            device,
            recorder,
            capacity: config.backlog_capacity.max(1),
            backlog: VecDeque::new(),
            current: None,
            next_id: 0,
            state: state_tx,
            pending: Arc::clone(&pending),
            backlog_len: Arc::clone(&backlog_len),
            finished_tx,
        };
        tokio::spawn(actor.run(command_rx, finished_rx));

        Self {
            commands,
            state,
            pending,
            backlog_len,
        }
    }

    fn send(&self, command: Command) -> Result<(), SightError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.commands.send(command).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            SightError::NotRunning
        })
    }

    /// Queue `text` for speaking under `priority`.
    ///
    /// # Errors
    ///
    /// [`SightError::NotRunning`] after the actor has shut down.
    pub fn announce(&self, text: impl Into<String>, priority: Priority) -> Result<(), SightError> {
        self.send(Command::Announce(Announcement::new(text, priority)))
    }

    /// Interrupt the current utterance and drop the backlog.
    pub fn stop(&self) -> Result<(), SightError> {
        self.send(Command::Stop)
    }

    /// Drop the backlog; the current utterance keeps playing.
    pub fn clear(&self) -> Result<(), SightError> {
        self.send(Command::Clear)
    }

    pub fn state(&self) -> SpeakerState {
        self.state.borrow().clone()
    }

    pub fn is_speaking(&self) -> bool {
        !self.state.borrow().is_idle()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog_len.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<SpeakerState> {
        self.state.clone()
    }

    /// Resolve once the speaker is idle with no command left to handle.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.clone();
        loop {
            if rx.wait_for(SpeakerState::is_idle).await.is_err() {
                return;
            }
            if self.pending.load(Ordering::SeqCst) == 0 && rx.borrow().is_idle() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Hard-stop, clear and end the actor.  Resolves once the device is
    /// released.  Later calls on any clone return
    /// [`SightError::NotRunning`].
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for SpeechArbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechArbitrator")
            .field("state", &*self.state.borrow())
            .field("backlog_len", &self.backlog_len())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actor
// ────────────────────────────────────────────────────────────────────────────

struct Playback {
    id: u64,
    interrupt: CancellationToken,
    handle: JoinHandle<()>,
}

struct Finished {
    id: u64,
    text: String,
    result: Result<SpeechOutcome, SightError>,
    started: Instant,
    finished: Instant,
}

struct Actor {
    device: Arc<dyn SpeechDevice>,
    recorder: Option<Arc<dyn LatencyRecorder>>,
    capacity: usize,
    backlog: VecDeque<Announcement>,
    current: Option<Playback>,
    next_id: u64,
    state: watch::Sender<SpeakerState>,
    pending: Arc<AtomicUsize>,
    backlog_len: Arc<AtomicUsize>,
    finished_tx: mpsc::UnboundedSender<Finished>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut finished: mpsc::UnboundedReceiver<Finished>,
    ) {
        debug!(device = self.device.id(), "speech arbitrator started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.halt().await;
                        break;
                    };
                    let reply = self.handle(command).await;
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    // Wake `wait_idle` even when the state itself is unchanged.
                    self.state.send_modify(|_| {});
                    if let Some(reply) = reply {
                        commands.close();
                        let _ = reply.send(());
                        break;
                    }
                }
                Some(done) = finished.recv() => self.on_finished(done),
            }
        }
        debug!(device = self.device.id(), "speech arbitrator stopped");
    }

    /// Returns the reply channel when the command was a shutdown.
    async fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Announce(announcement) => {
                let priority = announcement.priority;
                match priority {
                    Priority::High => {
                        self.interrupt_current().await;
                        self.start(announcement);
                    }
                    Priority::Normal if self.current.is_none() => self.start(announcement),
                    Priority::Normal => self.enqueue(announcement),
                }
            }
            Command::Stop => self.halt().await,
            Command::Clear => {
                let dropped = self.backlog.len();
                self.backlog.clear();
                self.sync_backlog_len();
                if dropped > 0 {
                    debug!(dropped, "speech backlog cleared");
                }
            }
            Command::Shutdown(reply) => {
                self.halt().await;
                return Some(reply);
            }
        }
        None
    }

    fn enqueue(&mut self, announcement: Announcement) {
        if self.backlog.len() >= self.capacity {
            if let Some(dropped) = self.backlog.pop_front() {
                warn!(text = %dropped.text, capacity = self.capacity, "speech backlog full, dropping oldest");
            }
        }
        self.backlog.push_back(announcement);
        self.sync_backlog_len();
    }

    fn start(&mut self, announcement: Announcement) {
        self.next_id += 1;
        let id = self.next_id;
        let interrupt = CancellationToken::new();
        let device = Arc::clone(&self.device);
        let token = interrupt.clone();
        let finished_tx = self.finished_tx.clone();
        let text = announcement.text.clone();

        debug!(id, text = %text, priority = ?announcement.priority, "speaking");
        self.state.send_replace(SpeakerState::Speaking(announcement));

        let handle = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = device.speak(&text, &token);
            let _ = finished_tx.send(Finished {
                id,
                text,
                result,
                started,
                finished: Instant::now(),
            });
        });
        self.current = Some(Playback { id, interrupt, handle });
    }

    /// Cancel the utterance in flight and wait until the device has let go.
    async fn interrupt_current(&mut self) {
        if let Some(playback) = self.current.take() {
            playback.interrupt.cancel();
            if let Err(e) = playback.handle.await {
                error!(error = %e, "speech playback task failed");
            }
            debug!(id = playback.id, "utterance preempted");
        }
    }

    async fn halt(&mut self) {
        self.backlog.clear();
        self.sync_backlog_len();
        self.interrupt_current().await;
        self.state.send_replace(SpeakerState::Idle);
    }

    fn on_finished(&mut self, done: Finished) {
        let is_current = self.current.as_ref().is_some_and(|p| p.id == done.id);
        match &done.result {
            Ok(SpeechOutcome::Completed) => {
                if let Some(recorder) = &self.recorder {
                    recorder.record_interval(Operation::Audio, done.started, done.finished);
                }
                debug!(id = done.id, text = %done.text, "utterance completed");
            }
            Ok(SpeechOutcome::Interrupted) => debug!(id = done.id, "utterance interrupted"),
            Err(e) => warn!(id = done.id, text = %done.text, error = %e, "speech device failed"),
        }
        // Stale completions from preempted utterances are already accounted for.
        if !is_current {
            return;
        }
        self.current = None;
        self.advance();
    }

    fn advance(&mut self) {
        match self.backlog.pop_front() {
            Some(next) => {
                self.sync_backlog_len();
                self.start(next);
            }
            None => {
                self.state.send_replace(SpeakerState::Idle);
                info!("speaker idle");
            }
        }
    }

    fn sync_backlog_len(&self) {
        self.backlog_len.store(self.backlog.len(), Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
