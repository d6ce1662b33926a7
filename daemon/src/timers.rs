//! Named one-shot timers used for endpoint detection
//!
//! Each timer lives in its own slot. Arming a slot aborts whatever was armed
//! there before, and every firing carries the generation it was armed with so
//! a firing that raced with a disarm can be recognised and dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// The two endpoint timers owned by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Guard armed on wake word: did the user say anything at all
    WakeSilence,
    /// End-of-utterance silence, re-armed on every transcript delta
    UtteranceSilence,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::WakeSilence => write!(f, "wake_silence"),
            TimerKind::UtteranceSilence => write!(f, "utterance_silence"),
        }
    }
}

/// A timer firing delivered back to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct ArmedTimer {
    generation: u64,
    duration: Duration,
    task: JoinHandle<()>,
}

/// Two independently armable timer slots
pub struct TimerSlots {
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    next_generation: u64,
    wake_silence: Option<ArmedTimer>,
    utterance_silence: Option<ArmedTimer>,
}

impl TimerSlots {
    /// Create empty slots that deliver firings on `fired_tx`
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired_tx,
            next_generation: 0,
            wake_silence: None,
            utterance_silence: None,
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::WakeSilence => &mut self.wake_silence,
            TimerKind::UtteranceSilence => &mut self.utterance_silence,
        }
    }

    fn peek(&self, kind: TimerKind) -> Option<&ArmedTimer> {
        match kind {
            TimerKind::WakeSilence => self.wake_silence.as_ref(),
            TimerKind::UtteranceSilence => self.utterance_silence.as_ref(),
        }
    }

    /// Arm `kind` for `duration`, replacing any instance already armed
    pub fn arm(&mut self, kind: TimerKind, duration: Duration) {
        self.disarm(kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let fired_tx = self.fired_tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = fired_tx.send(TimerFired { kind, generation });
        });

        debug!(timer = %kind, duration_ms = duration.as_millis() as u64, "timer armed");
        *self.slot(kind) = Some(ArmedTimer {
            generation,
            duration,
            task,
        });
    }

    /// Cancel `kind` if armed
    pub fn disarm(&mut self, kind: TimerKind) {
        if let Some(armed) = self.slot(kind).take() {
            armed.task.abort();
            debug!(timer = %kind, "timer disarmed");
        }
    }

    /// Cancel both timers
    pub fn disarm_all(&mut self) {
        self.disarm(TimerKind::WakeSilence);
        self.disarm(TimerKind::UtteranceSilence);
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.peek(kind).is_some()
    }

    /// Duration the live instance of `kind` was armed with
    pub fn armed_duration(&self, kind: TimerKind) -> Option<Duration> {
        self.peek(kind).map(|armed| armed.duration)
    }

    /// Accept a firing if it belongs to the live instance, clearing the slot
    ///
    /// Returns false for firings of instances that were since disarmed or
    /// re-armed.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let live = matches!(
            self.peek(fired.kind),
            Some(armed) if armed.generation == fired.generation
        );
        if live {
            *self.slot(fired.kind) = None;
        }
        live
    }
}

impl Drop for TimerSlots {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
