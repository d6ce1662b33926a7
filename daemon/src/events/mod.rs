//! Events emitted by the state machine
//!
//! The state machine is the only producer. Events are handed to a single
//! consumer through an unbounded queue: production never blocks, the
//! consumer waits for the next event, and nothing is replayed to a
//! consumer that attaches late.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::engines::AudioLocator;
use crate::state::VoiceState;

/// An event with its emission stamp
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Emission order, starting at zero for the first event of a stream
    pub seq: u64,
    /// Milliseconds since the state machine started, monotonic
    pub at_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// What happened
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The machine entered a new state
    StateChange { state: VoiceState },

    /// Recognizer text, either interim or settled
    Transcript { text: String, is_final: bool },

    /// A finished utterance ready for the command responder
    Command {
        /// Captured audio, absent when nothing was recorded
        audio: Option<AudioLocator>,
        /// File extension matching the audio encoding
        extension: Option<String>,
    },

    /// Speech playback started
    SpeechStart { text: String },

    /// Speech playback finished
    SpeechEnd,

    /// A fault that was absorbed
    Error {
        message: String,
        cause: Option<String>,
    },
}

impl EventKind {
    /// Build an error event with an optional cause
    pub fn error(message: impl Into<String>, cause: Option<String>) -> Self {
        EventKind::Error {
            message: message.into(),
            cause,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::StateChange { state } => write!(f, "STATE_CHANGE ({})", state),
            EventKind::Transcript { text, is_final } => {
                let tag = if *is_final { "final" } else { "interim" };
                write!(f, "TRANSCRIPT ({}: {:?})", tag, text)
            }
            EventKind::Command { audio, extension } => match (audio, extension) {
                (Some(audio), Some(ext)) => {
                    write!(f, "COMMAND ({} bytes, .{})", audio.len(), ext)
                }
                (Some(audio), None) => write!(f, "COMMAND ({} bytes)", audio.len()),
                _ => write!(f, "COMMAND (no audio)"),
            },
            EventKind::SpeechStart { text } => write!(f, "SPEECH_START ({:?})", text),
            EventKind::SpeechEnd => write!(f, "SPEECH_END"),
            EventKind::Error { message, .. } => write!(f, "ERROR ({})", message),
        }
    }
}

/// Producer side of the event queue, owned by the state machine
pub struct EventChannel {
    started_at: Instant,
    next_seq: u64,
    tx: Option<mpsc::UnboundedSender<Event>>,
    subscribed: bool,
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            next_seq: 0,
            tx: None,
            subscribed: false,
        }
    }

    /// Attach the one consumer, queueing `initial` as its first event
    ///
    /// Returns `None` if a consumer was already attached; the stream cannot
    /// be restarted.
    pub fn subscribe(&mut self, initial: EventKind) -> Option<EventStream> {
        if self.subscribed {
            return None;
        }
        self.subscribed = true;

        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        self.emit(initial);
        Some(EventStream { rx })
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Stamp and queue an event
    ///
    /// Without a live consumer the event is dropped.
    pub fn emit(&mut self, kind: EventKind) {
        let Some(tx) = &self.tx else {
            debug!(event = %kind, "no event consumer attached, dropping event");
            return;
        };

        let event = Event {
            seq: self.next_seq,
            at_ms: self.started_at.elapsed().as_millis() as u64,
            kind,
        };
        debug!(seq = event.seq, event = %event.kind, "emitting event");

        if tx.send(event).is_err() {
            debug!("event consumer went away, further events are discarded");
            self.tx = None;
            return;
        }
        self.next_seq += 1;
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of the event queue
///
/// Never ends while the state machine is running.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
