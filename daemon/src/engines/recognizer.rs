//! Speech recognizer capability and its notifications

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::state::Input;

/// One recognition result: the engine's best transcript for a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub transcript: String,
    pub is_final: bool,
}

impl RecognitionResult {
    pub fn interim(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: false,
        }
    }

    pub fn settled(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: true,
        }
    }
}

/// Notifications delivered by a recognizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognizerEvent {
    /// Results changed from `result_index` onwards
    Result {
        result_index: usize,
        results: Vec<RecognitionResult>,
    },
    /// The engine reported an error such as `aborted` or `no-speech`
    Error { kind: String },
    /// The engine detected the start of speech
    SpeechStarted,
    /// The engine detected the end of speech
    SpeechEnded,
    /// The engine's recognition session closed
    SessionEnded,
}

/// Text carried by one result notification, split by finality
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptDelta {
    pub interim: String,
    pub finalized: String,
}

impl TranscriptDelta {
    /// Collect the results from `result_index` onwards
    pub fn from_results(result_index: usize, results: &[RecognitionResult]) -> Self {
        let mut delta = Self::default();
        for result in results.iter().skip(result_index) {
            if result.is_final {
                delta.finalized.push_str(&result.transcript);
            } else {
                delta.interim.push_str(&result.transcript);
            }
        }
        delta
    }

    /// Interim text followed by newly finalized text
    pub fn combined(&self) -> String {
        format!("{}{}", self.interim, self.finalized)
    }
}

/// How the state machine treats a recognizer error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Expected while recognition is stopped and restarted; ignored
    Aborted,
    /// No speech heard; treated as end of utterance
    NoSpeech,
    /// Anything else; surfaced as an error event
    Fatal(String),
}

impl RecognitionErrorKind {
    pub fn classify(kind: &str) -> Self {
        match kind.trim() {
            "aborted" => RecognitionErrorKind::Aborted,
            "no-speech" => RecognitionErrorKind::NoSpeech,
            other => RecognitionErrorKind::Fatal(other.to_string()),
        }
    }
}

/// Errors raised by a recognizer
#[derive(Debug, thiserror::Error)]
pub enum RecognizerError {
    #[error("speech recognition is not available: {0}")]
    Unavailable(String),

    #[error("failed to start speech recognition: {0}")]
    Start(String),
}

/// A continuous speech recognizer
///
/// Implementations deliver notifications through the [`RecognizerNotifier`]
/// they were constructed with. `start` on a running recognizer should be
/// harmless.
pub trait Recognizer: Send {
    fn start(&mut self) -> Result<(), RecognizerError>;
    fn stop(&mut self);
}

/// Handle a recognizer uses to report back to the state machine
///
/// Safe to use from any thread; sending never blocks.
#[derive(Debug, Clone)]
pub struct RecognizerNotifier {
    tx: mpsc::UnboundedSender<Input>,
}

impl RecognizerNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { tx }
    }

    /// Deliver a notification, returning false once the machine is gone
    pub fn notify(&self, event: RecognizerEvent) -> bool {
        if self.tx.send(Input::Recognizer(event)).is_err() {
            warn!("recognizer notification dropped, state machine stopped");
            return false;
        }
        true
    }

    pub fn results(&self, result_index: usize, results: Vec<RecognitionResult>) -> bool {
        self.notify(RecognizerEvent::Result {
            result_index,
            results,
        })
    }

    pub fn error(&self, kind: impl Into<String>) -> bool {
        self.notify(RecognizerEvent::Error { kind: kind.into() })
    }
}
