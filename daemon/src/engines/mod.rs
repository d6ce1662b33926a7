//! Capability interfaces for the external engines
//!
//! The state machine talks to the recognizer, the capture engine and the
//! synthesizer only through these traits.

mod capture;
mod recognizer;
mod synth;

pub use capture::{
    extension_for_mime, AudioLocator, CaptureConstraints, CaptureEngine, CaptureError,
    CaptureHandle, CaptureSession, CapturedAudio, ChunkSink, FALLBACK_EXTENSION,
};
pub use recognizer::{
    RecognitionErrorKind, RecognitionResult, Recognizer, RecognizerError, RecognizerEvent,
    RecognizerNotifier, TranscriptDelta,
};
pub use synth::{SynthesisError, Synthesizer};

use std::sync::Arc;

/// The engines the state machine drives besides the recognizer
#[derive(Clone)]
pub struct Engines {
    pub capture: Arc<dyn CaptureEngine>,
    pub synthesizer: Arc<dyn Synthesizer>,
}
