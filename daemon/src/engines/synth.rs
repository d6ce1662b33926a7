//! Speech synthesis capability

use async_trait::async_trait;

/// Failure description reported by a synthesizer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SynthesisError(pub String);

/// A text-to-speech engine
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Speak `text`, resolving when playback ends
    async fn speak(&self, text: &str) -> Result<(), SynthesisError>;

    /// Cancel queued and playing speech; pending `speak` calls resolve
    fn cancel_all(&self);
}
