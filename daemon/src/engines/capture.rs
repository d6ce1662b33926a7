//! Audio capture capability and the per-utterance capture session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info};

/// Extension used when the encoding cannot be determined
pub const FALLBACK_EXTENSION: &str = "bin";

/// Capture settings requested from the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Encoding to negotiate, if the engine supports choosing
    pub preferred_mime_type: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            preferred_mime_type: None,
        }
    }
}

/// Errors raised while capturing audio
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// Permission denied or no capture device
    #[error("audio capture unavailable: {0}")]
    Unavailable(String),

    /// The session ended without receiving any audio
    #[error("no audio was captured")]
    NoAudio,

    /// The engine failed while flushing or encoding
    #[error("failed to finalize capture: {0}")]
    Finalize(String),
}

/// Where a capture engine delivers audio chunks
///
/// Cloneable and usable from the engine's own threads.
#[derive(Debug, Clone, Default)]
pub struct ChunkSink {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ChunkSink {
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        // A panic while pushing leaves the vector intact
        self.chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append a chunk; empty chunks are ignored
    pub fn append_chunk(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.lock().push(data);
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().len()
    }

    fn take_all(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.lock())
    }
}

/// A running capture inside an engine
#[async_trait]
pub trait CaptureHandle: Send {
    /// Media type of the negotiated encoding, if known
    fn mime_type(&self) -> Option<String>;

    /// Stop capturing, delivering any buffered audio before returning
    async fn stop(&mut self) -> Result<(), CaptureError>;

    /// Stop capturing and throw away anything still buffered
    fn abort(&mut self);
}

/// An audio capture engine
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    /// Open the capture device and start delivering chunks into `sink`
    async fn begin(
        &self,
        constraints: &CaptureConstraints,
        sink: ChunkSink,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

static NEXT_LOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to finalized audio
///
/// Clones share the same bytes; the audio is released when the last clone
/// is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioLocator {
    id: u64,
    data: Arc<[u8]>,
}

impl AudioLocator {
    fn new(data: Vec<u8>) -> Self {
        Self {
            id: NEXT_LOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            data: data.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for AudioLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioLocator")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .finish()
    }
}

impl Serialize for AudioLocator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("AudioLocator", 3)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("size", &self.data.len())?;
        s.serialize_field("data", &STANDARD.encode(&self.data))?;
        s.end()
    }
}

/// Result of a successful finalize
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    pub locator: AudioLocator,
    pub extension: String,
}

/// Derive a file extension from a media type such as `audio/webm;codecs=opus`
pub fn extension_for_mime(mime_type: Option<&str>) -> String {
    let subtype = mime_type
        .and_then(|mime| mime.split(';').next())
        .and_then(|essence| essence.trim().split_once('/'))
        .map(|(_, subtype)| subtype.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let subtype = subtype.strip_prefix("x-").unwrap_or(&subtype);
    let extension = match subtype {
        "mpeg" => "mp3",
        "wave" => "wav",
        other => other,
    };

    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        FALLBACK_EXTENSION.to_string()
    } else {
        extension.to_string()
    }
}

/// One in-flight recording bound to one utterance
pub struct CaptureSession {
    handle: Box<dyn CaptureHandle>,
    sink: ChunkSink,
}

impl CaptureSession {
    /// Start a capture on `engine`
    pub async fn begin(
        engine: &dyn CaptureEngine,
        constraints: &CaptureConstraints,
    ) -> Result<Self, CaptureError> {
        let sink = ChunkSink::default();
        let handle = engine.begin(constraints, sink.clone()).await?;
        info!(mime_type = ?handle.mime_type(), "capture session started");
        Ok(Self { handle, sink })
    }

    /// Number of chunks received so far
    pub fn chunk_count(&self) -> usize {
        self.sink.chunk_count()
    }

    /// Stop the capture and assemble everything received into one buffer
    pub async fn finalize(mut self) -> Result<CapturedAudio, CaptureError> {
        self.handle.stop().await?;

        let chunks = self.sink.take_all();
        if chunks.is_empty() {
            return Err(CaptureError::NoAudio);
        }

        let extension = extension_for_mime(self.handle.mime_type().as_deref());
        let chunk_count = chunks.len();
        let audio = chunks.concat();
        let locator = AudioLocator::new(audio);

        info!(
            chunks = chunk_count,
            bytes = locator.len(),
            extension = %extension,
            "capture session finalized"
        );
        Ok(CapturedAudio { locator, extension })
    }

    /// Stop the capture and throw the audio away
    pub fn discard(mut self) {
        self.handle.abort();
        let dropped = self.sink.take_all().len();
        debug!(chunks = dropped, "capture session discarded");
    }
}
