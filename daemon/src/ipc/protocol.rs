//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bridge::EngineCommand;
use crate::engines::RecognizerEvent;
use crate::events::Event;
use crate::state::VoiceState;

/// Largest accepted message body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests from clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    ToggleMute,

    /// Speak a reply; the outcome arrives as events
    Speak { text: String },

    /// End the current recording now
    StopRecording,

    /// Receive events and engine commands
    Subscribe,

    /// Front end: a recognizer notification
    Recognition { event: RecognizerEvent },

    /// Front end: base64 encoded audio for a capture session
    AudioChunk { session: u64, data: String },

    /// Front end: a capture session has delivered its last chunk
    CaptureStopped {
        session: u64,
        #[serde(default)]
        mime_type: Option<String>,
    },

    /// Front end: playback of an utterance ended
    SpeechFinished {
        utterance: u64,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Pong response to ping
    Pong,

    /// Current daemon status
    Status(DaemonStatus),

    /// Request carried out
    Ok,

    /// Request queued; its outcome is reported as events
    Accepted,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification to subscribed clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    /// Something the assistant did
    Event(Event),
    /// Something the front end must do
    Engine(EngineCommand),
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    pub state: VoiceState,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn new(state: VoiceState, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state,
            uptime_secs,
        }
    }
}

/// Read one length-prefixed message body; `None` on a clean disconnect
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("message of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("connection closed mid-message")?;
    Ok(Some(body))
}

/// Send a length-prefixed JSON message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;
    writer.flush().await?;

    Ok(())
}
