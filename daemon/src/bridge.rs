//! Engines implemented by a connected front end
//!
//! The daemon does not own a microphone, a recognizer or a speaker. A front
//! end process does, and it talks to the daemon over the IPC socket: it
//! obeys the [`EngineCommand`]s issued here and reports results back
//! through the `Bridge` methods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engines::{
    CaptureConstraints, CaptureEngine, CaptureError, CaptureHandle, ChunkSink, Engines,
    Recognizer, RecognizerError, RecognizerEvent, RecognizerNotifier, SynthesisError, Synthesizer,
};

/// How long a capture stop waits for the front end to flush
pub const CAPTURE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Instructions for the front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EngineCommand {
    StartRecognition,
    StopRecognition,
    StartCapture {
        session: u64,
        constraints: CaptureConstraints,
    },
    /// Stop and deliver remaining chunks, then report `capture_stopped`
    StopCapture { session: u64 },
    AbortCapture { session: u64 },
    /// Speak and report `speech_finished` with the same utterance id
    Speak { utterance: u64, text: String },
    CancelSpeech,
}

/// A report from the front end referenced an unknown or closed id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("no capture session {0}")]
    UnknownSession(u64),

    #[error("no utterance {0}")]
    UnknownUtterance(u64),

    #[error("no recognizer is attached")]
    NoRecognizer,
}

struct PendingCapture {
    sink: ChunkSink,
    stop_tx: Option<oneshot::Sender<Option<String>>>,
    /// Set when the front end stopped before being asked to
    stopped: Option<Option<String>>,
}

#[derive(Default)]
struct Pending {
    notifier: Option<RecognizerNotifier>,
    recognizing: bool,
    captures: HashMap<u64, PendingCapture>,
    utterances: HashMap<u64, oneshot::Sender<Result<(), SynthesisError>>>,
}

struct Shared {
    /// One queue per front end; a closed queue is pruned on the next send
    front_ends: Mutex<Vec<mpsc::UnboundedSender<EngineCommand>>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        lock(&self.pending)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn has_front_end(&self) -> bool {
        let mut front_ends = lock(&self.front_ends);
        front_ends.retain(|tx| !tx.is_closed());
        !front_ends.is_empty()
    }

    fn send(&self, command: EngineCommand) {
        debug!(?command, "engine command");
        let mut front_ends = lock(&self.front_ends);
        front_ends.retain(|tx| tx.send(command.clone()).is_ok());
        if front_ends.is_empty() {
            debug!("no front end connected, engine command dropped");
        }
    }
}

/// Shared state of the IPC engines
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                front_ends: Mutex::new(Vec::new()),
                pending: Mutex::new(Pending::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Recognizer reporting through `notifier`
    pub fn recognizer(&self, notifier: RecognizerNotifier) -> Box<dyn Recognizer> {
        self.shared.lock().notifier = Some(notifier);
        Box::new(BridgeRecognizer {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Capture engine and synthesizer
    pub fn engines(&self) -> Engines {
        Engines {
            capture: Arc::new(BridgeCapture {
                shared: Arc::clone(&self.shared),
            }),
            synthesizer: Arc::new(BridgeSynthesizer {
                shared: Arc::clone(&self.shared),
            }),
        }
    }

    /// Receive every engine command issued from now on
    ///
    /// Each receiver gets its own unbounded queue, so a slow front end
    /// never loses a command.
    pub fn commands(&self) -> mpsc::UnboundedReceiver<EngineCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.front_ends).push(tx);
        rx
    }

    /// Commands a newly attached front end needs to catch up
    pub fn resume_commands(&self) -> Vec<EngineCommand> {
        if self.shared.lock().recognizing {
            vec![EngineCommand::StartRecognition]
        } else {
            Vec::new()
        }
    }

    /// Forward a recognizer notification to the state machine
    pub fn recognition(&self, event: RecognizerEvent) -> Result<(), BridgeError> {
        let notifier = self.shared.lock().notifier.clone();
        match notifier {
            Some(notifier) if notifier.notify(event) => Ok(()),
            _ => Err(BridgeError::NoRecognizer),
        }
    }

    /// Append a chunk of encoded audio to a capture session
    pub fn audio_chunk(&self, session: u64, data: Vec<u8>) -> Result<(), BridgeError> {
        let pending = self.shared.lock();
        let capture = pending
            .captures
            .get(&session)
            .ok_or(BridgeError::UnknownSession(session))?;
        capture.sink.append_chunk(data);
        Ok(())
    }

    /// The front end has delivered the last chunk of `session`
    pub fn capture_stopped(
        &self,
        session: u64,
        mime_type: Option<String>,
    ) -> Result<(), BridgeError> {
        let mut pending = self.shared.lock();
        let capture = pending
            .captures
            .get_mut(&session)
            .ok_or(BridgeError::UnknownSession(session))?;

        match capture.stop_tx.take() {
            Some(tx) => {
                let _ = tx.send(mime_type);
                pending.captures.remove(&session);
            }
            None => capture.stopped = Some(mime_type),
        }
        Ok(())
    }

    /// Playback of `utterance` ended, with an error description if it failed
    pub fn speech_finished(&self, utterance: u64, error: Option<String>) -> Result<(), BridgeError> {
        let tx = self
            .shared
            .lock()
            .utterances
            .remove(&utterance)
            .ok_or(BridgeError::UnknownUtterance(utterance))?;
        let _ = tx.send(match error {
            Some(message) => Err(SynthesisError(message)),
            None => Ok(()),
        });
        Ok(())
    }
}

struct BridgeRecognizer {
    shared: Arc<Shared>,
}

impl Recognizer for BridgeRecognizer {
    fn start(&mut self) -> Result<(), RecognizerError> {
        self.shared.lock().recognizing = true;
        self.shared.send(EngineCommand::StartRecognition);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.lock().recognizing = false;
        self.shared.send(EngineCommand::StopRecognition);
    }
}

struct BridgeCapture {
    shared: Arc<Shared>,
}

#[async_trait]
impl CaptureEngine for BridgeCapture {
    async fn begin(
        &self,
        constraints: &CaptureConstraints,
        sink: ChunkSink,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        if !self.shared.has_front_end() {
            return Err(CaptureError::Unavailable("no front end connected".into()));
        }

        let session = self.shared.next_id();
        self.shared.lock().captures.insert(
            session,
            PendingCapture {
                sink,
                stop_tx: None,
                stopped: None,
            },
        );
        self.shared.send(EngineCommand::StartCapture {
            session,
            constraints: constraints.clone(),
        });
        info!(session, "capture requested from front end");

        Ok(Box::new(BridgeCaptureHandle {
            shared: Arc::clone(&self.shared),
            session,
            mime_type: None,
        }))
    }
}

struct BridgeCaptureHandle {
    shared: Arc<Shared>,
    session: u64,
    mime_type: Option<String>,
}

#[async_trait]
impl CaptureHandle for BridgeCaptureHandle {
    fn mime_type(&self) -> Option<String> {
        self.mime_type.clone()
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        let rx = {
            let mut pending = self.shared.lock();
            let Some(capture) = pending.captures.get_mut(&self.session) else {
                return Ok(());
            };
            if let Some(mime_type) = capture.stopped.take() {
                self.mime_type = mime_type;
                pending.captures.remove(&self.session);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            capture.stop_tx = Some(tx);
            rx
        };

        self.shared.send(EngineCommand::StopCapture {
            session: self.session,
        });

        match tokio::time::timeout(CAPTURE_STOP_TIMEOUT, rx).await {
            Ok(Ok(mime_type)) => self.mime_type = mime_type,
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(session = self.session, "front end did not confirm capture stop");
                self.shared.lock().captures.remove(&self.session);
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.shared.lock().captures.remove(&self.session);
        self.shared.send(EngineCommand::AbortCapture {
            session: self.session,
        });
    }
}

struct BridgeSynthesizer {
    shared: Arc<Shared>,
}

#[async_trait]
impl Synthesizer for BridgeSynthesizer {
    async fn speak(&self, text: &str) -> Result<(), SynthesisError> {
        if !self.shared.has_front_end() {
            return Err(SynthesisError("no front end connected".into()));
        }

        let utterance = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.lock().utterances.insert(utterance, tx);
        self.shared.send(EngineCommand::Speak {
            utterance,
            text: text.to_string(),
        });

        rx.await.unwrap_or(Ok(()))
    }

    fn cancel_all(&self) {
        let cancelled: Vec<_> = self.shared.lock().utterances.drain().collect();
        for (_, tx) in cancelled {
            let _ = tx.send(Ok(()));
        }
        self.shared.send(EngineCommand::CancelSpeech);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::engines::{CaptureSession, RecognitionResult};
    use crate::state::Input;

    fn notifier() -> (RecognizerNotifier, mpsc::UnboundedReceiver<Input>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RecognizerNotifier::new(tx), rx)
    }

    fn start_capture_session(command: EngineCommand) -> u64 {
        match command {
            EngineCommand::StartCapture { session, .. } => session,
            other => panic!("expected start_capture, got {other:?}"),
        }
    }

    #[test]
    fn test_recognizer_commands_and_resume() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let (n, _rx) = notifier();
        let mut recognizer = bridge.recognizer(n);

        assert!(bridge.resume_commands().is_empty());
        recognizer.start().unwrap();
        assert_eq!(commands.try_recv().unwrap(), EngineCommand::StartRecognition);
        assert_eq!(bridge.resume_commands(), vec![EngineCommand::StartRecognition]);

        recognizer.stop();
        assert_eq!(commands.try_recv().unwrap(), EngineCommand::StopRecognition);
        assert!(bridge.resume_commands().is_empty());
    }

    #[test]
    fn test_recognition_forwarded() {
        let bridge = Bridge::new();
        let event = RecognizerEvent::Result {
            result_index: 0,
            results: vec![RecognitionResult::interim("ok")],
        };
        assert_eq!(
            bridge.recognition(event.clone()),
            Err(BridgeError::NoRecognizer)
        );

        let (n, mut rx) = notifier();
        let _recognizer = bridge.recognizer(n);
        bridge.recognition(event.clone()).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Input::Recognizer(e) if e == event));
    }

    #[tokio::test]
    async fn test_capture_requires_front_end() {
        let bridge = Bridge::new();
        let engines = bridge.engines();
        let result = CaptureSession::begin(&*engines.capture, &CaptureConstraints::default()).await;
        assert!(matches!(result, Err(CaptureError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_capture_round_trip() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let engines = bridge.engines();

        let session = CaptureSession::begin(&*engines.capture, &CaptureConstraints::default())
            .await
            .unwrap();
        let id = start_capture_session(commands.try_recv().unwrap());

        bridge.audio_chunk(id, vec![1, 2]).unwrap();
        let finalize = tokio::spawn(session.finalize());

        assert_eq!(
            commands.recv().await.unwrap(),
            EngineCommand::StopCapture { session: id }
        );
        bridge.audio_chunk(id, vec![3]).unwrap();
        bridge
            .capture_stopped(id, Some("audio/webm;codecs=opus".into()))
            .unwrap();

        let audio = finalize.await.unwrap().unwrap();
        assert_eq!(audio.locator.bytes(), &[1, 2, 3]);
        assert_eq!(audio.extension, "webm");
        assert_eq!(
            bridge.audio_chunk(id, vec![4]),
            Err(BridgeError::UnknownSession(id))
        );
    }

    #[tokio::test]
    async fn test_capture_stopped_early() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let engines = bridge.engines();

        let session = CaptureSession::begin(&*engines.capture, &CaptureConstraints::default())
            .await
            .unwrap();
        let id = start_capture_session(commands.try_recv().unwrap());
        bridge.audio_chunk(id, vec![9]).unwrap();
        bridge.capture_stopped(id, Some("audio/ogg".into())).unwrap();

        let audio = session.finalize().await.unwrap();
        assert_eq!(audio.extension, "ogg");
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_stop_times_out() {
        let bridge = Bridge::new();
        let _commands = bridge.commands();
        let engines = bridge.engines();

        let session = CaptureSession::begin(&*engines.capture, &CaptureConstraints::default())
            .await
            .unwrap();
        let result = session.finalize().await;
        assert!(matches!(result, Err(CaptureError::NoAudio)));
    }

    #[tokio::test]
    async fn test_capture_abort() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let engines = bridge.engines();

        let session = CaptureSession::begin(&*engines.capture, &CaptureConstraints::default())
            .await
            .unwrap();
        let id = start_capture_session(commands.try_recv().unwrap());
        session.discard();

        assert_eq!(
            commands.try_recv().unwrap(),
            EngineCommand::AbortCapture { session: id }
        );
        assert_eq!(
            bridge.capture_stopped(id, None),
            Err(BridgeError::UnknownSession(id))
        );
    }

    #[tokio::test]
    async fn test_speech_finished() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let synth = bridge.engines().synthesizer;

        let speaking = tokio::spawn({
            let synth = Arc::clone(&synth);
            async move { synth.speak("hello").await }
        });
        let utterance = match commands.recv().await.unwrap() {
            EngineCommand::Speak { utterance, text } => {
                assert_eq!(text, "hello");
                utterance
            }
            other => panic!("expected speak, got {other:?}"),
        };

        bridge
            .speech_finished(utterance, Some("audio device lost".into()))
            .unwrap();
        assert_eq!(
            speaking.await.unwrap(),
            Err(SynthesisError("audio device lost".into()))
        );
        assert_eq!(
            bridge.speech_finished(utterance, None),
            Err(BridgeError::UnknownUtterance(utterance))
        );
    }

    #[tokio::test]
    async fn test_cancel_all_completes_pending_speech() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let synth = bridge.engines().synthesizer;

        let speaking = tokio::spawn({
            let synth = Arc::clone(&synth);
            async move { synth.speak("a long answer").await }
        });
        assert!(matches!(
            commands.recv().await.unwrap(),
            EngineCommand::Speak { .. }
        ));

        synth.cancel_all();
        assert_eq!(speaking.await.unwrap(), Ok(()));
        assert_eq!(commands.recv().await.unwrap(), EngineCommand::CancelSpeech);
    }

    #[tokio::test]
    async fn test_speak_without_front_end() {
        let bridge = Bridge::new();
        let synth = bridge.engines().synthesizer;
        assert!(synth.speak("hello").await.is_err());
    }

    #[test]
    fn test_slow_front_end_keeps_every_command() {
        let bridge = Bridge::new();
        let mut commands = bridge.commands();
        let (n, _rx) = notifier();
        let mut recognizer = bridge.recognizer(n);

        for _ in 0..1000 {
            recognizer.start().unwrap();
            recognizer.stop();
        }
        for _ in 0..1000 {
            assert_eq!(commands.try_recv().unwrap(), EngineCommand::StartRecognition);
            assert_eq!(commands.try_recv().unwrap(), EngineCommand::StopRecognition);
        }
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn test_departed_front_end_is_forgotten() {
        let bridge = Bridge::new();
        let commands = bridge.commands();
        assert!(bridge.shared.has_front_end());
        drop(commands);
        assert!(!bridge.shared.has_front_end());
    }

    #[test]
    fn test_command_serialization() {
        let json = serde_json::to_value(EngineCommand::StopCapture { session: 3 }).unwrap();
        assert_eq!(json["command"], "stop_capture");
        assert_eq!(json["session"], 3);
    }
}
