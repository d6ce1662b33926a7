//! Handle for driving a running state machine
//!
//! [`Assistant::spawn`] builds the state machine, starts it on the tokio
//! runtime and returns a cloneable handle. Every call on the handle becomes
//! one input to the machine, processed in order with recognizer callbacks
//! and timer firings.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::AssistantConfig;
use crate::engines::{Engines, Recognizer, RecognizerError, RecognizerNotifier};
use crate::events::EventStream;
use crate::state::{Channels, Input, StateMachine, VoiceState};
use crate::wake::WakePhraseError;

/// Errors from constructing or talking to the assistant
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),

    #[error("invalid wake phrase: {0}")]
    WakePattern(#[from] WakePhraseError),

    #[error("the event stream has already been taken")]
    AlreadySubscribed,

    #[error("the assistant has stopped")]
    Stopped,
}

/// Why a `speak` call did not complete normally
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeakError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("speech already in progress")]
    Busy,

    #[error("the assistant has stopped")]
    Stopped,
}

/// Cloneable handle to a running assistant
#[derive(Debug, Clone)]
pub struct Assistant {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<VoiceState>,
}

impl Assistant {
    /// Build the state machine and start it on the current runtime
    ///
    /// `make_recognizer` receives the notifier the recognizer must report
    /// through. If it fails, nothing is started.
    pub fn spawn<F>(
        config: &AssistantConfig,
        make_recognizer: F,
        engines: Engines,
    ) -> Result<(Self, JoinHandle<()>), AssistantError>
    where
        F: FnOnce(RecognizerNotifier) -> Result<Box<dyn Recognizer>, RecognizerError>,
    {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VoiceState::default());

        let recognizer = make_recognizer(RecognizerNotifier::new(inputs_tx.clone()))?;
        let machine = StateMachine::new(
            config,
            recognizer,
            engines,
            Channels {
                inputs_tx: inputs_tx.clone(),
                fired_tx,
                state_tx,
            },
        )?;

        let task = tokio::spawn(machine.run(inputs_rx, fired_rx));

        Ok((
            Self {
                inputs: inputs_tx,
                state: state_rx,
            },
            task,
        ))
    }

    /// The live state; never blocks
    pub fn current_state(&self) -> VoiceState {
        *self.state.borrow()
    }

    /// Receiver that observes every state the machine publishes
    pub fn watch_state(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    fn send(&self, input: Input) -> bool {
        if self.inputs.send(input).is_err() {
            warn!("assistant has stopped, ignoring request");
            return false;
        }
        true
    }

    /// Mute, or unmute if already muted
    pub fn toggle_mute(&self) {
        self.send(Input::ToggleMute);
    }

    /// End the current recording now, as if silence had been detected
    pub fn stop_recording(&self) {
        self.send(Input::StopRecording);
    }

    /// Speak `text`, resolving once playback has ended
    ///
    /// Resolves immediately while muted. A second call while speech is in
    /// progress fails with [`SpeakError::Busy`].
    pub async fn speak(&self, text: impl Into<String>) -> Result<(), SpeakError> {
        let (done, rx) = oneshot::channel();
        if !self.send(Input::Speak {
            text: text.into(),
            done,
        }) {
            return Err(SpeakError::Stopped);
        }
        rx.await.unwrap_or(Err(SpeakError::Stopped))
    }

    /// Take the event stream
    ///
    /// The first event is the state at the time of the call. Only one
    /// stream exists per assistant.
    pub async fn events(&self) -> Result<EventStream, AssistantError> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Input::Subscribe { reply }) {
            return Err(AssistantError::Stopped);
        }
        match rx.await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => Err(AssistantError::AlreadySubscribed),
            Err(_) => Err(AssistantError::Stopped),
        }
    }

    /// Stop the recognizer and any speech or capture, then end the machine
    pub fn shutdown(&self) {
        self.send(Input::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engines::RecognitionResult;
    use crate::events::EventKind;
    use crate::testing::{FakeCapture, FakeRecognizer, FakeSynth};

    struct Fixture {
        assistant: Assistant,
        task: JoinHandle<()>,
        notifier: RecognizerNotifier,
        recognizer: FakeRecognizer,
        capture: FakeCapture,
        synth: FakeSynth,
    }

    fn spawn() -> Fixture {
        let recognizer = FakeRecognizer::new();
        let capture = FakeCapture::new().with_mime_type("audio/ogg");
        let synth = FakeSynth::new();
        let mut notifier = None;

        let (assistant, task) = Assistant::spawn(
            &AssistantConfig::default(),
            |n| {
                notifier = Some(n);
                Ok(Box::new(recognizer.clone()) as Box<dyn Recognizer>)
            },
            Engines {
                capture: Arc::new(capture.clone()),
                synthesizer: Arc::new(synth.clone()),
            },
        )
        .unwrap();

        Fixture {
            assistant,
            task,
            notifier: notifier.unwrap(),
            recognizer,
            capture,
            synth,
        }
    }

    async fn next_kind(events: &mut EventStream) -> EventKind {
        events.recv().await.unwrap().kind
    }

    async fn expect_state(events: &mut EventStream, expected: VoiceState) {
        loop {
            if let EventKind::StateChange { state } = next_kind(events).await {
                assert_eq!(state, expected);
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_event_is_current_state() {
        let f = spawn();
        let mut events = f.assistant.events().await.unwrap();
        assert!(matches!(
            next_kind(&mut events).await,
            EventKind::StateChange {
                state: VoiceState::ListeningForWake
            }
        ));
        assert_eq!(f.assistant.current_state(), VoiceState::ListeningForWake);
        assert_eq!(f.recognizer.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_sees_state_at_subscription() {
        let f = spawn();
        f.assistant.toggle_mute();
        let mut events = f.assistant.events().await.unwrap();
        expect_state(&mut events, VoiceState::Muted).await;
        assert_eq!(f.assistant.current_state(), VoiceState::Muted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_taken_once() {
        let f = spawn();
        let _events = f.assistant.events().await.unwrap();
        assert!(matches!(
            f.assistant.events().await,
            Err(AssistantError::AlreadySubscribed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_turn() {
        let f = spawn();
        let mut events = f.assistant.events().await.unwrap();
        expect_state(&mut events, VoiceState::ListeningForWake).await;

        f.notifier
            .results(0, vec![RecognitionResult::settled("ok metallica")]);
        expect_state(&mut events, VoiceState::Activating).await;
        expect_state(&mut events, VoiceState::Recording).await;

        f.capture.last_sink().unwrap().append_chunk(vec![5, 6]);
        f.notifier
            .results(0, vec![RecognitionResult::settled("what's the weather")]);

        // waiting on the stream lets the paused clock run to the timeout
        expect_state(&mut events, VoiceState::Processing).await;
        match next_kind(&mut events).await {
            EventKind::Command { audio, extension } => {
                assert_eq!(audio.unwrap().bytes(), &[5, 6]);
                assert_eq!(extension.as_deref(), Some("ogg"));
            }
            other => panic!("expected command, got {other}"),
        }

        let assistant = f.assistant.clone();
        let reply = tokio::spawn(async move { assistant.speak("sunny").await });
        expect_state(&mut events, VoiceState::Speaking).await;
        assert!(matches!(
            next_kind(&mut events).await,
            EventKind::SpeechStart { text } if text == "sunny"
        ));

        f.synth.complete_when_started(Ok(())).await;
        assert!(matches!(next_kind(&mut events).await, EventKind::SpeechEnd));
        expect_state(&mut events, VoiceState::ListeningForWake).await;
        assert_eq!(reply.await.unwrap(), Ok(()));
        assert!(f.recognizer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_factory_failure() {
        let result = Assistant::spawn(
            &AssistantConfig::default(),
            |_| Err(RecognizerError::Unavailable("no speech service".into())),
            Engines {
                capture: Arc::new(FakeCapture::new()),
                synthesizer: Arc::new(FakeSynth::new()),
            },
        );
        assert!(matches!(result, Err(AssistantError::Recognizer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_phrase_without_keywords_refused() {
        let config = AssistantConfig {
            wake_keywords: Vec::new(),
            ..AssistantConfig::default()
        };
        let result = Assistant::spawn(
            &config,
            |_| Ok(Box::new(FakeRecognizer::new()) as Box<dyn Recognizer>),
            Engines {
                capture: Arc::new(FakeCapture::new()),
                synthesizer: Arc::new(FakeSynth::new()),
            },
        );
        assert!(matches!(
            result,
            Err(AssistantError::WakePattern(WakePhraseError::NoKeywords))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_machine() {
        let f = spawn();
        f.assistant.shutdown();
        f.task.await.unwrap();

        assert!(!f.recognizer.is_running());
        assert_eq!(
            f.assistant.speak("anyone there").await,
            Err(SpeakError::Stopped)
        );
        assert!(matches!(
            f.assistant.events().await,
            Err(AssistantError::Stopped)
        ));
        assert!(!f.notifier.notify(crate::engines::RecognizerEvent::SpeechStarted));
        // harmless after shutdown
        f.assistant.toggle_mute();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_pending_speech() {
        let f = spawn();
        let assistant = f.assistant.clone();
        let reply = tokio::spawn(async move { assistant.speak("hello").await });

        let mut state = f.assistant.watch_state();
        state
            .wait_for(|s| *s == VoiceState::Speaking)
            .await
            .unwrap();
        f.assistant.shutdown();

        assert_eq!(reply.await.unwrap(), Err(SpeakError::Stopped));
        assert_eq!(f.synth.cancels(), 1);
    }
}
