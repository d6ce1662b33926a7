//! Core state machine implementation
//!
//! Owns the voice turn lifecycle: listening for the wake phrase, capturing
//! the utterance, handing it off as a command and speaking the reply.
//! Every mutation happens inside [`StateMachine::handle`] or
//! [`StateMachine::handle_timer`], one input at a time, so each reaction
//! sees a consistent state. Slow work (capture start and finalize, speech)
//! runs in spawned tasks that report back as further inputs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assistant::{AssistantError, SpeakError};
use crate::config::{AssistantConfig, Timeouts};
use crate::engines::{
    CaptureConstraints, CaptureEngine, CaptureError, CaptureSession, CapturedAudio, Engines,
    RecognitionErrorKind, Recognizer, RecognizerEvent, SynthesisError, Synthesizer,
    TranscriptDelta,
};
use crate::events::{EventChannel, EventKind, EventStream};
use crate::timers::{TimerFired, TimerKind, TimerSlots};
use crate::wake::WakeWordMatcher;

/// The six states of a voice turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    /// Recognizer running, waiting for the wake phrase
    ListeningForWake,
    /// Wake phrase heard, capture is being started
    Activating,
    /// Capturing the user's utterance
    Recording,
    /// Utterance handed off, waiting for the responder
    Processing,
    /// Recognizer off until unmuted
    Muted,
    /// Playing back a reply
    Speaking,
}

impl Default for VoiceState {
    fn default() -> Self {
        Self::ListeningForWake
    }
}

impl VoiceState {
    /// States in which a capture session may be live or starting
    pub fn is_capturing(self) -> bool {
        matches!(self, VoiceState::Activating | VoiceState::Recording)
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceState::ListeningForWake => write!(f, "ListeningForWake"),
            VoiceState::Activating => write!(f, "Activating"),
            VoiceState::Recording => write!(f, "Recording"),
            VoiceState::Processing => write!(f, "Processing"),
            VoiceState::Muted => write!(f, "Muted"),
            VoiceState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// Everything the state machine reacts to
pub(crate) enum Input {
    Recognizer(RecognizerEvent),
    ToggleMute,
    Speak {
        text: String,
        done: oneshot::Sender<Result<(), SpeakError>>,
    },
    StopRecording,
    Subscribe {
        reply: oneshot::Sender<Option<EventStream>>,
    },
    CaptureStarted {
        session_id: u64,
        result: Result<CaptureSession, CaptureError>,
    },
    CaptureFinalized {
        generation: u64,
        result: Result<CapturedAudio, CaptureError>,
    },
    SpeechFinished {
        utterance: u64,
        result: Result<(), SynthesisError>,
    },
    Shutdown,
}

/// Channel ends the state machine writes to
pub(crate) struct Channels {
    pub inputs_tx: mpsc::UnboundedSender<Input>,
    pub fired_tx: mpsc::UnboundedSender<TimerFired>,
    pub state_tx: watch::Sender<VoiceState>,
}

struct PendingSpeech {
    utterance: u64,
    done: oneshot::Sender<Result<(), SpeakError>>,
    task: JoinHandle<()>,
}

/// The state machine that drives voice turns
pub(crate) struct StateMachine {
    /// Current state
    state: VoiceState,
    /// Time when the current state was entered
    state_entered_at: Instant,
    /// Publishes the current state to handles
    state_tx: watch::Sender<VoiceState>,
    events: EventChannel,
    timers: TimerSlots,
    wake: WakeWordMatcher,
    timeouts: Timeouts,
    constraints: CaptureConstraints,
    recognizer: Box<dyn Recognizer>,
    capture: Arc<dyn CaptureEngine>,
    synthesizer: Arc<dyn Synthesizer>,
    /// For spawned work to report back
    inputs_tx: mpsc::UnboundedSender<Input>,
    /// The live capture session; only ever one
    session: Option<CaptureSession>,
    /// Id of the latest activation, carried by capture results
    session_id: u64,
    /// Bumped whenever a capture is abandoned; stale finalizations are dropped
    capture_generation: u64,
    speech: Option<PendingSpeech>,
    next_utterance: u64,
    /// Finalized text since recording started
    transcript: String,
}

impl StateMachine {
    /// Create a new state machine in ListeningForWake
    pub(crate) fn new(
        config: &AssistantConfig,
        recognizer: Box<dyn Recognizer>,
        engines: Engines,
        channels: Channels,
    ) -> Result<Self, AssistantError> {
        let wake = config.wake_matcher()?;
        let state = VoiceState::default();
        channels.state_tx.send_replace(state);

        Ok(Self {
            state,
            state_entered_at: Instant::now(),
            state_tx: channels.state_tx,
            events: EventChannel::new(),
            timers: TimerSlots::new(channels.fired_tx),
            wake,
            timeouts: config.timeouts,
            constraints: config.capture.clone(),
            recognizer,
            capture: engines.capture,
            synthesizer: engines.synthesizer,
            inputs_tx: channels.inputs_tx,
            session: None,
            session_id: 0,
            capture_generation: 0,
            speech: None,
            next_utterance: 0,
            transcript: String::new(),
        })
    }

    /// Run the state machine until shut down
    pub(crate) async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut fired: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        self.start();

        loop {
            tokio::select! {
                Some(input) = inputs.recv() => {
                    if !self.handle(input) {
                        break;
                    }
                }
                Some(timer) = fired.recv() => {
                    self.handle_timer(timer);
                }
                else => break,
            }
        }

        info!("state machine stopped");
    }

    /// Start listening for the wake phrase
    pub(crate) fn start(&mut self) {
        info!(state = %self.state, "state machine started");
        self.start_recognizer();
    }

    /// React to one input; returns false once the machine should stop
    pub(crate) fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Recognizer(event) => self.handle_recognizer_event(event),
            Input::ToggleMute => self.toggle_mute(),
            Input::Speak { text, done } => self.speak(text, done),
            Input::StopRecording => self.stop_recording(),
            Input::Subscribe { reply } => {
                let stream = self.events.subscribe(EventKind::StateChange { state: self.state });
                if stream.is_none() {
                    warn!("event stream requested twice, refusing");
                }
                let _ = reply.send(stream);
            }
            Input::CaptureStarted { session_id, result } => {
                self.handle_capture_started(session_id, result)
            }
            Input::CaptureFinalized { generation, result } => {
                self.handle_capture_finalized(generation, result)
            }
            Input::SpeechFinished { utterance, result } => {
                self.handle_speech_finished(utterance, result)
            }
            Input::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    /// React to a timer firing
    pub(crate) fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            debug!(timer = %fired.kind, "ignoring stale timer firing");
            return;
        }

        match fired.kind {
            TimerKind::WakeSilence => info!("nothing said after wake phrase, ending utterance"),
            TimerKind::UtteranceSilence => info!("silence detected, ending utterance"),
        }
        self.stop_recording();
    }

    /// Handle a recognizer notification
    fn handle_recognizer_event(&mut self, event: RecognizerEvent) {
        match event {
            RecognizerEvent::Result {
                result_index,
                results,
            } => {
                let delta = TranscriptDelta::from_results(result_index, &results);
                self.handle_transcript(delta);
            }
            RecognizerEvent::Error { kind } => self.handle_recognizer_error(&kind),
            RecognizerEvent::SpeechStarted => {
                if self.state == VoiceState::Recording
                    && self.timers.is_armed(TimerKind::WakeSilence)
                {
                    debug!("speech started, wake guard no longer needed");
                    self.timers.disarm(TimerKind::WakeSilence);
                }
            }
            RecognizerEvent::SpeechEnded => {
                debug!("recognizer reported end of speech");
            }
            RecognizerEvent::SessionEnded => match self.state {
                VoiceState::Speaking | VoiceState::Muted => {
                    debug!(state = %self.state, "recognizer session ended");
                }
                _ => {
                    debug!("recognizer session ended, restarting");
                    self.start_recognizer();
                }
            },
        }
    }

    fn handle_transcript(&mut self, delta: TranscriptDelta) {
        if self.state == VoiceState::Muted {
            return;
        }

        if !delta.interim.is_empty() {
            self.events.emit(EventKind::Transcript {
                text: delta.interim.clone(),
                is_final: false,
            });
        }
        if !delta.finalized.is_empty() {
            self.events.emit(EventKind::Transcript {
                text: delta.finalized.clone(),
                is_final: true,
            });
        }

        match self.state {
            VoiceState::ListeningForWake => {
                let heard = delta.combined();
                if self.wake.accepts(&heard) {
                    info!(text = %heard.trim(), "wake phrase detected");
                    self.activate();
                }
            }
            VoiceState::Recording => {
                self.transcript.push_str(&delta.finalized);
                let has_speech = self.transcript.len() + delta.interim.len() > 0;
                let duration = self.timeouts.end_of_utterance(has_speech);
                self.timers.arm(TimerKind::UtteranceSilence, duration);
            }
            _ => {}
        }
    }

    fn handle_recognizer_error(&mut self, kind: &str) {
        match RecognitionErrorKind::classify(kind) {
            RecognitionErrorKind::Aborted => {
                debug!("recognition aborted");
            }
            RecognitionErrorKind::NoSpeech => {
                debug!(state = %self.state, "recognizer heard no speech");
                self.stop_recording();
            }
            RecognitionErrorKind::Fatal(kind) => {
                warn!(kind = %kind, state = %self.state, "recognizer error");
                self.events.emit(EventKind::error(
                    format!("speech recognition error: {kind}"),
                    Some(kind),
                ));
                self.stop_recording();
            }
        }
    }

    /// Flip between Muted and ListeningForWake
    fn toggle_mute(&mut self) {
        if self.state == VoiceState::Muted {
            self.transition_to(VoiceState::ListeningForWake);
            self.start_recognizer();
            return;
        }

        self.recognizer.stop();
        self.cancel_speech();
        self.abandon_capture();
        self.transition_to(VoiceState::Muted);
    }

    /// Cancel speech in flight, completing its `speak` call
    ///
    /// The speech task is aborted before the synthesizer is cancelled so an
    /// utterance that has not reached the synthesizer yet never does.
    fn cancel_speech(&mut self) {
        if let Some(pending) = self.speech.take() {
            pending.task.abort();
            debug!(utterance = pending.utterance, "speech cancelled");
            self.events.emit(EventKind::SpeechEnd);
            let _ = pending.done.send(Ok(()));
        }
        self.synthesizer.cancel_all();
    }

    /// Speak a reply with the recognizer off
    fn speak(&mut self, text: String, done: oneshot::Sender<Result<(), SpeakError>>) {
        if self.state == VoiceState::Muted {
            debug!("muted, not speaking");
            let _ = done.send(Ok(()));
            return;
        }
        if self.speech.is_some() {
            warn!("speech already in progress, rejecting");
            let _ = done.send(Err(SpeakError::Busy));
            return;
        }

        // The utterance so far still becomes a command; a capture that is
        // only starting is dropped once it reports in.
        if self.state == VoiceState::Recording {
            self.finish_capture();
        }
        self.transition_to(VoiceState::Speaking);
        self.recognizer.stop();
        self.events.emit(EventKind::SpeechStart { text: text.clone() });

        self.next_utterance += 1;
        let utterance = self.next_utterance;
        let synthesizer = Arc::clone(&self.synthesizer);
        let inputs_tx = self.inputs_tx.clone();
        let task = tokio::spawn(async move {
            let result = synthesizer.speak(&text).await;
            let _ = inputs_tx.send(Input::SpeechFinished { utterance, result });
        });

        self.speech = Some(PendingSpeech {
            utterance,
            done,
            task,
        });
    }

    fn handle_speech_finished(&mut self, utterance: u64, result: Result<(), SynthesisError>) {
        let pending = match self.speech.take() {
            Some(pending) if pending.utterance == utterance => pending,
            other => {
                self.speech = other;
                debug!(utterance, "ignoring completion of unknown utterance");
                return;
            }
        };

        let outcome = match result {
            Ok(()) => {
                self.events.emit(EventKind::SpeechEnd);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "speech synthesis failed");
                self.events.emit(EventKind::error(
                    "speech synthesis failed",
                    Some(e.0.clone()),
                ));
                Err(SpeakError::Synthesis(e.0))
            }
        };

        // Muting (or anything else) during playback takes precedence
        if self.state == VoiceState::Speaking {
            self.transition_to(VoiceState::ListeningForWake);
            self.start_recognizer();
        }

        let _ = pending.done.send(outcome);
    }

    /// Wake phrase heard: start capturing the utterance
    fn activate(&mut self) {
        if self.state != VoiceState::ListeningForWake {
            return;
        }
        if self.session.is_some() {
            error!("capture session already live, refusing to start another");
            return;
        }

        self.transition_to(VoiceState::Activating);
        self.transcript.clear();

        self.session_id += 1;
        let session_id = self.session_id;
        let engine = Arc::clone(&self.capture);
        let constraints = self.constraints.clone();
        let inputs_tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = CaptureSession::begin(engine.as_ref(), &constraints).await;
            let _ = inputs_tx.send(Input::CaptureStarted { session_id, result });
        });
    }

    fn handle_capture_started(
        &mut self,
        session_id: u64,
        result: Result<CaptureSession, CaptureError>,
    ) {
        if session_id != self.session_id || self.state != VoiceState::Activating {
            if let Ok(session) = result {
                debug!(session_id, "activation abandoned, discarding capture");
                session.discard();
            }
            return;
        }

        match result {
            Ok(session) => {
                self.session = Some(session);
                self.transition_to(VoiceState::Recording);
                self.timers
                    .arm(TimerKind::WakeSilence, self.timeouts.wake_silence);
            }
            Err(e) => {
                warn!(error = %e, "capture unavailable, abandoning activation");
                self.events
                    .emit(EventKind::error("microphone unavailable", Some(e.to_string())));
                self.transition_to(VoiceState::ListeningForWake);
            }
        }
    }

    /// End the utterance and hand it off; only acts while Recording
    fn stop_recording(&mut self) {
        if self.state != VoiceState::Recording {
            return;
        }

        self.transition_to(VoiceState::Processing);
        self.finish_capture();
    }

    /// Stop both timers and finalize the live capture into a command
    fn finish_capture(&mut self) {
        self.timers.disarm_all();

        let Some(session) = self.session.take() else {
            warn!("recording without a capture session");
            self.emit_command(None);
            return;
        };

        let generation = self.capture_generation;
        let inputs_tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = session.finalize().await;
            let _ = inputs_tx.send(Input::CaptureFinalized { generation, result });
        });
    }

    /// Only muting or shutting down drops a capture that is finalizing
    fn handle_capture_finalized(
        &mut self,
        generation: u64,
        result: Result<CapturedAudio, CaptureError>,
    ) {
        if generation != self.capture_generation {
            if let Ok(audio) = result {
                info!(
                    bytes = audio.locator.len(),
                    "turn abandoned while finalizing, releasing audio"
                );
            }
            return;
        }

        match result {
            Ok(audio) => self.emit_command(Some(audio)),
            Err(CaptureError::NoAudio) => {
                warn!("utterance ended without any captured audio");
                self.emit_command(None);
            }
            Err(e) => {
                warn!(error = %e, "failed to finalize capture");
                self.events.emit(EventKind::error(
                    "failed to finalize captured audio",
                    Some(e.to_string()),
                ));
                self.emit_command(None);
            }
        }
    }

    fn emit_command(&mut self, audio: Option<CapturedAudio>) {
        let (audio, extension) = match audio {
            Some(captured) => (Some(captured.locator), Some(captured.extension)),
            None => (None, None),
        };
        self.events.emit(EventKind::Command { audio, extension });
    }

    /// Drop the live capture and any finalization in flight, and stop both
    /// timers
    fn abandon_capture(&mut self) {
        self.capture_generation += 1;
        if let Some(session) = self.session.take() {
            session.discard();
        }
        self.timers.disarm_all();
    }

    fn start_recognizer(&mut self) {
        if let Err(e) = self.recognizer.start() {
            warn!(error = %e, "failed to start recognizer");
            self.events.emit(EventKind::error(
                "speech recognition could not be started",
                Some(e.to_string()),
            ));
        }
    }

    fn shutdown(&mut self) {
        info!(state = %self.state, "state machine shutting down");
        self.recognizer.stop();
        if let Some(pending) = self.speech.take() {
            pending.task.abort();
            let _ = pending.done.send(Err(SpeakError::Stopped));
        }
        self.synthesizer.cancel_all();
        self.abandon_capture();
    }

    /// Perform a state transition
    fn transition_to(&mut self, new_state: VoiceState) {
        if new_state == self.state {
            return;
        }

        let old_state = self.state;
        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        info!(
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            "state transition"
        );

        self.state = new_state;
        self.state_entered_at = Instant::now();
        self.state_tx.send_replace(new_state);
        self.events.emit(EventKind::StateChange { state: new_state });
    }
}
