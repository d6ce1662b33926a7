//! Scriptable engines for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::engines::{
    CaptureConstraints, CaptureEngine, CaptureError, CaptureHandle, ChunkSink, Recognizer,
    RecognizerError, SynthesisError, Synthesizer,
};

fn lock<T>(inner: &Mutex<T>) -> MutexGuard<'_, T> {
    inner.lock().unwrap()
}

#[derive(Debug, Default)]
struct RecognizerState {
    starts: usize,
    stops: usize,
    running: bool,
    fail_starts: bool,
}

/// Recognizer that records start/stop calls
#[derive(Debug, Clone, Default)]
pub struct FakeRecognizer {
    inner: Arc<Mutex<RecognizerState>>,
}

impl FakeRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_starts(&self, fail: bool) {
        lock(&self.inner).fail_starts = fail;
    }

    pub fn starts(&self) -> usize {
        lock(&self.inner).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.inner).stops
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner).running
    }
}

impl Recognizer for FakeRecognizer {
    fn start(&mut self) -> Result<(), RecognizerError> {
        let mut state = lock(&self.inner);
        if state.fail_starts {
            return Err(RecognizerError::Start("engine busy".into()));
        }
        state.starts += 1;
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.inner);
        state.stops += 1;
        state.running = false;
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    mime_type: Option<String>,
    denied: Option<String>,
    stop_error: Option<String>,
    flush_chunk: Option<Vec<u8>>,
    sinks: Vec<ChunkSink>,
    begins: usize,
    stops: usize,
    aborts: usize,
    live: usize,
    max_live: usize,
}

/// Capture engine whose sessions are fed by the test
#[derive(Debug, Clone, Default)]
pub struct FakeCapture {
    inner: Arc<Mutex<CaptureState>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mime_type(self, mime_type: &str) -> Self {
        lock(&self.inner).mime_type = Some(mime_type.to_string());
        self
    }

    /// Fail every `begin` as if permission was refused
    pub fn denied(self, reason: &str) -> Self {
        lock(&self.inner).denied = Some(reason.to_string());
        self
    }

    /// Fail every `stop` with a processing fault
    pub fn with_stop_error(self, reason: &str) -> Self {
        lock(&self.inner).stop_error = Some(reason.to_string());
        self
    }

    /// Deliver `chunk` while stopping, like an encoder flushing its buffer
    pub fn with_flush_chunk(self, chunk: Vec<u8>) -> Self {
        lock(&self.inner).flush_chunk = Some(chunk);
        self
    }

    pub fn last_sink(&self) -> Option<ChunkSink> {
        lock(&self.inner).sinks.last().cloned()
    }

    pub fn begins(&self) -> usize {
        lock(&self.inner).begins
    }

    pub fn stops(&self) -> usize {
        lock(&self.inner).stops
    }

    pub fn aborts(&self) -> usize {
        lock(&self.inner).aborts
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.inner).live
    }

    pub fn max_live_sessions(&self) -> usize {
        lock(&self.inner).max_live
    }
}

#[async_trait]
impl CaptureEngine for FakeCapture {
    async fn begin(
        &self,
        _constraints: &CaptureConstraints,
        sink: ChunkSink,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let mut state = lock(&self.inner);
        if let Some(reason) = &state.denied {
            return Err(CaptureError::Unavailable(reason.clone()));
        }
        state.begins += 1;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.sinks.push(sink.clone());

        Ok(Box::new(FakeCaptureHandle {
            inner: Arc::clone(&self.inner),
            mime_type: state.mime_type.clone(),
            sink,
            open: true,
        }))
    }
}

struct FakeCaptureHandle {
    inner: Arc<Mutex<CaptureState>>,
    mime_type: Option<String>,
    sink: ChunkSink,
    open: bool,
}

impl FakeCaptureHandle {
    fn close(&mut self, state: &mut CaptureState) {
        if self.open {
            self.open = false;
            state.live -= 1;
        }
    }
}

#[async_trait]
impl CaptureHandle for FakeCaptureHandle {
    fn mime_type(&self) -> Option<String> {
        self.mime_type.clone()
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        let inner = Arc::clone(&self.inner);
        let mut state = lock(&inner);
        state.stops += 1;
        self.close(&mut state);

        if let Some(reason) = &state.stop_error {
            return Err(CaptureError::Finalize(reason.clone()));
        }
        if let Some(chunk) = state.flush_chunk.clone() {
            self.sink.append_chunk(chunk);
        }
        Ok(())
    }

    fn abort(&mut self) {
        let inner = Arc::clone(&self.inner);
        let mut state = lock(&inner);
        state.aborts += 1;
        self.close(&mut state);
    }
}

#[derive(Debug, Default)]
struct SynthState {
    spoken: Vec<String>,
    cancels: usize,
    pending: VecDeque<oneshot::Sender<Result<(), SynthesisError>>>,
}

/// Synthesizer whose utterances finish when the test says so
#[derive(Debug, Clone, Default)]
pub struct FakeSynth {
    inner: Arc<Mutex<SynthState>>,
}

impl FakeSynth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spoken(&self) -> Vec<String> {
        lock(&self.inner).spoken.clone()
    }

    pub fn cancels(&self) -> usize {
        lock(&self.inner).cancels
    }

    /// Wait for an utterance to reach the synthesizer, then finish it
    pub async fn complete_when_started(&self, result: Result<(), SynthesisError>) {
        while lock(&self.inner).pending.is_empty() {
            tokio::task::yield_now().await;
        }
        self.complete_next(result);
    }

    /// Finish the oldest pending utterance; false if none was pending
    pub fn complete_next(&self, result: Result<(), SynthesisError>) -> bool {
        match lock(&self.inner).pending.pop_front() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn speak(&self, text: &str) -> Result<(), SynthesisError> {
        let rx = {
            let mut state = lock(&self.inner);
            state.spoken.push(text.to_string());
            let (tx, rx) = oneshot::channel();
            state.pending.push_back(tx);
            rx
        };
        rx.await.unwrap_or(Ok(()))
    }

    fn cancel_all(&self) {
        let mut state = lock(&self.inner);
        state.cancels += 1;
        for tx in state.pending.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }
}
