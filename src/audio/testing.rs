//! Scripted collaborators for session tests: a microphone that can be denied
//! and driven by hand, an output device with a settable clock, and a
//! transport that records what it was asked to do.

use crate::audio::device::{
    AudioFrame, BufferId, CaptureFormat, CaptureStream, FrameCallback, Microphone, OutputDevice,
    PlaybackSink,
};
use crate::error::VoiceError;
use crate::live::protocol::{LiveEvent, OutboundChunk, SessionSetup};
use crate::live::transport::{LiveConnection, LiveSink, LiveTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct MicState {
    deny: bool,
    opened: usize,
    stopped: usize,
    gate: Option<Arc<Notify>>,
    // Kept after stop so tests can fire callbacks that arrive late
    callback: Option<FrameCallback>,
}

#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, deny: bool) {
        self.state.lock().deny = deny;
    }

    /// Make the next `open` wait for the user until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().gate = Some(gate.clone());
        gate
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn stopped(&self) -> usize {
        self.state.lock().stopped
    }

    /// Deliver a block to the registered callback, if any.
    pub fn emit(&self, frame: AudioFrame) -> bool {
        let callback = self.state.lock().callback.take();
        match callback {
            Some(mut callback) => {
                callback(frame);
                let mut state = self.state.lock();
                if state.callback.is_none() {
                    state.callback = Some(callback);
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn open(&self, _format: CaptureFormat) -> Result<Box<dyn CaptureStream>, VoiceError> {
        let gate = self.state.lock().gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if state.deny {
            return Err(VoiceError::PermissionDenied("denied by user".to_string()));
        }
        state.opened += 1;
        Ok(Box::new(FakeCaptureStream {
            state: self.state.clone(),
        }))
    }
}

struct FakeCaptureStream {
    state: Arc<Mutex<MicState>>,
}

impl CaptureStream for FakeCaptureStream {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), VoiceError> {
        self.state.lock().callback = Some(on_frame);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.lock().stopped += 1;
    }
}

#[derive(Default)]
struct OutputState {
    time: f64,
    fail_open: bool,
    fail_stops: bool,
    opened: usize,
    closed: usize,
    scheduled: Vec<(BufferId, f64, usize)>,
    stopped: Vec<BufferId>,
    ended: Option<mpsc::UnboundedSender<BufferId>>,
}

#[derive(Clone, Default)]
pub struct FakeOutput {
    state: Arc<Mutex<OutputState>>,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, time: f64) {
        self.state.lock().time = time;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn fail_stops(&self, fail: bool) {
        self.state.lock().fail_stops = fail;
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    /// `(id, start_time, sample_count)` of every scheduled buffer.
    pub fn scheduled(&self) -> Vec<(BufferId, f64, usize)> {
        self.state.lock().scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<BufferId> {
        self.state.lock().stopped.clone()
    }

    /// A sink that is not attached to an ended channel.
    pub fn sink(&self) -> Box<dyn PlaybackSink> {
        Box::new(FakeSink {
            state: self.state.clone(),
        })
    }

    /// Report a buffer as fully played.
    pub fn finish(&self, id: BufferId) {
        if let Some(ended) = self.state.lock().ended.as_ref() {
            let _ = ended.send(id);
        }
    }
}

#[async_trait]
impl OutputDevice for FakeOutput {
    async fn open(
        &self,
        _sample_rate: u32,
        ended: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>, VoiceError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(VoiceError::Device("no output device".to_string()));
        }
        state.opened += 1;
        state.ended = Some(ended);
        Ok(Box::new(FakeSink {
            state: self.state.clone(),
        }))
    }
}

struct FakeSink {
    state: Arc<Mutex<OutputState>>,
}

impl PlaybackSink for FakeSink {
    fn current_time(&self) -> f64 {
        self.state.lock().time
    }

    fn schedule(&mut self, id: BufferId, samples: Vec<f32>, start_time: f64) -> Result<(), VoiceError> {
        self.state.lock().scheduled.push((id, start_time, samples.len()));
        Ok(())
    }

    fn stop(&mut self, id: BufferId) -> Result<(), VoiceError> {
        let mut state = self.state.lock();
        if state.fail_stops {
            return Err(VoiceError::Device("buffer already released".to_string()));
        }
        state.stopped.push(id);
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().closed += 1;
    }
}

#[derive(Default)]
struct TransportState {
    fail: bool,
    fail_sends: bool,
    opened: usize,
    closed: usize,
    setups: Vec<SessionSetup>,
    sent: Vec<OutboundChunk>,
    events: Option<mpsc::UnboundedSender<LiveEvent>>,
    gate: Option<Arc<Notify>>,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Make `open` wait until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().gate = Some(gate.clone());
        gate
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.state.lock().setups.clone()
    }

    pub fn sent(&self) -> Vec<OutboundChunk> {
        self.state.lock().sent.clone()
    }

    /// Deliver a server event to the open connection.
    pub fn push(&self, event: LiveEvent) -> bool {
        self.state
            .lock()
            .events
            .as_ref()
            .map(|events| events.send(event).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn open(&self, setup: &SessionSetup) -> Result<LiveConnection, VoiceError> {
        let gate = {
            let mut state = self.state.lock();
            state.opened += 1;
            state.setups.push(setup.clone());
            state.gate.take()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if state.fail {
            return Err(VoiceError::ConnectionFailed("endpoint refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        Ok(LiveConnection {
            sink: Box::new(FakeLiveSink {
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

struct FakeLiveSink {
    state: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl LiveSink for FakeLiveSink {
    async fn send_realtime_input(&mut self, chunk: &OutboundChunk) -> Result<(), VoiceError> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(VoiceError::Send("socket closed".to_string()));
        }
        state.sent.push(chunk.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().closed += 1;
    }
}
