//! # Voice Session State Machine
//!
//! Owns the one live voice interaction of this client: the microphone stream,
//! the playback device, the transport connection and the two pipelines
//! between them.
//!
//! ## Session Lifecycle:
//! ```text
//! Idle → RequestingPermission → Connecting → Streaming → Closing → Idle
//!                 └───────────────┴─────────────┴──→ Error ──→ Closing
//! ```
//! 1. **RequestingPermission**: the microphone is acquired before any network
//!    resource, so a denied microphone never produces a connected-but-deaf session
//! 2. **Connecting**: the output device is opened, then the transport
//! 3. **Streaming**: capture feeds the outbound queue, inbound audio is scheduled
//! 4. **Closing**: every resource is released, then the close event fires
//!
//! ## Concurrency:
//! All mutable session state sits behind one `parking_lot::Mutex`. Audio
//! callbacks, transport events and API calls each take it briefly and never
//! hold it across an `.await`. A generation counter, bumped on every connect
//! and teardown, lets late callbacks and in-flight connects recognise that
//! the session they belonged to is gone.

use crate::audio::capture::CapturePipeline;
use crate::audio::device::{AudioFrame, BufferId, CaptureFormat, CaptureStream, FrameCallback, Microphone, OutputDevice};
use crate::audio::playback::PlaybackPipeline;
use crate::audio::volume::{SessionEvent, VolumeMeter, VolumeNotifier};
use crate::config::AppConfig;
use crate::error::VoiceError;
use crate::live::protocol::{LiveEvent, OutboundChunk, SessionSetup};
use crate::live::transport::{LiveConnection, LiveSink, LiveTransport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current state of the voice session.
///
/// ## Rust Concepts:
/// - **Copy**: Small enum, passed around by value
/// - **#[serde(rename_all)]**: Serialized as `"requesting_permission"` etc. for the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; `connect()` is accepted
    #[default]
    Idle,
    /// Waiting for microphone access
    RequestingPermission,
    /// Microphone acquired, opening the output device and transport
    Connecting,
    /// Audio flows in both directions
    Streaming,
    /// Tearing down
    Closing,
    /// A failure occurred; teardown follows immediately
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::RequestingPermission => "requesting_permission",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Error => "error",
        }
    }
}

/// Everything a connect needs to know, captured from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub setup: SessionSetup,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub block_size: usize,
    pub outbound_queue_capacity: usize,
    pub input_meter: VolumeMeter,
    pub output_meter: VolumeMeter,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            setup: SessionSetup {
                model: config.live.model.clone(),
                voice: config.live.voice.clone(),
                system_instruction: config.live.system_instruction.clone(),
            },
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            block_size: config.audio.block_size,
            outbound_queue_capacity: config.audio.outbound_queue_capacity.max(1),
            input_meter: VolumeMeter::new(config.audio.input_volume_stride, config.audio.input_volume_scale),
            output_meter: VolumeMeter::new(config.audio.output_volume_stride, config.audio.output_volume_scale),
        }
    }
}

/// Point-in-time view of the session, for the status API and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub volume: f32,
    pub pending_buffers: usize,
    pub playback_cursor: f64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub last_error: Option<String>,
}

/// What a call to [`VoiceSession::connect`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub state: SessionState,
    /// False when a session was already active and the call changed nothing
    pub started: bool,
}

#[derive(Default)]
struct SessionCore {
    state: SessionState,
    generation: u64,
    session_id: Option<Uuid>,
    microphone: Option<Box<dyn CaptureStream>>,
    capture: Option<CapturePipeline>,
    playback: Option<PlaybackPipeline>,
    sender_shutdown: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
    last_error: Option<VoiceError>,
}

struct Shared {
    settings: RwLock<SessionSettings>,
    microphone: Arc<dyn Microphone>,
    output: Arc<dyn OutputDevice>,
    transport: Arc<dyn LiveTransport>,
    notifier: VolumeNotifier,
    core: Mutex<SessionCore>,
}

/// Handle to the voice session. Clones share the same session.
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<Shared>,
}

impl VoiceSession {
    pub fn new(
        settings: SessionSettings,
        microphone: Arc<dyn Microphone>,
        output: Arc<dyn OutputDevice>,
        transport: Arc<dyn LiveTransport>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings: RwLock::new(settings),
                microphone,
                output,
                transport,
                notifier: VolumeNotifier::new(),
                core: Mutex::new(SessionCore::default()),
            }),
        }
    }

    /// Start a session.
    ///
    /// A no-op returning the current state with `started: false` when a
    /// session is already active.
    ///
    /// ## Errors:
    /// - `PermissionDenied`: the microphone could not be acquired; the session
    ///   goes straight back to `Idle` and no transport is opened
    /// - `ConnectionFailed`: the transport could not be opened, or the session
    ///   was disconnected while connecting
    /// - `Device`: the output device could not be opened
    ///
    /// Dropping the returned future before it resolves tears down whatever
    /// it had acquired and leaves the session `Idle`.
    pub async fn connect(&self) -> Result<ConnectOutcome, VoiceError> {
        let mut guard = ConnectGuard {
            session: self.clone(),
            generation: None,
        };
        let result = self.start(&mut guard).await;
        guard.generation = None;
        result
    }

    async fn start(&self, guard: &mut ConnectGuard) -> Result<ConnectOutcome, VoiceError> {
        let settings = self.shared.settings.read().clone();

        let generation = {
            let mut core = self.shared.core.lock();
            if core.state != SessionState::Idle {
                debug!(state = core.state.as_str(), "connect() ignored, session already active");
                return Ok(ConnectOutcome {
                    state: core.state,
                    started: false,
                });
            }
            core.generation += 1;
            core.session_id = Some(Uuid::new_v4());
            core.last_error = None;
            self.transition(&mut core, SessionState::RequestingPermission);
            core.generation
        };
        guard.generation = Some(generation);

        info!(generation, "Requesting microphone");
        let format = CaptureFormat::mono(settings.input_sample_rate, settings.block_size);
        let mut microphone = match self.shared.microphone.open(format).await {
            Ok(microphone) => microphone,
            Err(e) => {
                let err = e.into_permission();
                warn!(generation, "Microphone unavailable: {}", err);
                let mut core = self.shared.core.lock();
                if core.generation == generation {
                    core.last_error = Some(err.clone());
                    core.session_id = None;
                    self.transition(&mut core, SessionState::Idle);
                }
                return Err(err);
            }
        };

        {
            let mut core = self.shared.core.lock();
            if core.generation != generation {
                drop(core);
                microphone.stop();
                return Err(cancelled());
            }
            core.microphone = Some(microphone);
            self.transition(&mut core, SessionState::Connecting);
        }

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mut sink = match self.shared.output.open(settings.output_sample_rate, ended_tx).await {
            Ok(sink) => sink,
            Err(e) => return Err(self.abort_connect(generation, e)),
        };

        {
            let mut core = self.shared.core.lock();
            if core.generation != generation {
                drop(core);
                sink.close();
                return Err(cancelled());
            }
            core.playback = Some(PlaybackPipeline::new(sink, settings.output_sample_rate, settings.output_meter));
            core.tasks.push(tokio::spawn(run_ended_pump(
                Arc::downgrade(&self.shared),
                ended_rx,
                generation,
            )));
        }

        info!(generation, model = %settings.setup.qualified_model(), voice = %settings.setup.voice, "Opening live transport");
        let LiveConnection { sink: live_sink, events } = match self.shared.transport.open(&settings.setup).await {
            Ok(connection) => connection,
            Err(e) => return Err(self.abort_connect(generation, e.into_connection())),
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let start_result = {
            let mut core = self.shared.core.lock();
            if core.generation != generation {
                drop(core);
                tokio::spawn(close_sink(live_sink));
                return Err(cancelled());
            }

            core.capture = Some(CapturePipeline::new(outbound_tx, settings.input_meter));
            core.sender_shutdown = Some(shutdown_tx);
            // The sender closes the socket itself on shutdown, so it is never aborted
            tokio::spawn(run_sender(live_sink, outbound_rx, shutdown_rx, generation));
            core.tasks.push(tokio::spawn(run_inbound(
                Arc::downgrade(&self.shared),
                events,
                generation,
            )));
            self.transition(&mut core, SessionState::Streaming);

            let callback = self.frame_callback(generation);
            match core.microphone.as_mut() {
                Some(microphone) => microphone.start(callback),
                None => Err(VoiceError::PermissionDenied("microphone released".to_string())),
            }
        };

        if let Err(e) = start_result {
            return Err(self.abort_connect(generation, e.into_permission()));
        }

        info!(generation, "Session streaming");
        Ok(ConnectOutcome {
            state: SessionState::Streaming,
            started: true,
        })
    }

    /// Tear the session down. Idempotent and safe from any state.
    ///
    /// Once this returns no further microphone frame is sent, all pending
    /// playback is stopped, the devices are released and observers have
    /// received exactly one close event.
    pub fn disconnect(&self) {
        let (microphone, capture, playback, shutdown, tasks, generation) = {
            let mut core = self.shared.core.lock();
            if matches!(core.state, SessionState::Idle | SessionState::Closing) {
                debug!(state = core.state.as_str(), "disconnect() ignored");
                return;
            }
            self.transition(&mut core, SessionState::Closing);
            core.generation += 1;
            (
                core.microphone.take(),
                core.capture.take(),
                core.playback.take(),
                core.sender_shutdown.take(),
                std::mem::take(&mut core.tasks),
                core.generation,
            )
        };

        if let Some(mut microphone) = microphone {
            microphone.stop();
        }
        drop(capture);
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        for task in tasks {
            task.abort();
        }
        if let Some(mut playback) = playback {
            playback.shutdown();
        }

        {
            let mut core = self.shared.core.lock();
            core.session_id = None;
            self.transition(&mut core, SessionState::Idle);
        }

        self.shared.notifier.reset();
        self.shared.notifier.closed();
        info!(generation, "Session closed");
    }

    /// Discard all unplayed output, as if the remote side signalled barge-in.
    pub fn interrupt(&self) {
        let generation = self.shared.core.lock().generation;
        self.on_interrupted(generation);
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.lock().state
    }

    pub fn last_error(&self) -> Option<VoiceError> {
        self.shared.core.lock().last_error.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let core = self.shared.core.lock();
        let playback = core.playback.as_ref();
        let capture = core.capture.as_ref();

        SessionSnapshot {
            session_id: core.session_id,
            state: core.state,
            volume: self.shared.notifier.current(),
            pending_buffers: playback.map(|p| p.pending_buffers()).unwrap_or(0),
            playback_cursor: playback.map(|p| p.cursor()).unwrap_or(0.0),
            frames_sent: capture.map(|c| c.frames_sent()).unwrap_or(0),
            frames_dropped: capture.map(|c| c.frames_dropped()).unwrap_or(0),
            chunks_played: playback.map(|p| p.chunks_played()).unwrap_or(0),
            chunks_dropped: playback.map(|p| p.chunks_dropped()).unwrap_or(0),
            last_error: core.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Replace the settings used by the next `connect()`.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self.shared.settings.write() = settings;
    }

    pub fn settings(&self) -> SessionSettings {
        self.shared.settings.read().clone()
    }

    /// Observe the merged input/output volume in [0, 100].
    pub fn subscribe_volume(&self) -> watch::Receiver<f32> {
        self.shared.notifier.subscribe()
    }

    /// Observe state changes and close events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.notifier.subscribe_events()
    }

    fn transition(&self, core: &mut SessionCore, state: SessionState) {
        if core.state != state {
            debug!(from = core.state.as_str(), to = state.as_str(), "Session state change");
            core.state = state;
            self.shared.notifier.state_changed(state);
        }
    }

    /// Fail an in-progress connect: record the error, pass through `Error`
    /// and tear down whatever was acquired so far.
    fn abort_connect(&self, generation: u64, err: VoiceError) -> VoiceError {
        {
            let mut core = self.shared.core.lock();
            if core.generation != generation {
                return cancelled();
            }
            core.last_error = Some(err.clone());
            self.transition(&mut core, SessionState::Error);
        }
        warn!(generation, "Connect failed: {}", err);
        self.disconnect();
        err
    }

    fn frame_callback(&self, generation: u64) -> FrameCallback {
        let shared = Arc::downgrade(&self.shared);
        Box::new(move |frame: AudioFrame| {
            let Some(shared) = shared.upgrade() else { return };
            let level = {
                let mut core = shared.core.lock();
                if core.state != SessionState::Streaming || core.generation != generation {
                    return;
                }
                match core.capture.as_mut() {
                    Some(capture) => capture.process(&frame),
                    None => return,
                }
            };
            shared.notifier.publish(level);
        })
    }

    fn on_inbound_audio(&self, generation: u64, data: &str) {
        let level = {
            let mut core = self.shared.core.lock();
            if core.state != SessionState::Streaming || core.generation != generation {
                return;
            }
            let Some(playback) = core.playback.as_mut() else { return };
            match playback.enqueue(data) {
                Ok(Some(buffer)) => {
                    debug!(
                        generation,
                        buffer = buffer.id,
                        start = buffer.start_time,
                        duration = buffer.duration,
                        "Scheduled inbound audio"
                    );
                    Some(buffer.level)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(generation, "Dropping inbound audio chunk: {}", e);
                    None
                }
            }
        };

        if let Some(level) = level {
            self.shared.notifier.publish(level);
        }
    }

    fn on_interrupted(&self, generation: u64) {
        {
            let mut core = self.shared.core.lock();
            if core.state != SessionState::Streaming || core.generation != generation {
                return;
            }
            let Some(playback) = core.playback.as_mut() else { return };
            let stopped = playback.interrupt();
            info!(generation, stopped, "Playback interrupted");
        }
        self.shared.notifier.reset();
    }

    fn on_playback_ended(&self, generation: u64, id: BufferId) {
        let quiet = {
            let mut core = self.shared.core.lock();
            if core.generation != generation {
                return;
            }
            core.playback.as_mut().map(|p| p.finish(id)).unwrap_or(false)
        };

        if quiet {
            self.shared.notifier.reset();
        }
    }

    fn on_transport_closed(&self, generation: u64, reason: Option<String>) {
        {
            let core = self.shared.core.lock();
            if core.generation != generation {
                return;
            }
        }
        info!(generation, reason = reason.as_deref().unwrap_or("none"), "Live connection closed by server");
        self.disconnect();
    }

    fn on_transport_error(&self, generation: u64, message: String) {
        {
            let mut core = self.shared.core.lock();
            if core.generation != generation {
                return;
            }
            core.last_error = Some(VoiceError::ConnectionFailed(message.clone()));
            self.transition(&mut core, SessionState::Error);
        }
        warn!(generation, "Live connection failed: {}", message);
        self.disconnect();
    }
}

/// Tears down a connect whose future was dropped mid-flight.
///
/// Armed with the connect's generation once it leaves `Idle`; a connect that
/// resolves disarms it first.
struct ConnectGuard {
    session: VoiceSession,
    generation: Option<u64>,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        let Some(generation) = self.generation.take() else { return };
        let abandoned = {
            let core = self.session.shared.core.lock();
            core.generation == generation
                && matches!(core.state, SessionState::RequestingPermission | SessionState::Connecting)
        };
        if abandoned {
            warn!(generation, "Connect abandoned before it finished, tearing down");
            self.session.disconnect();
        }
    }
}

fn cancelled() -> VoiceError {
    VoiceError::ConnectionFailed("session was disconnected while connecting".to_string())
}

async fn close_sink(mut sink: Box<dyn LiveSink>) {
    sink.close().await;
}

/// Drain the outbound queue into the transport until shutdown.
async fn run_sender(
    mut sink: Box<dyn LiveSink>,
    mut outbound: mpsc::Receiver<OutboundChunk>,
    mut shutdown: oneshot::Receiver<()>,
    generation: u64,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            chunk = outbound.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.send_realtime_input(&chunk).await {
                        warn!(generation, "Dropping outbound frame: {}", e);
                    }
                }
                None => break,
            },
        }
    }

    sink.close().await;
    debug!(generation, "Sender finished");
}

/// Route server events into the session.
async fn run_inbound(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<LiveEvent>, generation: u64) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { return };
        let session = VoiceSession { shared };

        match event {
            LiveEvent::Audio(data) => session.on_inbound_audio(generation, &data),
            LiveEvent::Interrupted => session.on_interrupted(generation),
            LiveEvent::TurnComplete => debug!(generation, "Model turn complete"),
            LiveEvent::SetupComplete => {}
            LiveEvent::Closed(reason) => {
                session.on_transport_closed(generation, reason);
                return;
            }
            LiveEvent::Error(message) => {
                session.on_transport_error(generation, message);
                return;
            }
        }
    }

    // The transport went away without saying goodbye
    if let Some(shared) = shared.upgrade() {
        VoiceSession { shared }.on_transport_closed(generation, None);
    }
}

/// Forward "buffer finished" notifications from the output device.
async fn run_ended_pump(shared: Weak<Shared>, mut ended: mpsc::UnboundedReceiver<BufferId>, generation: u64) {
    while let Some(id) = ended.recv().await {
        let Some(shared) = shared.upgrade() else { return };
        VoiceSession { shared }.on_playback_ended(generation, id);
    }
}
