//! # cpal Audio Backend
//!
//! Real microphone and speaker I/O on the system default devices.
//!
//! ## Threading:
//! `cpal::Stream` is not `Send` on every platform, so each stream is built and
//! owned by a dedicated thread that waits for commands over a std channel.
//! The session only ever holds the command sender.
//!
//! ## Formats:
//! Devices run at whatever rate and channel count they default to. Capture is
//! downmixed to mono and resampled to the session input rate, then cut into
//! fixed-size blocks. Playback buffers are resampled to the device rate when
//! scheduled and mixed by a [`ScheduledMixer`] inside the output callback.

use crate::audio::device::{
    AudioFrame, BufferId, CaptureFormat, CaptureStream, FrameCallback, Microphone, OutputDevice,
    PlaybackSink,
};
use crate::audio::mixer::ScheduledMixer;
use crate::error::VoiceError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use parking_lot::Mutex;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Input frames handed to rubato per call while streaming from a device.
const STREAM_CHUNK_FRAMES: usize = 1024;

fn resampler_error(e: impl std::fmt::Display) -> VoiceError {
    VoiceError::Device(format!("resampling failed: {}", e))
}

fn fast_resampler(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<FastFixedIn<f32>, VoiceError> {
    FastFixedIn::<f32>::new(
        to_rate as f64 / from_rate.max(1) as f64,
        1.0,
        PolynomialDegree::Septic,
        chunk_size.max(1),
        1,
    )
    .map_err(resampler_error)
}

/// Mono resampler for a continuous device stream.
///
/// rubato consumes fixed-size chunks while cpal delivers whatever the driver
/// picked, so input is staged until a full chunk is available. The filter
/// state carries over between chunks and blocks join without clicks.
struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    staged: Vec<f32>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self, VoiceError> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(fast_resampler(from_rate, to_rate, chunk_size)?)
        };
        Ok(Self {
            inner,
            staged: Vec::with_capacity(chunk_size * 2),
        })
    }

    /// Resample `input`, appending every completed chunk to `out`.
    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), VoiceError> {
        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.staged.extend_from_slice(input);
        loop {
            let needed = inner.input_frames_next();
            if self.staged.len() < needed {
                return Ok(());
            }
            let resampled = inner
                .process(&[&self.staged[..needed]], None)
                .map_err(resampler_error)?;
            if let Some(channel) = resampled.first() {
                out.extend_from_slice(channel);
            }
            self.staged.drain(..needed);
        }
    }
}

/// Resample one complete mono buffer.
fn resample_buffer(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, VoiceError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = fast_resampler(from_rate, to_rate, samples.len())?;
    let mut resampled = resampler.process(&[samples], None).map_err(resampler_error)?;
    Ok(resampled.pop().unwrap_or_default())
}

enum StreamCommand {
    Play,
    Shutdown,
}

/// Owns a cpal stream on its own thread until shutdown.
struct StreamThread {
    commands: std_mpsc::Sender<StreamCommand>,
}

impl StreamThread {
    /// Spawn a thread that builds a stream with `build`, reports the result,
    /// then services commands. `build` returns the stream plus a value handed
    /// back to the caller.
    async fn spawn<T, F>(name: &str, build: F) -> Result<(Self, T), VoiceError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<(cpal::Stream, T), VoiceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands, command_rx) = std_mpsc::channel();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, value)) => {
                        if ready_tx.send(Ok(value)).is_err() {
                            return;
                        }
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // A closed channel means the owner is gone
                while let Ok(command) = command_rx.recv() {
                    match command {
                        StreamCommand::Play => {
                            if let Err(e) = stream.play() {
                                error!("Failed to start audio stream: {}", e);
                            }
                        }
                        StreamCommand::Shutdown => break,
                    }
                }
                drop(stream);
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn audio thread: {}", e)))?;

        let value = ready_rx
            .await
            .map_err(|_| VoiceError::Device("audio thread exited during setup".to_string()))??;

        Ok((Self { commands }, value))
    }

    fn play(&self) -> Result<(), VoiceError> {
        self.commands
            .send(StreamCommand::Play)
            .map_err(|_| VoiceError::Device("audio thread is gone".to_string()))
    }

    fn shutdown(&self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
    }
}

fn f32_config(supported: cpal::SupportedStreamConfig) -> Result<StreamConfig, String> {
    if supported.sample_format() != SampleFormat::F32 {
        return Err(format!(
            "unsupported sample format {:?}, only f32 devices are supported",
            supported.sample_format()
        ));
    }
    Ok(supported.config())
}

/// Default system input device.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

type CallbackSlot = Arc<Mutex<Option<FrameCallback>>>;

fn build_input_stream(format: CaptureFormat, slot: CallbackSlot) -> Result<cpal::Stream, VoiceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::PermissionDenied("no input device available".to_string()))?;

    let config = device
        .default_input_config()
        .map_err(|e| VoiceError::PermissionDenied(format!("cannot query input device: {}", e)))
        .and_then(|supported| f32_config(supported).map_err(VoiceError::PermissionDenied))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        device_rate = config.sample_rate.0,
        channels = config.channels,
        "Opening input device"
    );

    let channels = config.channels.max(1) as usize;
    let block_size = format.block_size;
    let mut resampler = StreamResampler::new(config.sample_rate.0, format.sample_rate, STREAM_CHUNK_FRAMES)?;
    let mut mono = Vec::new();
    let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );
                if let Err(e) = resampler.process(&mono, &mut pending) {
                    warn!("Dropping captured audio: {}", e);
                    return;
                }

                while pending.len() >= block_size {
                    let block: Vec<f32> = pending.drain(..block_size).collect();
                    if let Some(on_frame) = slot.lock().as_mut() {
                        on_frame(AudioFrame::new(block));
                    }
                }
            },
            move |err| {
                warn!("Input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| VoiceError::PermissionDenied(format!("cannot open input stream: {}", e)))
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self, format: CaptureFormat) -> Result<Box<dyn CaptureStream>, VoiceError> {
        let slot: CallbackSlot = Arc::new(Mutex::new(None));
        let stream_slot = slot.clone();

        let (thread, ()) = StreamThread::spawn("voice-capture", move || {
            build_input_stream(format, stream_slot).map(|stream| (stream, ()))
        })
        .await
        .map_err(VoiceError::into_permission)?;

        Ok(Box::new(CpalCaptureStream {
            thread: Some(thread),
            slot,
        }))
    }
}

struct CpalCaptureStream {
    thread: Option<StreamThread>,
    slot: CallbackSlot,
}

impl CaptureStream for CpalCaptureStream {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), VoiceError> {
        let thread = self
            .thread
            .as_ref()
            .ok_or_else(|| VoiceError::Device("capture stream already stopped".to_string()))?;
        *self.slot.lock() = Some(on_frame);
        thread.play()
    }

    fn stop(&mut self) {
        self.slot.lock().take();
        if let Some(thread) = self.thread.take() {
            thread.shutdown();
        }
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default system output device.
#[derive(Debug, Default)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

fn build_output_stream(
    ended: mpsc::UnboundedSender<BufferId>,
) -> Result<(cpal::Stream, (ScheduledMixer, u32)), VoiceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::Device("no output device available".to_string()))?;

    let config = device
        .default_output_config()
        .map_err(|e| VoiceError::Device(format!("cannot query output device: {}", e)))
        .and_then(|supported| f32_config(supported).map_err(VoiceError::Device))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        device_rate = config.sample_rate.0,
        channels = config.channels,
        "Opening output device"
    );

    let channels = config.channels.max(1) as usize;
    let mixer = ScheduledMixer::new(config.sample_rate.0, ended);
    let render_mixer = mixer.clone();
    let mut scratch = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len() / channels, 0.0);
                render_mixer.render(&mut scratch);
                for (frame, sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                    frame.fill(*sample);
                }
            },
            move |err| {
                error!("Output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("cannot open output stream: {}", e)))?;

    Ok((stream, (mixer, config.sample_rate.0)))
}

#[async_trait]
impl OutputDevice for CpalOutput {
    async fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>, VoiceError> {
        let (thread, (mixer, device_rate)) =
            StreamThread::spawn("voice-playback", move || build_output_stream(ended)).await?;
        thread.play()?;

        Ok(Box::new(CpalPlaybackSink {
            thread: Some(thread),
            source_rate: sample_rate,
            device_rate,
            mixer,
        }))
    }
}

struct CpalPlaybackSink {
    thread: Option<StreamThread>,
    source_rate: u32,
    device_rate: u32,
    mixer: ScheduledMixer,
}

impl PlaybackSink for CpalPlaybackSink {
    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn schedule(&mut self, id: BufferId, samples: Vec<f32>, start_time: f64) -> Result<(), VoiceError> {
        if self.thread.is_none() {
            return Err(VoiceError::Device("output device is closed".to_string()));
        }

        let samples = if self.device_rate == self.source_rate {
            samples
        } else {
            resample_buffer(&samples, self.source_rate, self.device_rate)?
        };

        self.mixer.schedule(id, samples, start_time);
        Ok(())
    }

    fn stop(&mut self, id: BufferId) -> Result<(), VoiceError> {
        self.mixer.stop(id);
        Ok(())
    }

    fn close(&mut self) {
        self.mixer.clear();
        if let Some(thread) = self.thread.take() {
            thread.shutdown();
        }
    }
}

impl Drop for CpalPlaybackSink {
    fn drop(&mut self) {
        self.close();
    }
}
