//! # Audio Device Abstractions
//!
//! The session never talks to sound hardware directly. It goes through four
//! small traits so the same state machine runs against real devices (cpal),
//! the headless null backend, or the fakes used in tests.
//!
//! ## Traits:
//! - **Microphone**: asynchronously acquires a capture stream (this is where
//!   permission or availability failures surface)
//! - **CaptureStream**: delivers fixed-size blocks to a callback until stopped
//! - **OutputDevice**: opens a playback sink at a given sample rate
//! - **PlaybackSink**: schedules buffers against its own clock
//!
//! ## Timing model:
//! A sink exposes `current_time()` in seconds. It advances in real time
//! whether or not software is running, and buffers are placed on that same
//! timeline. When a buffer has been fully played its id is sent on the
//! `ended` channel handed to [`OutputDevice::open`].

use crate::config::{AudioBackend, AudioConfig};
use crate::error::VoiceError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifier of a scheduled playback buffer, unique per sink.
pub type BufferId = u64;

/// One immutable block of captured mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// A block of digital silence.
    pub fn silent(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

/// Format requested from a microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub block_size: usize,
    pub channels: u16,
}

impl CaptureFormat {
    pub fn mono(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            channels: 1,
        }
    }

    /// Wall-clock duration of one block.
    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

/// Receives every captured block. Runs on the capture thread, so it must not block.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// A microphone capture source.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the device. Denied or missing input fails with
    /// [`VoiceError::PermissionDenied`].
    async fn open(&self, format: CaptureFormat) -> Result<Box<dyn CaptureStream>, VoiceError>;
}

/// An acquired microphone stream.
///
/// `start` must never invoke the callback synchronously; blocks are delivered
/// from the device thread or a spawned task.
pub trait CaptureStream: Send {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), VoiceError>;

    /// Detach the callback and release the device. Safe to call more than once.
    fn stop(&mut self);
}

/// A playback device that can be opened once per session.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    async fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>, VoiceError>;
}

/// An open playback device with a readable clock.
pub trait PlaybackSink: Send {
    /// Current playable time on the device clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `samples` (at the sink's sample rate) to begin at `start_time`.
    fn schedule(&mut self, id: BufferId, samples: Vec<f32>, start_time: f64) -> Result<(), VoiceError>;

    /// Stop a scheduled buffer immediately. Unknown ids are not an error.
    fn stop(&mut self, id: BufferId) -> Result<(), VoiceError>;

    /// Release the device. Pending buffers are dropped without an ended notification.
    fn close(&mut self);
}

/// The pair of devices a session is built on.
#[derive(Clone)]
pub struct AudioDevices {
    pub microphone: Arc<dyn Microphone>,
    pub output: Arc<dyn OutputDevice>,
}

impl AudioDevices {
    /// Build the devices selected by `audio.backend`.
    ///
    /// ## Errors:
    /// Selecting `cpal` in a build without the `cpal` feature is a configuration error.
    pub fn from_config(audio: &AudioConfig) -> anyhow::Result<Self> {
        match audio.backend {
            AudioBackend::Null => Ok(Self {
                microphone: Arc::new(crate::audio::null_backend::SilentMicrophone::new()),
                output: Arc::new(crate::audio::null_backend::HeadlessOutput::new()),
            }),
            #[cfg(feature = "cpal")]
            AudioBackend::Cpal => Ok(Self {
                microphone: Arc::new(crate::audio::cpal_backend::CpalMicrophone::new()),
                output: Arc::new(crate::audio::cpal_backend::CpalOutput::new()),
            }),
            #[cfg(not(feature = "cpal"))]
            AudioBackend::Cpal => Err(anyhow::anyhow!(
                "audio backend 'cpal' requested but this build was compiled without the `cpal` feature"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_duration() {
        let format = CaptureFormat::mono(16000, 4096);
        assert_eq!(format.channels, 1);
        assert!((format.block_duration().as_secs_f64() - 0.256).abs() < 1e-9);
    }

    #[test]
    fn test_null_backend_is_default() {
        let config = crate::config::AppConfig::default();
        assert!(AudioDevices::from_config(&config.audio).is_ok());
    }

    #[cfg(not(feature = "cpal"))]
    #[test]
    fn test_cpal_backend_requires_feature() {
        let mut config = crate::config::AppConfig::default();
        config.audio.backend = AudioBackend::Cpal;
        assert!(AudioDevices::from_config(&config.audio).is_err());
    }
}
