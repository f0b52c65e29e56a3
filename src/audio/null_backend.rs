//! # Null Audio Backend
//!
//! Devices for machines without sound hardware (CI, containers, servers).
//! The microphone produces zero-filled blocks at the real capture rate and
//! the output renders the mixer in real time into nothing, so the full
//! session, including playback timing and volume events, still runs.

use crate::audio::device::{
    AudioFrame, BufferId, CaptureFormat, CaptureStream, FrameCallback, Microphone, OutputDevice,
    PlaybackSink,
};
use crate::audio::mixer::ScheduledMixer;
use crate::error::VoiceError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// How often the headless output pulls audio from the mixer.
const RENDER_TICK: Duration = Duration::from_millis(20);

/// A microphone that always grants access and captures silence.
#[derive(Debug, Default)]
pub struct SilentMicrophone;

impl SilentMicrophone {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Microphone for SilentMicrophone {
    async fn open(&self, format: CaptureFormat) -> Result<Box<dyn CaptureStream>, VoiceError> {
        debug!(sample_rate = format.sample_rate, block_size = format.block_size, "Opening silent microphone");
        Ok(Box::new(SilentStream { format, task: None }))
    }
}

struct SilentStream {
    format: CaptureFormat,
    task: Option<JoinHandle<()>>,
}

impl CaptureStream for SilentStream {
    fn start(&mut self, mut on_frame: FrameCallback) -> Result<(), VoiceError> {
        self.stop();

        let block_size = self.format.block_size;
        let period = self.format.block_duration();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; a real device delivers after one block
            ticker.tick().await;
            loop {
                ticker.tick().await;
                on_frame(AudioFrame::silent(block_size));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SilentStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An output device that plays into nothing at real-time speed.
#[derive(Debug, Default)]
pub struct HeadlessOutput;

impl HeadlessOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutputDevice for HeadlessOutput {
    async fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn PlaybackSink>, VoiceError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Device(format!("headless output needs a tokio runtime: {}", e)))?;

        let mixer = ScheduledMixer::new(sample_rate, ended);
        let render_mixer = mixer.clone();
        let task = handle.spawn(async move {
            let started = Instant::now();
            let mut rendered: u64 = 0;
            let mut scratch = Vec::new();
            let mut ticker = tokio::time::interval(RENDER_TICK);
            loop {
                ticker.tick().await;
                // Catch up to wall-clock time so the device clock never drifts
                let due = (started.elapsed().as_secs_f64() * sample_rate as f64) as u64;
                if due > rendered {
                    scratch.resize((due - rendered) as usize, 0.0);
                    render_mixer.render(&mut scratch);
                    rendered = due;
                }
            }
        });

        Ok(Box::new(HeadlessSink {
            mixer,
            task: Some(task),
        }))
    }
}

struct HeadlessSink {
    mixer: ScheduledMixer,
    task: Option<JoinHandle<()>>,
}

impl PlaybackSink for HeadlessSink {
    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn schedule(&mut self, id: BufferId, samples: Vec<f32>, start_time: f64) -> Result<(), VoiceError> {
        if self.task.is_none() {
            return Err(VoiceError::Device("headless output is closed".to_string()));
        }
        self.mixer.schedule(id, samples, start_time);
        Ok(())
    }

    fn stop(&mut self, id: BufferId) -> Result<(), VoiceError> {
        self.mixer.stop(id);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.mixer.clear();
    }
}

impl Drop for HeadlessSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_silent_microphone_delivers_blocks_until_stopped() {
        let mic = SilentMicrophone::new();
        let mut stream = mic.open(CaptureFormat::mono(16000, 160)).await.unwrap();

        let frames = Arc::new(AtomicUsize::new(0));
        let counter = frames.clone();
        stream
            .start(Box::new(move |frame| {
                assert!(frame.samples().iter().all(|s| *s == 0.0));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        stream.stop();
        let seen = frames.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected at least one 10ms block, got {}", seen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(frames.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_headless_output_reports_ended_buffers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = HeadlessOutput::new().open(24000, tx).await.unwrap();

        sink.schedule(9, vec![0.1; 240], 0.0).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(id, Some(9));
        assert!(sink.current_time() >= 0.01);

        sink.close();
        assert!(sink.schedule(10, vec![0.1; 10], 0.0).is_err());
    }
}
