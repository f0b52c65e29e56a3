//! # Capture Pipeline
//!
//! Turns microphone blocks into outbound chunks:
//! block → volume level → PCM16 → base64 → bounded outbound queue.
//!
//! Runs inside the audio callback, so nothing here may wait. The queue is
//! drained by the session's sender task; when it is full the frame is dropped
//! and counted, and capture carries on.

use crate::audio::device::AudioFrame;
use crate::audio::pcm;
use crate::audio::volume::VolumeMeter;
use crate::live::protocol::OutboundChunk;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub struct CapturePipeline {
    outbound: mpsc::Sender<OutboundChunk>,
    meter: VolumeMeter,
    frames_sent: u64,
    frames_dropped: u64,
}

impl CapturePipeline {
    pub fn new(outbound: mpsc::Sender<OutboundChunk>, meter: VolumeMeter) -> Self {
        Self {
            outbound,
            meter,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// Encode one block and queue it for sending. Returns the input level.
    pub fn process(&mut self, frame: &AudioFrame) -> f32 {
        let level = self.meter.input_level(frame.samples());
        let data = pcm::encode_transport(&pcm::float_to_pcm16_bytes(frame.samples()));

        match self.outbound.try_send(OutboundChunk::pcm(data)) {
            Ok(()) => self.frames_sent += 1,
            Err(TrySendError::Full(_)) => {
                self.frames_dropped += 1;
                warn!(dropped = self.frames_dropped, "Outbound queue full, dropping microphone frame");
            }
            Err(TrySendError::Closed(_)) => {
                self.frames_dropped += 1;
                debug!("Outbound queue closed, dropping microphone frame");
            }
        }

        level
    }

    /// Frames handed to the sender task.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(capacity: usize) -> (CapturePipeline, mpsc::Receiver<OutboundChunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        (CapturePipeline::new(tx, VolumeMeter::new(50, 500.0)), rx)
    }

    #[test]
    fn test_silent_block_is_sent_with_zero_level() {
        let (mut capture, mut rx) = pipeline(4);
        let level = capture.process(&AudioFrame::silent(4096));
        assert_eq!(level, 0.0);

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        let bytes = pcm::decode_transport(&chunk.data).unwrap();
        assert_eq!(bytes.len(), 8192);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_one_chunk_per_frame_in_order() {
        let (mut capture, mut rx) = pipeline(8);
        for value in [0.1f32, 0.2, 0.3] {
            capture.process(&AudioFrame::new(vec![value; 16]));
        }

        let mut firsts = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            let samples = pcm::pcm16_to_float(&pcm::decode_transport(&chunk.data).unwrap()).unwrap();
            firsts.push(samples[0]);
        }
        assert_eq!(firsts.len(), 3);
        assert!(firsts[0] < firsts[1] && firsts[1] < firsts[2]);
        assert_eq!(capture.frames_sent(), 3);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (mut capture, _rx) = pipeline(1);
        capture.process(&AudioFrame::silent(8));
        capture.process(&AudioFrame::silent(8));
        capture.process(&AudioFrame::silent(8));

        assert_eq!(capture.frames_sent(), 1);
        assert_eq!(capture.frames_dropped(), 2);
    }

    #[test]
    fn test_closed_queue_is_not_fatal() {
        let (mut capture, rx) = pipeline(1);
        drop(rx);
        let level = capture.process(&AudioFrame::new(vec![0.5; 100]));
        assert!(level > 0.0);
        assert_eq!(capture.frames_dropped(), 1);
    }
}
