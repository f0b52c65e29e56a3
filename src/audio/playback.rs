//! # Playback Pipeline
//!
//! Schedules inbound speech for gapless output.
//!
//! ## Scheduling rule:
//! Every decoded chunk starts at `max(cursor, device.current_time())` and the
//! cursor moves to the end of that chunk. Chunks arriving faster than real
//! time therefore play back to back; a chunk arriving after the previous one
//! ended starts "now", leaving an audible gap but no drift.
//!
//! ## Interruption:
//! Barge-in stops every pending buffer, empties the pending set and resets
//! the cursor, so the next chunk starts at the device's current time.

use crate::audio::device::{BufferId, PlaybackSink};
use crate::audio::pcm;
use crate::audio::volume::VolumeMeter;
use crate::error::VoiceError;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Where and when a chunk was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
    pub level: f32,
}

pub struct PlaybackPipeline {
    sink: Box<dyn PlaybackSink>,
    sample_rate: u32,
    meter: VolumeMeter,
    cursor: f64,
    pending: BTreeSet<BufferId>,
    next_id: BufferId,
    chunks_played: u64,
    chunks_dropped: u64,
}

impl PlaybackPipeline {
    pub fn new(sink: Box<dyn PlaybackSink>, sample_rate: u32, meter: VolumeMeter) -> Self {
        Self {
            sink,
            sample_rate: sample_rate.max(1),
            meter,
            cursor: 0.0,
            pending: BTreeSet::new(),
            next_id: 1,
            chunks_played: 0,
            chunks_dropped: 0,
        }
    }

    /// Decode and schedule one inbound chunk.
    ///
    /// Returns `Ok(None)` for an empty chunk. A chunk that fails to decode or
    /// schedule is counted as dropped and the error returned for logging; the
    /// timeline is left untouched.
    pub fn enqueue(&mut self, encoded: &str) -> Result<Option<ScheduledBuffer>, VoiceError> {
        let result = self.schedule_chunk(encoded);
        if result.is_err() {
            self.chunks_dropped += 1;
        }
        result
    }

    fn schedule_chunk(&mut self, encoded: &str) -> Result<Option<ScheduledBuffer>, VoiceError> {
        let bytes = pcm::decode_transport(encoded)?;
        if bytes.is_empty() {
            return Ok(None);
        }

        let level = self.meter.output_level(&bytes);
        let samples = pcm::pcm16_to_float(&bytes)?;
        let duration = samples.len() as f64 / self.sample_rate as f64;

        let start_time = self.cursor.max(self.sink.current_time());
        let id = self.next_id;
        self.next_id += 1;

        self.sink.schedule(id, samples, start_time)?;
        self.cursor = start_time + duration;
        self.pending.insert(id);
        self.chunks_played += 1;

        Ok(Some(ScheduledBuffer {
            id,
            start_time,
            duration,
            level,
        }))
    }

    /// Discard all unplayed audio. Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.pending.len();
        for id in std::mem::take(&mut self.pending) {
            if let Err(e) = self.sink.stop(id) {
                // Best effort; the buffer may have just finished
                warn!(buffer = id, "Failed to stop playback buffer: {}", e);
            }
        }
        self.cursor = 0.0;
        debug!(stopped, "Playback interrupted");
        stopped
    }

    /// Record that a buffer finished playing.
    ///
    /// Returns true when this emptied the pending set, i.e. the output went quiet.
    pub fn finish(&mut self, id: BufferId) -> bool {
        self.pending.remove(&id) && self.pending.is_empty()
    }

    /// Stop everything and release the output device.
    pub fn shutdown(&mut self) {
        self.interrupt();
        self.sink.close();
    }

    pub fn pending_buffers(&self) -> usize {
        self.pending.len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn chunks_played(&self) -> u64 {
        self.chunks_played
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeOutput;

    const RATE: u32 = 24000;

    /// Base64 PCM16 chunk of `seconds` duration at 24 kHz with a constant value.
    fn chunk(seconds: f64, value: i16) -> String {
        let samples = vec![value; (seconds * RATE as f64).round() as usize];
        pcm::encode_transport(&pcm::pcm16_to_bytes(&samples))
    }

    fn pipeline(output: &FakeOutput) -> PlaybackPipeline {
        PlaybackPipeline::new(output.sink(), RATE, VolumeMeter::new(100, 500.0))
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_back_to_back_scheduling() {
        let output = FakeOutput::new();
        output.set_time(5.0);
        let mut playback = pipeline(&output);

        let a = playback.enqueue(&chunk(0.1, 1000)).unwrap().unwrap();
        output.set_time(5.05);
        let b = playback.enqueue(&chunk(0.2, 1000)).unwrap().unwrap();
        output.set_time(5.2);
        let c = playback.enqueue(&chunk(0.1, 1000)).unwrap().unwrap();

        assert!(close(a.start_time, 5.0));
        assert!(close(b.start_time, 5.1));
        assert!(close(c.start_time, 5.3));
        assert!(close(playback.cursor(), 5.4));
        assert_eq!(playback.pending_buffers(), 3);
    }

    #[test]
    fn test_start_times_never_overlap() {
        let output = FakeOutput::new();
        let mut playback = pipeline(&output);
        let mut previous: Option<ScheduledBuffer> = None;

        for (i, seconds) in [0.05, 0.3, 0.01, 0.2, 0.12].iter().enumerate() {
            // The clock advances irregularly, sometimes past the cursor
            output.set_time(i as f64 * 0.15);
            let scheduled = playback.enqueue(&chunk(*seconds, 10)).unwrap().unwrap();
            if let Some(prev) = previous {
                assert!(scheduled.start_time >= prev.start_time + prev.duration - 1e-9);
            }
            previous = Some(scheduled);
        }
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let output = FakeOutput::new();
        let mut playback = pipeline(&output);
        playback.enqueue(&chunk(0.1, 1)).unwrap();

        output.set_time(2.0);
        let late = playback.enqueue(&chunk(0.1, 1)).unwrap().unwrap();
        assert!(close(late.start_time, 2.0));
    }

    #[test]
    fn test_interrupt_clears_pending_and_resets_cursor() {
        let output = FakeOutput::new();
        output.set_time(1.0);
        let mut playback = pipeline(&output);

        let a = playback.enqueue(&chunk(0.5, 1)).unwrap().unwrap();
        let b = playback.enqueue(&chunk(0.5, 1)).unwrap().unwrap();

        output.set_time(1.2);
        assert_eq!(playback.interrupt(), 2);
        assert_eq!(playback.pending_buffers(), 0);
        assert_eq!(playback.cursor(), 0.0);
        assert_eq!(output.stopped(), vec![a.id, b.id]);

        let next = playback.enqueue(&chunk(0.1, 1)).unwrap().unwrap();
        assert!(close(next.start_time, 1.2));
    }

    #[test]
    fn test_stop_failures_are_swallowed() {
        let output = FakeOutput::new();
        output.fail_stops(true);
        let mut playback = pipeline(&output);
        playback.enqueue(&chunk(0.1, 1)).unwrap();

        assert_eq!(playback.interrupt(), 1);
        assert_eq!(playback.pending_buffers(), 0);
    }

    #[test]
    fn test_malformed_chunk_is_dropped() {
        let output = FakeOutput::new();
        let mut playback = pipeline(&output);
        let good = playback.enqueue(&chunk(0.1, 1)).unwrap().unwrap();

        assert!(matches!(playback.enqueue("%%%"), Err(VoiceError::Transcode(_))));
        // Three bytes is not a whole number of samples
        assert!(matches!(playback.enqueue("AAAA"), Err(VoiceError::Transcode(_))));
        assert_eq!(playback.chunks_dropped(), 2);

        // The timeline continues where the good chunk ended
        let next = playback.enqueue(&chunk(0.1, 1)).unwrap().unwrap();
        assert!(close(next.start_time, good.start_time + good.duration));
    }

    #[test]
    fn test_empty_chunk_is_skipped() {
        let output = FakeOutput::new();
        let mut playback = pipeline(&output);
        assert_eq!(playback.enqueue("").unwrap(), None);
        assert_eq!(playback.pending_buffers(), 0);
    }

    #[test]
    fn test_finish_reports_when_output_goes_quiet() {
        let output = FakeOutput::new();
        let mut playback = pipeline(&output);
        let a = playback.enqueue(&chunk(0.1, 1)).unwrap().unwrap();
        let b = playback.enqueue(&chunk(0.1, 1)).unwrap().unwrap();

        assert!(!playback.finish(a.id));
        assert!(!playback.finish(a.id));
        assert!(playback.finish(b.id));
    }

    #[test]
    fn test_output_level_follows_loudness() {
        let output = FakeOutput::new();
        let mut playback = pipeline(&output);
        let quiet = playback.enqueue(&chunk(0.05, 100)).unwrap().unwrap();
        let loud = playback.enqueue(&chunk(0.05, 5000)).unwrap().unwrap();
        assert!(loud.level > quiet.level);
    }
}
