//! # Scheduled Mixer
//!
//! A software playback clock shared by the headless and cpal output devices.
//! Buffers are placed on a frame timeline and summed when the device pulls
//! audio, so the clock (`frames rendered / sample rate`) advances only as fast
//! as the device consumes samples, exactly like a hardware output context.
//!
//! ## Thread Safety:
//! The device callback (`render`) and the session (`schedule`, `stop`) touch
//! the same state, guarded by a `parking_lot::Mutex`. Ended notifications are
//! sent after the lock is released.

use crate::audio::device::BufferId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct MixerState {
    sample_rate: u32,
    rendered: u64,
    voices: Vec<Voice>,
}

/// Frame-accurate mixer of scheduled mono buffers.
#[derive(Clone)]
pub struct ScheduledMixer {
    state: Arc<Mutex<MixerState>>,
    ended: mpsc::UnboundedSender<BufferId>,
}

impl ScheduledMixer {
    pub fn new(sample_rate: u32, ended: mpsc::UnboundedSender<BufferId>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                sample_rate: sample_rate.max(1),
                rendered: 0,
                voices: Vec::new(),
            })),
            ended,
        }
    }

    /// Seconds of audio rendered so far.
    pub fn current_time(&self) -> f64 {
        let state = self.state.lock();
        state.rendered as f64 / state.sample_rate as f64
    }

    /// Place a buffer at `start_time` seconds.
    ///
    /// Times that already passed are moved to the next frame to be rendered;
    /// the part of the timeline that was already played cannot be rewritten.
    pub fn schedule(&self, id: BufferId, samples: Vec<f32>, start_time: f64) {
        let mut state = self.state.lock();
        let requested = (start_time.max(0.0) * state.sample_rate as f64).round() as u64;
        let start_frame = requested.max(state.rendered);
        state.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    /// Remove a buffer before it finishes. Returns whether it was still active.
    pub fn stop(&self, id: BufferId) -> bool {
        let mut state = self.state.lock();
        let before = state.voices.len();
        state.voices.retain(|voice| voice.id != id);
        state.voices.len() != before
    }

    /// Drop every scheduled buffer without notifying.
    pub fn clear(&self) {
        self.state.lock().voices.clear();
    }

    pub fn active_voices(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Fill `out` with the next `out.len()` frames and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut finished = Vec::new();

        {
            let mut state = self.state.lock();
            let block_start = state.rendered;
            let block_end = block_start + out.len() as u64;

            for voice in &state.voices {
                let from = voice.start_frame.max(block_start);
                let to = voice.end_frame().min(block_end);
                for frame in from..to {
                    out[(frame - block_start) as usize] +=
                        voice.samples[(frame - voice.start_frame) as usize];
                }
            }

            state.rendered = block_end;
            state.voices.retain(|voice| {
                if voice.end_frame() <= block_end {
                    finished.push(voice.id);
                    false
                } else {
                    true
                }
            });
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        for id in finished {
            // The session may already be gone
            let _ = self.ended.send(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer(rate: u32) -> (ScheduledMixer, mpsc::UnboundedReceiver<BufferId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ScheduledMixer::new(rate, tx), rx)
    }

    #[test]
    fn test_buffers_play_back_to_back() {
        let (mixer, mut ended) = mixer(10);
        mixer.schedule(1, vec![0.1; 5], 0.0);
        mixer.schedule(2, vec![0.2; 5], 0.5);

        let mut out = vec![0.0; 10];
        mixer.render(&mut out);

        assert_eq!(&out[..5], &[0.1; 5]);
        assert_eq!(&out[5..], &[0.2; 5]);
        assert_eq!(ended.try_recv().unwrap(), 1);
        assert_eq!(ended.try_recv().unwrap(), 2);
        assert!((mixer.current_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_late_schedule_starts_at_render_position() {
        let (mixer, _ended) = mixer(10);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out);

        // 0.2s is already in the past, so the buffer starts at frame 10
        mixer.schedule(7, vec![0.5; 2], 0.2);
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_overlap_is_summed_and_clamped() {
        let (mixer, _ended) = mixer(10);
        mixer.schedule(1, vec![0.75; 4], 0.0);
        mixer.schedule(2, vec![0.75; 4], 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![1.0; 4]);
    }

    #[test]
    fn test_stopped_buffer_is_silent_and_not_reported() {
        let (mixer, mut ended) = mixer(10);
        mixer.schedule(3, vec![0.3; 8], 0.0);

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert!(mixer.stop(3));
        assert!(!mixer.stop(3));

        mixer.render(&mut out);
        assert_eq!(out, vec![0.0; 4]);
        assert!(ended.try_recv().is_err());
        assert_eq!(mixer.active_voices(), 0);
    }
}
