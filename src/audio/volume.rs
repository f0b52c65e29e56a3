//! # Volume Metering and Notification
//!
//! Both pipelines report a loudness figure in [0, 100] for every block they
//! process. The [`VolumeNotifier`] merges them into a single observable value
//! for the UI, and also carries the session lifecycle events (state changes
//! and the once-per-teardown close signal).
//!
//! ## Channels:
//! - **tokio::sync::watch** for the volume: observers only care about the latest value
//! - **tokio::sync::broadcast** for lifecycle events: every observer sees every event

use crate::audio::session::SessionState;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Highest value the volume observable can take.
pub const MAX_VOLUME: f32 = 100.0;

const EVENT_CAPACITY: usize = 64;

/// Deterministic loudness estimator.
///
/// Looks at every `stride`-th sample only, so the cost per block stays tiny
/// even inside a real-time audio callback. The result grows monotonically
/// with signal amplitude and is capped at [`MAX_VOLUME`].
#[derive(Debug, Clone, Copy)]
pub struct VolumeMeter {
    stride: usize,
    scale: f32,
}

impl VolumeMeter {
    pub fn new(stride: usize, scale: f32) -> Self {
        Self {
            stride: stride.max(1),
            scale,
        }
    }

    /// Level of a captured float block.
    ///
    /// `sum(|x|)` over the subsampled positions, divided by the number of
    /// positions visited, times `scale`.
    pub fn input_level(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let (sum, count) = samples
            .iter()
            .step_by(self.stride)
            .fold((0.0f32, 0usize), |(sum, count), s| (sum + s.abs(), count + 1));

        self.finish(sum, count)
    }

    /// Level of an inbound PCM16 byte buffer, read before float conversion.
    ///
    /// Samples are decoded in place at the stride; a trailing odd byte is ignored.
    pub fn output_level(&self, pcm_bytes: &[u8]) -> f32 {
        let (sum, count) = pcm_bytes
            .chunks_exact(2)
            .step_by(self.stride)
            .fold((0.0f32, 0usize), |(sum, count), pair| {
                let sample = LittleEndian::read_i16(pair) as f32 / 32768.0;
                (sum + sample.abs(), count + 1)
            });

        self.finish(sum, count)
    }

    fn finish(&self, sum: f32, count: usize) -> f32 {
        if count == 0 {
            return 0.0;
        }
        (sum / count as f32 * self.scale).clamp(0.0, MAX_VOLUME)
    }
}

/// Lifecycle notifications for UI observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged { state: SessionState },
    /// A session was torn down (fired once per teardown)
    Closed,
}

/// Shared fan-out point for volume and lifecycle events.
///
/// ## Rust Concepts:
/// - **Clone**: Cheap handle; all clones publish to the same channels
/// - **Arc<watch::Sender>**: `watch::Sender` is not `Clone`, so it is shared
#[derive(Clone)]
pub struct VolumeNotifier {
    volume: Arc<watch::Sender<f32>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for VolumeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeNotifier {
    pub fn new() -> Self {
        let (volume, _) = watch::channel(0.0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            volume: Arc::new(volume),
            events,
        }
    }

    /// Publish a new volume value, clamped to [0, 100].
    pub fn publish(&self, level: f32) {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, MAX_VOLUME) };
        self.volume.send_replace(level);
    }

    /// Reset the observable volume to silence.
    pub fn reset(&self) {
        self.publish(0.0);
    }

    pub fn current(&self) -> f32 {
        *self.volume.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.volume.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state_changed(&self, state: SessionState) {
        // No receivers is fine
        let _ = self.events.send(SessionEvent::StateChanged { state });
    }

    /// Signal that a session was torn down.
    pub fn closed(&self) {
        let _ = self.events.send(SessionEvent::Closed);
    }
}
