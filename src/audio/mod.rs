//! # Audio Module
//!
//! The voice core: everything between the microphone, the speaker and the
//! live transport.
//!
//! ## Key Components:
//! - **PCM Transcoder**: float ↔ PCM16 ↔ base64 conversions
//! - **Capture Pipeline**: microphone blocks → outbound chunks
//! - **Playback Pipeline**: inbound chunks → gapless scheduled output
//! - **Session**: the connection state machine that owns both pipelines
//! - **Volume Notifier**: one observable loudness value plus lifecycle events
//!
//! ## Audio Formats:
//! - **Outbound**: 16 kHz, 16-bit little-endian PCM, mono (`audio/pcm;rate=16000`)
//! - **Inbound**: 24 kHz, 16-bit little-endian PCM, mono
//!
//! Devices sit behind the traits in [`device`]; the `null` backend needs no
//! sound hardware and the `cpal` backend (cargo feature) uses the system devices.

pub mod capture;      // Microphone frames to outbound chunks
pub mod device;       // Device traits and backend selection
pub mod mixer;        // Software playback clock shared by output backends
pub mod null_backend; // Silent microphone and headless output
pub mod pcm;          // Sample format conversions
pub mod playback;     // Gapless scheduling and barge-in
pub mod session;      // Connection state machine
pub mod volume;       // Loudness metering and observers

#[cfg(feature = "cpal")]
pub mod cpal_backend; // System audio devices

#[cfg(test)]
pub mod testing;      // Scripted devices and transport
