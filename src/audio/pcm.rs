//! # PCM Transcoding
//!
//! Pure conversions between the sample formats used by the voice session:
//! - **f32 samples** in [-1, 1], as produced and consumed by sound devices
//! - **PCM16**: signed 16-bit little-endian integers, the wire format of the live endpoint
//! - **Transport text**: standard base64 of the PCM16 bytes, embedded in JSON frames
//!
//! Nothing here keeps state, so every function is safe to call from an audio callback.

use crate::error::VoiceError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};

/// Scale applied to negative samples (full i16 range below zero).
const NEGATIVE_SCALE: f32 = 32768.0;

/// Scale applied to positive samples (i16::MAX).
const POSITIVE_SCALE: f32 = 32767.0;

/// Convert float samples to 16-bit PCM.
///
/// Each sample is clamped to [-1, 1], scaled by 32768 when negative and by
/// 32767 otherwise, then truncated toward zero. NaN becomes silence.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * NEGATIVE_SCALE) as i16
            } else {
                (s * POSITIVE_SCALE) as i16
            }
        })
        .collect()
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Parse little-endian bytes into PCM16 samples.
///
/// ## Errors:
/// A buffer with an odd number of bytes cannot hold whole samples and is
/// rejected as a [`VoiceError::Transcode`].
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, VoiceError> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Transcode(format!(
            "PCM16 buffer has odd length {}",
            bytes.len()
        )));
    }

    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);
    Ok(samples)
}

/// Convert a buffer of `2×N` little-endian PCM16 bytes into `N` float samples.
///
/// Every sample is divided by 32768, so the result lies in [-1, 1).
pub fn pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>, VoiceError> {
    Ok(bytes_to_pcm16(bytes)?
        .into_iter()
        .map(|s| s as f32 / NEGATIVE_SCALE)
        .collect())
}

/// Float samples straight to PCM16 bytes, the shape the capture side sends.
pub fn float_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    pcm16_to_bytes(&float_to_pcm16(samples))
}

/// Encode binary audio for a JSON text payload (standard base64, padded).
pub fn encode_transport(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a transport payload back into bytes.
pub fn decode_transport(text: &str) -> Result<Vec<u8>, VoiceError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| VoiceError::Transcode(format!("invalid base64 payload: {}", e)))
}
