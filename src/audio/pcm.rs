//! # PCM Frames and Transport Encoding
//!
//! Everything that crosses the live link is 16-bit signed little-endian linear
//! PCM. Microphone audio goes out at 16kHz mono, model speech comes back at
//! 24kHz. The wire carries the bytes base64-encoded next to a MIME-like
//! descriptor such as `audio/pcm;rate=16000`.
//!
//! ## Conversions:
//! - **Capture**: `f32` in [-1.0, 1.0] → `round(sample * 32768)` clamped to the `i16` range
//! - **Playback**: `i16` → `sample / 32768.0`, de-interleaved per channel

use crate::live::LiveError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::sync::Arc;

/// Sample rate of captured microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio produced by the remote model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME type prefix used for raw PCM payloads.
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Convert one float sample to 16-bit PCM.
///
/// Values outside [-1.0, 1.0] are clamped rather than wrapped. NaN maps to silence.
pub fn float_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample * 32768.0).round();
    scaled.clamp(-32768.0, 32767.0) as i16
}

/// Convert one 16-bit PCM sample to a float in [-1.0, 1.0).
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Build the descriptor for raw PCM at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

/// Parse `audio/pcm;rate=24000`. Returns `None` for non-PCM types; a PCM type
/// without a rate parameter yields `Some(None)`.
pub fn parse_pcm_mime_type(mime_type: &str) -> Option<Option<u32>> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next()?;
    if !essence.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
        return None;
    }

    let rate = parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse::<u32>().ok());
    Some(rate)
}

/// A fixed buffer of interleaved 16-bit PCM samples. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Wrap already-interleaved samples.
    ///
    /// Fails when the format is degenerate or the sample count does not
    /// divide evenly into the channel count.
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Result<Self, LiveError> {
        if sample_rate == 0 {
            return Err(LiveError::DecodeFailure("Sample rate must be greater than 0".to_string()));
        }
        if channels == 0 {
            return Err(LiveError::DecodeFailure("Channel count must be greater than 0".to_string()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(LiveError::DecodeFailure(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }

        Ok(Self {
            samples: samples.into(),
            sample_rate,
            channels,
        })
    }

    /// Encode float samples (one capture tick) into a mono frame.
    pub fn from_f32_mono(samples: &[f32], sample_rate: u32) -> Result<Self, LiveError> {
        let pcm = samples.iter().map(|&s| float_to_pcm16(s)).collect();
        Self::new(pcm, sample_rate, 1)
    }

    /// Read little-endian 16-bit samples.
    pub fn from_le_bytes(data: &[u8], sample_rate: u32, channels: u16) -> Result<Self, LiveError> {
        if data.is_empty() {
            return Err(LiveError::DecodeFailure("Audio payload is empty".to_string()));
        }
        if data.len() % 2 != 0 {
            return Err(LiveError::DecodeFailure(
                "Audio payload length must be even for 16-bit samples".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        Self::new(samples, sample_rate, channels)
    }

    /// Decode a base64 payload of little-endian 16-bit samples.
    pub fn from_base64(data: &str, sample_rate: u32, channels: u16) -> Result<Self, LiveError> {
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| LiveError::DecodeFailure(format!("Invalid base64 audio: {}", e)))?;
        Self::from_le_bytes(&bytes, sample_rate, channels)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample instants (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &sample in self.samples.iter() {
            // Writing into a Vec cannot fail.
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }

    /// Float samples, one vector per channel.
    pub fn to_planar_f32(&self) -> Vec<Vec<f32>> {
        let channels = self.channels as usize;
        let mut planes = vec![Vec::with_capacity(self.frame_count()); channels];
        for (index, &sample) in self.samples.iter().enumerate() {
            planes[index % channels].push(pcm16_to_float(sample));
        }
        planes
    }
}

/// An AudioFrame serialized for the transport. Has no identity beyond its payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedBlob {
    pub mime_type: String,
    pub data: String,
}

impl EncodedBlob {
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            mime_type: pcm_mime_type(frame.sample_rate()),
            data: STANDARD.encode(frame.to_le_bytes()),
        }
    }

    /// Decode back into a mono frame, taking the rate from the descriptor.
    pub fn decode(&self, default_rate: u32) -> Result<AudioFrame, LiveError> {
        let rate = parse_pcm_mime_type(&self.mime_type)
            .ok_or_else(|| LiveError::DecodeFailure(format!("Unsupported MIME type: {}", self.mime_type)))?
            .unwrap_or(default_rate);
        AudioFrame::from_base64(&self.data, rate, 1)
    }
}

/// Read little-endian f32 samples as sent by the browser capture worklet.
pub fn f32_samples_from_le_bytes(data: &[u8]) -> Result<Vec<f32>, LiveError> {
    if data.len() % 4 != 0 {
        return Err(LiveError::DecodeFailure(
            "Capture payload length must be a multiple of 4 for f32 samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Write f32 samples little-endian and base64 them, for the browser output.
pub fn f32_samples_to_base64(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        let _ = bytes.write_f32::<LittleEndian>(sample);
    }
    STANDARD.encode(bytes)
}
