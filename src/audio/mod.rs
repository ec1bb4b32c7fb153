//! # Audio Module
//!
//! Sample-level plumbing for live conversations.
//!
//! ## Components:
//! - **pcm**: 16-bit PCM frames, MIME descriptors and base64 blobs
//! - **capture**: microphone ticks to outbound blobs, one message per tick
//! - **playback**: gapless scheduling of inbound frames with barge-in support
//!
//! ## Formats:
//! - **Capture**: 16kHz mono, `audio/pcm;rate=16000`
//! - **Playback**: 24kHz, channel count taken from configuration
//! - **Encoding**: little-endian signed 16-bit integers

pub mod capture;
pub mod pcm;
pub mod playback;
