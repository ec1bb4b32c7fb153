//! # Capture Pipeline
//!
//! Turns microphone ticks into outbound protocol messages. One tick in, one
//! message out: no batching, no dropping, no backpressure. A tick that arrives
//! while there is nowhere to send it is a silent no-op.

use crate::audio::pcm::{AudioFrame, EncodedBlob, INPUT_SAMPLE_RATE};
use crate::live::LiveError;
use tracing::{debug, warn};

/// Samples in one processing tick at 16kHz mono.
pub const DEFAULT_CHUNK_SAMPLES: usize = 4096;

/// Destination for encoded capture blobs (the remote session).
pub trait BlobSink {
    fn send_audio(&mut self, blob: EncodedBlob) -> Result<(), LiveError>;
}

/// Capture format settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,

    /// Nominal tick size. Ticks of other sizes are still forwarded.
    pub chunk_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            chunk_samples: DEFAULT_CHUNK_SAMPLES,
        }
    }
}

pub struct CapturePipeline {
    config: CaptureConfig,
    ticks_sent: u64,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            ticks_sent: 0,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Number of ticks that produced an outbound message.
    pub fn ticks_sent(&self) -> u64 {
        self.ticks_sent
    }

    /// Encode one tick of float samples.
    pub fn encode_tick(&self, samples: &[f32]) -> Result<EncodedBlob, LiveError> {
        let frame = AudioFrame::from_f32_mono(samples, self.config.sample_rate)?;
        Ok(EncodedBlob::from_frame(&frame))
    }

    /// Process one tick. Returns whether a message was dispatched.
    ///
    /// Never fails: with no sink the tick is dropped, and send errors are
    /// logged because the remote reports transport problems on its own.
    pub fn process_tick(&mut self, samples: &[f32], sink: Option<&mut dyn BlobSink>) -> bool {
        let Some(sink) = sink else {
            return false;
        };

        if samples.len() != self.config.chunk_samples {
            debug!(
                expected = self.config.chunk_samples,
                actual = samples.len(),
                "Capture tick size differs from configured chunk"
            );
        }

        let blob = match self.encode_tick(samples) {
            Ok(blob) => blob,
            Err(err) => {
                warn!("Dropping capture tick: {}", err);
                return false;
            }
        };

        match sink.send_audio(blob) {
            Ok(()) => {
                self.ticks_sent += 1;
                true
            }
            Err(err) => {
                warn!("Failed to send capture tick: {}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        blobs: Vec<EncodedBlob>,
    }

    impl BlobSink for RecordingSink {
        fn send_audio(&mut self, blob: EncodedBlob) -> Result<(), LiveError> {
            self.blobs.push(blob);
            Ok(())
        }
    }

    #[test]
    fn test_tick_is_noop_without_sink() {
        let mut pipeline = CapturePipeline::new(CaptureConfig::default());
        assert!(!pipeline.process_tick(&[0.1; 4096], None));
        assert_eq!(pipeline.ticks_sent(), 0);
    }

    #[test]
    fn test_tick_sends_one_labelled_blob() {
        let mut pipeline = CapturePipeline::new(CaptureConfig::default());
        let mut sink = RecordingSink::default();

        assert!(pipeline.process_tick(&[0.5, -0.5, 2.0], Some(&mut sink)));
        assert_eq!(sink.blobs.len(), 1);
        assert_eq!(sink.blobs[0].mime_type, "audio/pcm;rate=16000");

        let frame = sink.blobs[0].decode(INPUT_SAMPLE_RATE).unwrap();
        assert_eq!(frame.samples(), &[16384, -16384, 32767]);
    }

    proptest! {
        #[test]
        fn prop_one_message_per_active_tick(active in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut pipeline = CapturePipeline::new(CaptureConfig::default());
            let mut sink = RecordingSink::default();

            for &is_active in &active {
                let target: Option<&mut dyn BlobSink> = if is_active { Some(&mut sink) } else { None };
                pipeline.process_tick(&[0.0; 64], target);
            }

            let expected = active.iter().filter(|a| **a).count();
            prop_assert_eq!(sink.blobs.len(), expected);
            prop_assert_eq!(pipeline.ticks_sent() as usize, expected);
        }
    }
}
