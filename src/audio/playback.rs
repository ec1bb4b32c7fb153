//! # Playback Scheduler
//!
//! Keeps frames from the remote model playing back to back, in arrival order,
//! with no overlap. The scheduling cursor (`next_start_time`) only moves
//! forward, except that an interruption or teardown resets it to zero.
//!
//! ## Scheduling Rule:
//! 1. `next_start_time = max(next_start_time, now)` so a late frame starts now
//!    instead of inheriting a stale backlog
//! 2. The buffer starts exactly at `next_start_time`
//! 3. `next_start_time += duration`
//!
//! Every live buffer leaves the live set exactly once: either through
//! `on_buffer_ended` (natural completion) or through a forced stop.

use crate::audio::pcm::AudioFrame;
use crate::live::LiveError;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub type BufferId = Uuid;

/// Time source of the output device, in seconds.
pub trait AudioClock {
    fn current_time(&self) -> f64;
}

/// Clock that starts at zero when the output context opens.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl AudioClock for MonotonicClock {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A decoded frame with its scheduled start time, handed to the output device.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
    pub sample_rate: u32,
    /// De-interleaved samples, one vector per channel.
    pub channels: Vec<Vec<f32>>,
}

/// The device that actually makes sound.
pub trait AudioOutput {
    /// Begin playing `buffer` at `buffer.start_time` on the output clock.
    fn start(&mut self, buffer: &PlaybackBuffer) -> Result<(), LiveError>;

    /// Stop a buffer mid-playback. May fail for buffers that already finished.
    fn stop(&mut self, id: BufferId) -> Result<(), LiveError>;
}

/// Where a frame landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
}

#[derive(Debug)]
struct LiveBuffer {
    sequence: u64,
    start_time: f64,
    duration: f64,
}

pub struct PlaybackScheduler<O, C> {
    output: O,
    clock: C,
    next_start_time: f64,
    live_buffers: HashMap<BufferId, LiveBuffer>,
    sequence: u64,
}

impl<O: AudioOutput, C: AudioClock> PlaybackScheduler<O, C> {
    pub fn new(output: O, clock: C) -> Self {
        Self {
            output,
            clock,
            next_start_time: 0.0,
            live_buffers: HashMap::new(),
            sequence: 0,
        }
    }

    /// Schedule a frame right after everything already queued.
    pub fn schedule(&mut self, frame: &AudioFrame) -> Result<ScheduledBuffer, LiveError> {
        let now = self.clock.current_time();
        self.next_start_time = self.next_start_time.max(now);

        let buffer = PlaybackBuffer {
            id: Uuid::new_v4(),
            start_time: self.next_start_time,
            duration: frame.duration(),
            sample_rate: frame.sample_rate(),
            channels: frame.to_planar_f32(),
        };

        self.output.start(&buffer)?;

        self.next_start_time += buffer.duration;
        self.sequence += 1;
        self.live_buffers.insert(
            buffer.id,
            LiveBuffer {
                sequence: self.sequence,
                start_time: buffer.start_time,
                duration: buffer.duration,
            },
        );

        debug!(
            buffer_id = %buffer.id,
            start_time = buffer.start_time,
            duration = buffer.duration,
            live = self.live_buffers.len(),
            "Scheduled playback buffer"
        );

        Ok(ScheduledBuffer {
            id: buffer.id,
            start_time: buffer.start_time,
            duration: buffer.duration,
        })
    }

    /// Completion callback. Returns false if the buffer was already removed
    /// (for example by an interruption that raced with natural completion).
    pub fn on_buffer_ended(&mut self, id: BufferId) -> bool {
        self.live_buffers.remove(&id).is_some()
    }

    /// Flush everything: the remote started a new utterance.
    ///
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        debug!(stopped, "Playback interrupted");
        stopped
    }

    /// Forced stop of every live buffer. Stop errors are swallowed since the
    /// buffer may have finished on its own a moment earlier.
    pub fn stop_all(&mut self) -> usize {
        let mut buffers: Vec<(BufferId, u64)> = self
            .live_buffers
            .drain()
            .map(|(id, live)| (id, live.sequence))
            .collect();
        buffers.sort_by_key(|(_, sequence)| *sequence);

        for (id, _) in &buffers {
            if let Err(err) = self.output.stop(*id) {
                warn!(buffer_id = %id, "Ignoring stop failure: {}", err);
            }
        }

        self.next_start_time = 0.0;
        buffers.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_count(&self) -> usize {
        self.live_buffers.len()
    }

    pub fn is_live(&self, id: &BufferId) -> bool {
        self.live_buffers.contains_key(id)
    }

    /// End of the last queued buffer, if anything is queued.
    pub fn queued_until(&self) -> Option<f64> {
        self.live_buffers
            .values()
            .map(|live| live.start_time + live.duration)
            .fold(None, |acc: Option<f64>, end| Some(acc.map_or(end, |a| a.max(end))))
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Clock the test moves by hand.
    #[derive(Debug, Clone, Default)]
    pub struct ManualClock {
        now: Arc<Mutex<f64>>,
    }

    impl ManualClock {
        pub fn set(&self, time: f64) {
            *self.now.lock().unwrap() = time;
        }
    }

    impl AudioClock for ManualClock {
        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    #[derive(Debug, Default)]
    pub struct OutputLog {
        pub started: Vec<(BufferId, f64)>,
        pub stopped: Vec<BufferId>,
    }

    /// Output that records calls; shares its log with the test.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingOutput {
        pub log: Arc<Mutex<OutputLog>>,
        pub fail_stops: bool,
    }

    impl AudioOutput for RecordingOutput {
        fn start(&mut self, buffer: &PlaybackBuffer) -> Result<(), LiveError> {
            self.log.lock().unwrap().started.push((buffer.id, buffer.start_time));
            Ok(())
        }

        fn stop(&mut self, id: BufferId) -> Result<(), LiveError> {
            self.log.lock().unwrap().stopped.push(id);
            if self.fail_stops {
                return Err(LiveError::TransportFailure("already finished".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ManualClock, RecordingOutput};
    use super::*;
    use crate::audio::pcm::OUTPUT_SAMPLE_RATE;
    use proptest::prelude::*;

    fn frame_of(seconds: f64) -> AudioFrame {
        let samples = (seconds * OUTPUT_SAMPLE_RATE as f64).round() as usize;
        AudioFrame::new(vec![0; samples], OUTPUT_SAMPLE_RATE, 1).unwrap()
    }

    fn scheduler() -> (PlaybackScheduler<RecordingOutput, ManualClock>, ManualClock, RecordingOutput) {
        let clock = ManualClock::default();
        let output = RecordingOutput::default();
        (PlaybackScheduler::new(output.clone(), clock.clone()), clock, output)
    }

    #[test]
    fn test_three_half_second_frames_play_back_to_back() {
        let (mut scheduler, _clock, _output) = scheduler();

        let starts: Vec<f64> = (0..3)
            .map(|_| scheduler.schedule(&frame_of(0.5)).unwrap().start_time)
            .collect();

        assert_eq!(starts, vec![0.0, 0.5, 1.0]);
        assert_eq!(scheduler.live_count(), 3);
        assert!((scheduler.next_start_time() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_gap_clamps_to_current_clock() {
        let (mut scheduler, clock, _output) = scheduler();
        scheduler.schedule(&frame_of(0.5)).unwrap();

        clock.set(4.25);
        let late = scheduler.schedule(&frame_of(0.5)).unwrap();
        assert_eq!(late.start_time, 4.25);
        assert!((scheduler.next_start_time() - 4.75).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_cursor() {
        let (mut scheduler, _clock, output) = scheduler();
        scheduler.schedule(&frame_of(0.5)).unwrap();
        scheduler.schedule(&frame_of(0.5)).unwrap();

        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(output.log.lock().unwrap().stopped.len(), 2);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);

        let third = scheduler.schedule(&frame_of(0.5)).unwrap();
        assert_eq!(third.start_time, 0.0);
    }

    #[test]
    fn test_stops_issued_in_schedule_order() {
        let (mut scheduler, _clock, output) = scheduler();
        let ids: Vec<BufferId> = (0..4).map(|_| scheduler.schedule(&frame_of(0.1)).unwrap().id).collect();

        scheduler.interrupt();
        assert_eq!(output.log.lock().unwrap().stopped, ids);
    }

    #[test]
    fn test_buffer_removed_exactly_once() {
        let (mut scheduler, _clock, output) = scheduler();
        let first = scheduler.schedule(&frame_of(0.5)).unwrap();
        let second = scheduler.schedule(&frame_of(0.5)).unwrap();

        assert!(scheduler.on_buffer_ended(first.id));
        assert!(!scheduler.on_buffer_ended(first.id));

        assert_eq!(scheduler.interrupt(), 1);
        assert_eq!(output.log.lock().unwrap().stopped, vec![second.id]);

        // Natural completion arriving after the forced stop is ignored.
        assert!(!scheduler.on_buffer_ended(second.id));
    }

    #[test]
    fn test_stop_failures_are_swallowed() {
        let clock = ManualClock::default();
        let output = RecordingOutput {
            fail_stops: true,
            ..RecordingOutput::default()
        };
        let mut scheduler = PlaybackScheduler::new(output, clock);
        scheduler.schedule(&frame_of(0.2)).unwrap();

        assert_eq!(scheduler.stop_all(), 1);
        assert_eq!(scheduler.live_count(), 0);
    }

    #[test]
    fn test_queued_until() {
        let (mut scheduler, _clock, _output) = scheduler();
        assert_eq!(scheduler.queued_until(), None);
        scheduler.schedule(&frame_of(0.5)).unwrap();
        scheduler.schedule(&frame_of(0.25)).unwrap();
        assert!((scheduler.queued_until().unwrap() - 0.75).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_back_to_back_frames_concatenate(lengths in proptest::collection::vec(1usize..48_000, 1..20)) {
            let (mut scheduler, _clock, _output) = scheduler();
            let mut expected_start = 0.0f64;

            for len in lengths {
                let frame = AudioFrame::new(vec![0; len], OUTPUT_SAMPLE_RATE, 1).unwrap();
                let scheduled = scheduler.schedule(&frame).unwrap();
                prop_assert!((scheduled.start_time - expected_start).abs() < 1e-9);
                expected_start += frame.duration();
            }
        }

        #[test]
        fn prop_cursor_never_moves_backwards(steps in proptest::collection::vec((0.0f64..2.0, 1usize..24_000), 1..20)) {
            let (mut scheduler, clock, _output) = scheduler();
            let mut now = 0.0f64;
            let mut previous_cursor = scheduler.next_start_time();

            for (advance, len) in steps {
                now += advance;
                clock.set(now);
                let frame = AudioFrame::new(vec![0; len], OUTPUT_SAMPLE_RATE, 1).unwrap();
                let scheduled = scheduler.schedule(&frame).unwrap();

                prop_assert!(scheduled.start_time >= now);
                prop_assert!(scheduled.start_time >= previous_cursor);
                prop_assert!(scheduler.next_start_time() >= previous_cursor);
                previous_cursor = scheduler.next_start_time();
            }
        }
    }
}
