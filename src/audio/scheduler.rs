//! # Playback Scheduler
//!
//! Turns inbound audio chunks into a gapless, ordered stream on the output
//! device and flushes everything on interruption.
//!
//! ## Scheduling rule:
//! ```text
//! start           = max(next_start_time, output.now())
//! next_start_time = start + duration
//! ```
//! Chunks arriving faster than real time queue back-to-back with zero gap. A
//! chunk arriving after the queue has drained starts "now", leaving a gap but
//! never overlapping or reordering.
//!
//! ## Active buffer arena:
//! Every scheduled buffer gets a fresh [`BufferId`] and lives in `active` until
//! it finishes naturally, is interrupted, or the call stops. Removal by id is
//! idempotent, so a completion event racing a flush is harmless.

use crate::audio::codec::{self, WireAudioPayload};
use crate::audio::output::{BufferId, OutputDevice};
use crate::error::PipelineError;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// A buffer handed to the output device and not yet finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start_time: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    /// Rate assumed when the payload MIME type does not declare one.
    default_rate: u32,
    channels: u16,
    next_start_time: f64,
    next_id: u64,
    active: BTreeMap<BufferId, ScheduledBuffer>,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputDevice>, default_rate: u32) -> Self {
        Self {
            output,
            default_rate,
            channels: 1,
            next_start_time: 0.0,
            next_id: 0,
            active: BTreeMap::new(),
        }
    }

    pub fn output_mut(&mut self) -> &mut dyn OutputDevice {
        self.output.as_mut()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Re-anchor the clock to the device's current time (call start).
    pub fn reset_clock_to_now(&mut self) {
        self.next_start_time = self.output.now();
    }

    /// Decode and schedule one inbound chunk.
    ///
    /// Returns `Ok(None)` when the output device is not running; the chunk is
    /// discarded without touching the clock.
    pub fn schedule_payload(
        &mut self,
        payload: &WireAudioPayload,
    ) -> Result<Option<ScheduledBuffer>, PipelineError> {
        if !self.output.is_running() {
            debug!("Output not running, discarding inbound audio");
            return Ok(None);
        }

        let rate = payload.declared_rate().unwrap_or(self.default_rate);
        let pcm = codec::decode_pcm(&payload.data, rate, self.channels)?;
        let duration = pcm.duration();

        let start_time = self.next_start_time.max(self.output.now());
        self.next_id += 1;
        let id = BufferId(self.next_id);

        self.output.start_buffer(id, pcm, start_time)?;
        self.next_start_time = start_time + duration;

        let buffer = ScheduledBuffer {
            id,
            start_time,
            duration,
        };
        self.active.insert(id, buffer);
        trace!(%id, start_time, duration, "Scheduled playback buffer");

        Ok(Some(buffer))
    }

    /// A buffer played to its end. Unknown ids are ignored.
    pub fn finished(&mut self, id: BufferId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Barge-in: silence everything queued and reset the clock to zero.
    ///
    /// The next chunk then starts at `output.now()`.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        debug!(stopped, "Playback interrupted");
        stopped
    }

    /// Stop every active buffer, clear the arena and zero the clock.
    pub fn stop_all(&mut self) -> usize {
        let ids: Vec<BufferId> = self.active.keys().copied().collect();
        for id in &ids {
            self.output.stop_buffer(*id);
        }
        self.active.clear();
        self.next_start_time = 0.0;
        ids.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::encode_pcm;
    use crate::audio::frame::PcmBuffer;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Output device whose clock is set by the test.
    #[derive(Clone, Default)]
    pub(crate) struct FakeOutput {
        pub clock: Rc<Cell<f64>>,
        pub running: Rc<Cell<bool>>,
        pub started: Rc<RefCell<Vec<(BufferId, f64, f64)>>>,
        pub stopped: Rc<RefCell<Vec<BufferId>>>,
    }

    impl FakeOutput {
        pub fn running() -> Self {
            let output = Self::default();
            output.running.set(true);
            output
        }
    }

    impl OutputDevice for FakeOutput {
        fn now(&self) -> f64 {
            self.clock.get()
        }

        fn is_running(&self) -> bool {
            self.running.get()
        }

        fn resume(&mut self) -> Result<(), PipelineError> {
            self.running.set(true);
            Ok(())
        }

        fn set_gain(&mut self, _gain: f32) {}

        fn start_buffer(&mut self, id: BufferId, pcm: PcmBuffer, start_at: f64) -> Result<(), PipelineError> {
            self.started.borrow_mut().push((id, start_at, pcm.duration()));
            Ok(())
        }

        fn stop_buffer(&mut self, id: BufferId) {
            self.stopped.borrow_mut().push(id);
        }
    }

    /// `ms` milliseconds of 24 kHz audio as a wire payload.
    pub(crate) fn chunk_ms(ms: usize) -> WireAudioPayload {
        encode_pcm(&vec![0.2; 24 * ms], 24_000)
    }

    #[test]
    fn test_sequential_chunks_are_gapless() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);
        scheduler.reset_clock_to_now();

        let first = scheduler.schedule_payload(&chunk_ms(100)).unwrap().unwrap();
        let second = scheduler.schedule_payload(&chunk_ms(100)).unwrap().unwrap();

        assert_eq!(first.start_time, 0.0);
        assert!((second.start_time - (first.start_time + first.duration)).abs() < 1e-12);
        assert!((scheduler.next_start_time() - 0.2).abs() < 1e-12);
        assert_eq!(scheduler.active_len(), 2);
        assert!(first.id < second.id);
    }

    #[test]
    fn test_stall_starts_at_now_without_overlap() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);

        let first = scheduler.schedule_payload(&chunk_ms(100)).unwrap().unwrap();
        // Network stall: clock passes the end of the queue
        output.clock.set(0.35);
        let second = scheduler.schedule_payload(&chunk_ms(50)).unwrap().unwrap();

        assert_eq!(second.start_time, 0.35);
        assert!(second.start_time >= first.start_time + first.duration);
        assert!((scheduler.next_start_time() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_clock() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);
        for _ in 0..3 {
            scheduler.schedule_payload(&chunk_ms(100)).unwrap();
        }
        output.clock.set(0.05);

        assert_eq!(scheduler.interrupt(), 3);
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(output.stopped.borrow().len(), 3);

        // Next chunk starts at the device clock, not at zero
        let next = scheduler.schedule_payload(&chunk_ms(100)).unwrap().unwrap();
        assert_eq!(next.start_time, 0.05);
    }

    #[test]
    fn test_finished_and_stop_are_idempotent() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);
        let buffer = scheduler.schedule_payload(&chunk_ms(20)).unwrap().unwrap();

        assert!(scheduler.finished(buffer.id));
        assert!(!scheduler.finished(buffer.id));
        assert_eq!(scheduler.stop_all(), 0);
        assert_eq!(scheduler.interrupt(), 0);
        assert!(output.stopped.borrow().is_empty());
    }

    #[test]
    fn test_malformed_chunk_does_not_disturb_queue() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);
        scheduler.schedule_payload(&chunk_ms(100)).unwrap();

        let broken = WireAudioPayload {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: vec![0x01, 0x02, 0x03],
        };
        assert!(matches!(
            scheduler.schedule_payload(&broken),
            Err(PipelineError::MalformedPayload(_))
        ));
        assert_eq!(scheduler.active_len(), 1);
        assert!((scheduler.next_start_time() - 0.1).abs() < 1e-12);

        let next = scheduler.schedule_payload(&chunk_ms(100)).unwrap().unwrap();
        assert!((next.start_time - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_zero_declared_rate_is_dropped_without_moving_clock() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);

        let zero_rate = WireAudioPayload {
            mime_type: "audio/pcm;rate=0".to_string(),
            data: chunk_ms(100).data,
        };
        assert!(matches!(
            scheduler.schedule_payload(&zero_rate),
            Err(PipelineError::MalformedPayload(_))
        ));
        assert_eq!(scheduler.active_len(), 0);
        assert!(output.started.borrow().is_empty());

        let next = scheduler.schedule_payload(&chunk_ms(100)).unwrap().unwrap();
        assert_eq!(next.start_time, 0.0);
        assert!((scheduler.next_start_time() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_discards_audio_while_output_suspended() {
        let output = FakeOutput::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);
        assert_eq!(scheduler.schedule_payload(&chunk_ms(100)).unwrap(), None);
        assert_eq!(scheduler.active_len(), 0);
        assert!(output.started.borrow().is_empty());
    }

    #[test]
    fn test_declared_rate_overrides_default() {
        let output = FakeOutput::running();
        let mut scheduler = PlaybackScheduler::new(Box::new(output.clone()), 24_000);
        // 1600 samples declared at 16 kHz = 100 ms
        let payload = encode_pcm(&vec![0.1; 1_600], 16_000);
        let buffer = scheduler.schedule_payload(&payload).unwrap().unwrap();
        assert!((buffer.duration - 0.1).abs() < 1e-12);
    }
}
