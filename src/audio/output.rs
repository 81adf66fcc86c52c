//! # Output Device
//!
//! The playback side of the pipeline. An [`OutputDevice`] exposes a monotonic
//! clock in seconds and accepts buffers to be started at absolute clock times,
//! the way an audio graph schedules source nodes.
//!
//! The cpal implementation keeps a [`Mixer`] behind a mutex shared with the
//! render callback. The clock is the number of frames the callback has
//! rendered divided by the device rate, so it advances in lock-step with what
//! actually reaches the speakers. When a buffer plays to its end the callback
//! reports its id through a [`CompletionSink`].

use crate::audio::frame::PcmBuffer;
use crate::audio::level::LevelMeter;
use crate::device::{DeviceManager, DevicePreference};
use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Sample;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Identity of one scheduled playback buffer. Ids increase monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Called from the render thread when a buffer has played to its end.
pub type CompletionSink = Arc<dyn Fn(BufferId) + Send + Sync>;

/// Playback device with a sample-accurate clock.
pub trait OutputDevice {
    /// Current device time in seconds.
    fn now(&self) -> f64;

    /// Whether the device is rendering. Inbound audio is ignored otherwise.
    fn is_running(&self) -> bool;

    /// Start (or keep) rendering.
    fn resume(&mut self) -> Result<(), PipelineError>;

    /// Linear gain applied to the mix.
    fn set_gain(&mut self, gain: f32);

    /// Queue `pcm` to begin at device time `start_at`.
    fn start_buffer(&mut self, id: BufferId, pcm: PcmBuffer, start_at: f64) -> Result<(), PipelineError>;

    /// Silence a buffer immediately. Unknown or finished ids are ignored.
    fn stop_buffer(&mut self, id: BufferId);
}

struct Voice {
    id: BufferId,
    samples: Vec<f32>,
    /// Source samples advanced per device frame.
    step: f64,
    start_frame: u64,
    end_frame: u64,
}

impl Voice {
    fn sample_at(&self, frame: u64) -> Option<f32> {
        if frame < self.start_frame || frame >= self.end_frame {
            return None;
        }
        let pos = (frame - self.start_frame) as f64 * self.step;
        // Rounding the end may add one frame past the last source sample
        let idx = (pos as usize).min(self.samples.len().saturating_sub(1));
        let s0 = *self.samples.get(idx)?;
        let s1 = self.samples.get(idx + 1).copied().unwrap_or(s0);
        let frac = (pos - idx as f64) as f32;
        Some(s0 + (s1 - s0) * frac)
    }
}

/// Sums scheduled voices into the device's interleaved output.
pub struct Mixer {
    device_rate: u32,
    channels: usize,
    gain: f32,
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(device_rate: u32, channels: usize, gain: f32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            channels: channels.max(1),
            gain,
            frames_rendered: 0,
            voices: Vec::new(),
        }
    }

    pub fn clock(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Schedule a buffer, resampled to the device rate, starting at `start_at` seconds.
    ///
    /// Both ends are rounded from clock time, so a buffer scheduled at the
    /// previous one's end shares its boundary frame instead of overlapping it.
    pub fn add(&mut self, id: BufferId, pcm: PcmBuffer, start_at: f64) {
        let source_rate = pcm.sample_rate.max(1);
        let start_at = start_at.max(0.0);
        let end_at = start_at + pcm.duration();
        let samples = pcm.into_mono();

        self.voices.push(Voice {
            id,
            samples,
            step: source_rate as f64 / self.device_rate as f64,
            start_frame: self.frame_at(start_at),
            end_frame: self.frame_at(end_at),
        });
    }

    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds * self.device_rate as f64).round() as u64
    }

    /// Drop a voice without reporting completion.
    pub fn remove(&mut self, id: BufferId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Fill `out` (interleaved) and append ids of voices that finished during this block.
    pub fn render(&mut self, out: &mut [f32], finished: &mut Vec<BufferId>) {
        let frames = out.len() / self.channels;
        for (offset, frame) in out.chunks_mut(self.channels).take(frames).enumerate() {
            let position = self.frames_rendered + offset as u64;
            let mixed: f32 = self
                .voices
                .iter()
                .filter_map(|voice| voice.sample_at(position))
                .sum();
            let value = (mixed * self.gain).clamp(-1.0, 1.0);
            frame.iter_mut().for_each(|s| *s = value);
        }
        self.frames_rendered += frames as u64;

        let now = self.frames_rendered;
        self.voices.retain(|voice| {
            if voice.end_frame <= now {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
    }
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    match mixer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Speaker output through cpal.
pub struct CpalOutput {
    stream: cpal::Stream,
    mixer: Arc<Mutex<Mixer>>,
    running: bool,
}

impl CpalOutput {
    /// Open the output device and build a paused render stream.
    pub fn open(
        preference: &DevicePreference,
        gain: f32,
        level: LevelMeter,
        completion: CompletionSink,
    ) -> Result<Self, PipelineError> {
        let device = DeviceManager::output_device(preference)?;
        let supported = device
            .default_output_config()
            .map_err(|e| PipelineError::Device(format!("no usable output config: {}", e)))?;

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "Opening output stream"
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(
            config.sample_rate.0,
            config.channels as usize,
            gain,
        )));

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer.clone(), level, completion)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer.clone(), level, completion)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer.clone(), level, completion)?,
            other => {
                return Err(PipelineError::Device(format!(
                    "unsupported output sample format {:?}",
                    other
                )))
            }
        };

        if let Err(e) = stream.pause() {
            debug!("Output stream could not start paused: {}", e);
        }

        Ok(Self {
            stream,
            mixer,
            running: false,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    level: LevelMeter,
    completion: CompletionSink,
) -> Result<cpal::Stream, PipelineError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let mut finished: Vec<BufferId> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                lock_mixer(&mixer).render(&mut scratch, &mut finished);

                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
                level.record(&scratch);

                for id in finished.drain(..) {
                    completion(id);
                }
            },
            |err| warn!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| PipelineError::Device(format!("failed to build output stream: {}", e)))
}

impl OutputDevice for CpalOutput {
    fn now(&self) -> f64 {
        lock_mixer(&self.mixer).clock()
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn resume(&mut self) -> Result<(), PipelineError> {
        if self.running {
            return Ok(());
        }
        self.stream
            .play()
            .map_err(|e| PipelineError::Device(format!("failed to start output: {}", e)))?;
        self.running = true;
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        lock_mixer(&self.mixer).set_gain(gain);
    }

    fn start_buffer(&mut self, id: BufferId, pcm: PcmBuffer, start_at: f64) -> Result<(), PipelineError> {
        lock_mixer(&self.mixer).add(id, pcm, start_at);
        Ok(())
    }

    fn stop_buffer(&mut self, id: BufferId) {
        lock_mixer(&self.mixer).remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> PcmBuffer {
        PcmBuffer::new(24_000, 1, (0..len).map(|i| 0.1 + i as f32 * 1e-5).collect())
    }

    #[test]
    fn test_back_to_back_voices_leave_no_gap() {
        let mut mixer = Mixer::new(24_000, 1, 1.0);
        mixer.add(BufferId(1), ramp(2_400), 0.0);
        mixer.add(BufferId(2), ramp(2_400), 0.1);

        let mut out = vec![0.0f32; 4_800];
        let mut finished = Vec::new();
        mixer.render(&mut out, &mut finished);

        assert!(out.iter().all(|&s| s > 0.0), "silent frame between voices");
        assert_eq!(finished, vec![BufferId(1), BufferId(2)]);
        assert!((mixer.clock() - 0.2).abs() < 1e-12);
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_voice_waits_for_start_time() {
        let mut mixer = Mixer::new(24_000, 2, 1.0);
        mixer.add(BufferId(7), ramp(240), 0.005);

        let mut out = vec![0.0f32; 2 * 240];
        let mut finished = Vec::new();
        mixer.render(&mut out, &mut finished);

        // First 120 frames (5 ms) are silent on both channels
        assert!(out[..240].iter().all(|&s| s == 0.0));
        assert!(out[240..].iter().all(|&s| s > 0.0));
        assert!(finished.is_empty());
    }

    #[test]
    fn test_chained_voices_never_share_a_frame_at_44k1() {
        let mut mixer = Mixer::new(44_100, 1, 1.0);
        let mut at = 0.0;
        for (n, len) in [2_400usize, 1_000, 1_777, 3_333, 2_401, 999].into_iter().enumerate() {
            let pcm = ramp(len);
            let duration = pcm.duration();
            mixer.add(BufferId(n as u64), pcm, at);
            at += duration;
        }

        let total = (at * 44_100.0).round() as usize;
        let mut out = vec![0.0f32; total];
        let mut finished = Vec::new();
        mixer.render(&mut out, &mut finished);

        // A single voice stays below 0.14; two summed would exceed 0.2
        assert!(out.iter().all(|&s| s > 0.0 && s < 0.2));
        assert_eq!(finished.len(), 6);
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_removed_voice_is_silent_and_not_reported() {
        let mut mixer = Mixer::new(24_000, 1, 1.0);
        mixer.add(BufferId(3), ramp(480), 0.0);
        assert!(mixer.remove(BufferId(3)));
        assert!(!mixer.remove(BufferId(3)));

        let mut out = vec![0.0f32; 480];
        let mut finished = Vec::new();
        mixer.render(&mut out, &mut finished);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(finished.is_empty());
    }

    #[test]
    fn test_resampled_voice_keeps_its_duration() {
        // 24 kHz source on a 48 kHz device occupies twice as many frames
        let mut mixer = Mixer::new(48_000, 1, 1.0);
        mixer.add(BufferId(1), ramp(2_400), 0.0);

        let mut out = vec![0.0f32; 4_799];
        let mut finished = Vec::new();
        mixer.render(&mut out, &mut finished);
        assert!(finished.is_empty());

        let mut tail = vec![0.0f32; 1];
        mixer.render(&mut tail, &mut finished);
        assert_eq!(finished, vec![BufferId(1)]);
    }
}
