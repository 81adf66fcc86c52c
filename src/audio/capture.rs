//! # Capture Engine
//!
//! Owns the microphone stream while a call is active and turns raw device
//! callbacks into fixed-size mono frames at the upstream rate.
//!
//! Frames are pushed into a [`FrameSink`] straight from the audio thread. The
//! sink never blocks; whether a frame is actually sent is decided by the call
//! controller, which drops frames unless the session is streaming.

use crate::audio::frame::AudioFrame;
use crate::audio::level::LevelMeter;
use crate::device::{DeviceManager, DevicePreference};
use crate::error::PipelineError;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Sample;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives completed frames on the audio thread.
pub type FrameSink = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Something that can hand out a live microphone stream.
pub trait CaptureDevice {
    /// Acquire the input device and start producing frames tagged with `generation`.
    fn open(&mut self, generation: u64, sink: FrameSink) -> Result<Box<dyn CaptureStream>, PipelineError>;
}

/// A live capture stream owned by the controller.
pub trait CaptureStream {
    /// Disconnect the processing path; no further frames reach the sink.
    fn detach(&mut self) -> Result<(), PipelineError>;

    /// Stop the device stream and release the hardware.
    fn release(self: Box<Self>) -> Result<(), PipelineError>;
}

/// Downmixes, resamples and slices input into fixed-size blocks.
pub struct FrameAssembler {
    block_size: usize,
    channels: usize,
    /// Source samples consumed per output sample.
    step: f64,
    history: Vec<f32>,
    position: f64,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(source_rate: u32, channels: u16, target_rate: u32, block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            channels: channels.max(1) as usize,
            step: source_rate.max(1) as f64 / target_rate.max(1) as f64,
            history: Vec::new(),
            position: 0.0,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Feed interleaved device samples; `emit` is called once per complete block.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        let channels = self.channels;
        let mono = interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32);

        if (self.step - 1.0).abs() < f64::EPSILON {
            self.pending.extend(mono);
        } else {
            self.history.extend(mono);
            while self.position + 1.0 < self.history.len() as f64 {
                let idx = self.position as usize;
                let frac = (self.position - idx as f64) as f32;
                let s0 = self.history[idx];
                let s1 = self.history[idx + 1];
                self.pending.push(s0 + (s1 - s0) * frac);
                self.position += self.step;
            }
            let consumed = (self.position as usize).min(self.history.len());
            self.history.drain(..consumed);
            self.position -= consumed as f64;
        }

        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            emit(block);
        }
    }
}

/// Microphone capture through cpal.
pub struct CpalCapture {
    preference: DevicePreference,
    target_rate: u32,
    block_size: usize,
    level: LevelMeter,
}

impl CpalCapture {
    pub fn new(preference: DevicePreference, target_rate: u32, block_size: usize, level: LevelMeter) -> Self {
        Self {
            preference,
            target_rate,
            block_size,
            level,
        }
    }

    /// Prefer a native mono f32 stream at the target rate, else the device default.
    fn choose_config(&self, device: &cpal::Device) -> Result<(cpal::StreamConfig, cpal::SampleFormat), PipelineError> {
        let target = cpal::SampleRate(self.target_rate);
        if let Ok(mut ranges) = device.supported_input_configs() {
            let native = ranges.find(|range| {
                range.channels() == 1
                    && range.sample_format() == cpal::SampleFormat::F32
                    && range.min_sample_rate() <= target
                    && range.max_sample_rate() >= target
            });
            if let Some(range) = native {
                return Ok((range.with_sample_rate(target).config(), cpal::SampleFormat::F32));
            }
        }

        let fallback = device
            .default_input_config()
            .map_err(|e| PipelineError::Device(format!("microphone unavailable: {}", e)))?;
        Ok((fallback.config(), fallback.sample_format()))
    }
}

impl CaptureDevice for CpalCapture {
    fn open(&mut self, generation: u64, sink: FrameSink) -> Result<Box<dyn CaptureStream>, PipelineError> {
        let device = DeviceManager::input_device(&self.preference)?;
        let (config, format) = self.choose_config(&device)?;
        info!(
            generation,
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?format,
            "Opening capture stream"
        );

        let detached = Arc::new(AtomicBool::new(false));
        let assembler = FrameAssembler::new(config.sample_rate.0, config.channels, self.target_rate, self.block_size);
        let route = FrameRoute {
            generation,
            target_rate: self.target_rate,
            sink,
            level: self.level.clone(),
            detached: detached.clone(),
            assembler,
        };

        let stream = match format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, route)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, route)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, route)?,
            other => {
                return Err(PipelineError::Device(format!(
                    "unsupported input sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| PipelineError::Device(format!("failed to start microphone: {}", e)))?;

        Ok(Box::new(CpalCaptureStream {
            stream,
            detached,
        }))
    }
}

/// Per-stream state moved into the input callback.
struct FrameRoute {
    generation: u64,
    target_rate: u32,
    sink: FrameSink,
    level: LevelMeter,
    detached: Arc<AtomicBool>,
    assembler: FrameAssembler,
}

impl FrameRoute {
    fn accept(&mut self, samples: &[f32]) {
        if self.detached.load(Ordering::Relaxed) {
            return;
        }
        let (generation, rate) = (self.generation, self.target_rate);
        let sink = &self.sink;
        let level = &self.level;
        self.assembler.push(samples, |block| {
            level.record(&block);
            sink(AudioFrame::new(generation, rate, block));
        });
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut route: FrameRoute,
) -> Result<cpal::Stream, PipelineError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut converted: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                converted.clear();
                converted.extend(data.iter().map(|&s| f32::from_sample(s)));
                route.accept(&converted);
            },
            |err| warn!("Capture stream error: {}", err),
            None,
        )
        .map_err(|e| PipelineError::Device(format!("microphone access failed: {}", e)))
}

struct CpalCaptureStream {
    stream: cpal::Stream,
    detached: Arc<AtomicBool>,
}

impl CaptureStream for CpalCaptureStream {
    fn detach(&mut self) -> Result<(), PipelineError> {
        self.detached.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<(), PipelineError> {
        self.detached.store(true, Ordering::Relaxed);
        let result = self
            .stream
            .pause()
            .map_err(|e| PipelineError::Device(format!("failed to stop microphone: {}", e)));
        // Dropping the stream closes the device even if pause failed
        drop(self);
        debug!("Capture stream released");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(assembler: &mut FrameAssembler, input: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        assembler.push(input, |b| blocks.push(b));
        blocks
    }

    #[test]
    fn test_uneven_callbacks_produce_exact_blocks() {
        let mut assembler = FrameAssembler::new(16_000, 1, 16_000, 256);
        let mut blocks = Vec::new();
        for size in [100usize, 300, 50, 200] {
            let input: Vec<f32> = vec![0.1; size];
            blocks.extend(collect(&mut assembler, &input));
        }
        // 650 samples -> two full blocks, 138 pending
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 256));
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let mut assembler = FrameAssembler::new(16_000, 2, 16_000, 4);
        let blocks = collect(&mut assembler, &[1.0, 0.0, 0.5, 0.5, -1.0, 1.0, 0.2, 0.4]);
        assert_eq!(blocks.len(), 1);
        let expected = [0.5, 0.5, 0.0, 0.3];
        for (got, want) in blocks[0].iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_48k_input_is_resampled_to_16k() {
        let mut assembler = FrameAssembler::new(48_000, 1, 16_000, 256);
        let mut produced = 0usize;
        // One second of input in 10 ms callbacks
        for _ in 0..100 {
            let input = vec![0.25f32; 480];
            for block in collect(&mut assembler, &input) {
                assert!(block.iter().all(|s| (s - 0.25).abs() < 1e-6));
                produced += block.len();
            }
        }
        // 16000 output samples, minus the partial block still pending
        assert_eq!(produced, 16_000 / 256 * 256);
    }
}
