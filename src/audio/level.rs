//! Read-only RMS taps on the input and output paths.
//!
//! Audio callbacks store the RMS of the last block as raw `f32` bits in an
//! atomic; readers never block the audio thread.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct LevelMeter {
    bits: Arc<AtomicU32>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the RMS of `samples`. Empty blocks leave the level unchanged.
    pub fn record(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
        let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
        self.bits.store(rms.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.bits.store(0f32.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// The pair of taps exposed to the control surface.
#[derive(Debug, Clone, Default)]
pub struct LevelTaps {
    pub input: LevelMeter,
    pub output: LevelMeter,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LevelReading {
    pub input_level: f32,
    pub output_level: f32,
}

impl LevelTaps {
    pub fn reading(&self) -> LevelReading {
        LevelReading {
            input_level: self.input.level(),
            output_level: self.output.level(),
        }
    }

    pub fn reset(&self) {
        self.input.reset();
        self.output.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_of_constant_block() {
        let meter = LevelMeter::new();
        meter.record(&[0.5; 256]);
        assert!((meter.level() - 0.5).abs() < 1e-6);

        // Clones share the same tap
        let reader = meter.clone();
        meter.record(&[0.0; 256]);
        assert_eq!(reader.level(), 0.0);
    }
}
