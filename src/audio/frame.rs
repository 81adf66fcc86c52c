//! PCM containers shared by capture, codec and playback.

/// One fixed-length block of mono microphone samples.
///
/// Produced by the capture callback and consumed exactly once by the encode
/// step. `generation` identifies the call that opened the capture stream, so
/// frames from a replaced call can be told apart from current ones.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub generation: u64,
    pub sample_rate: u32,
    samples: Box<[f32]>,
}

impl AudioFrame {
    pub fn new(generation: u64, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            generation,
            sample_rate,
            samples: samples.into_boxed_slice(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

/// Decoded float PCM, interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    samples: Vec<f32>,
}

impl PcmBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into a single mono track.
    pub fn into_mono(self) -> Vec<f32> {
        if self.channels <= 1 {
            return self.samples;
        }
        let channels = self.channels as usize;
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}
