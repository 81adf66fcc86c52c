//! # Transport Codec
//!
//! Converts between float PCM and the wire representation used by the remote
//! session: signed 16-bit little-endian PCM, base64-encoded inside JSON, with a
//! MIME descriptor carrying the sample rate (`audio/pcm;rate=16000`).
//!
//! ## Quantization:
//! - encode: clamp to `[-1, 1]`, scale by 32768, saturate to `i16`
//! - decode: `i16 / 32768`
//!
//! A round trip therefore reproduces every in-range sample within one
//! quantization step (1/32768).

use crate::audio::frame::{AudioFrame, PcmBuffer};
use crate::error::PipelineError;
use base64::{engine::general_purpose, Engine as _};
use byteorder::{ByteOrder, LittleEndian};

/// Scale between float samples and 16-bit integers.
const PCM_SCALE: f32 = 32768.0;

/// MIME type of microphone frames sent upstream.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Binary audio plus its MIME descriptor, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireAudioPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl WireAudioPayload {
    /// Base64 text of `data` (standard alphabet, padded).
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }

    /// Parse an inbound base64 payload.
    pub fn from_base64(mime_type: impl Into<String>, encoded: &str) -> Result<Self, PipelineError> {
        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| PipelineError::MalformedPayload(format!("invalid base64: {}", e)))?;
        Ok(Self {
            mime_type: mime_type.into(),
            data,
        })
    }

    /// Sample rate declared by the MIME `rate=` parameter, if any.
    pub fn declared_rate(&self) -> Option<u32> {
        parse_rate(&self.mime_type)
    }
}

/// `audio/pcm;rate=<n>` for the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate` parameter from a MIME string such as `audio/pcm;rate=24000`.
pub fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Quantize float samples into 16-bit little-endian PCM.
pub fn encode_pcm(samples: &[f32], sample_rate: u32) -> WireAudioPayload {
    let mut data = vec![0u8; samples.len() * 2];
    for (chunk, &sample) in data.chunks_exact_mut(2).zip(samples) {
        LittleEndian::write_i16(chunk, quantize(sample));
    }
    WireAudioPayload {
        mime_type: pcm_mime_type(sample_rate),
        data,
    }
}

/// Encode one captured frame for upstream transport.
pub fn encode_frame(frame: &AudioFrame) -> WireAudioPayload {
    encode_pcm(frame.samples(), frame.sample_rate)
}

/// Decode 16-bit little-endian PCM into an interleaved float buffer.
///
/// The byte length must be a whole number of sample frames
/// (`2 * channels` bytes each) and the rate must be non-zero; anything else is
/// a `MalformedPayload`.
pub fn decode_pcm(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PcmBuffer, PipelineError> {
    if channels == 0 {
        return Err(PipelineError::MalformedPayload("zero channels".to_string()));
    }
    if sample_rate == 0 {
        return Err(PipelineError::MalformedPayload("zero sample rate".to_string()));
    }
    if bytes.is_empty() {
        return Err(PipelineError::MalformedPayload("empty payload".to_string()));
    }
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(PipelineError::MalformedPayload(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit PCM)",
            bytes.len(),
            frame_bytes,
            channels
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| LittleEndian::read_i16(pair) as f32 / PCM_SCALE)
        .collect();

    Ok(PcmBuffer::new(sample_rate, channels, samples))
}

fn quantize(sample: f32) -> i16 {
    let scaled = sample.clamp(-1.0, 1.0) * PCM_SCALE;
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_one_step() {
        let samples: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.037).sin() * 0.9).collect();
        let payload = encode_pcm(&samples, 16_000);
        assert_eq!(payload.data.len(), samples.len() * 2);

        let decoded = decode_pcm(&payload.data, 16_000, 1).unwrap();
        for (original, restored) in samples.iter().zip(decoded.samples()) {
            assert!((original - restored).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_out_of_range_samples_saturate() {
        let payload = encode_pcm(&[1.0, -1.0, 4.0, -4.0], 16_000);
        let ints: Vec<i16> = payload.data.chunks_exact(2).map(LittleEndian::read_i16).collect();
        assert_eq!(ints, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_little_endian_layout() {
        // 0.5 * 32768 = 16384 = 0x4000
        let payload = encode_pcm(&[0.5], 16_000);
        assert_eq!(payload.data, vec![0x00, 0x40]);
        assert_eq!(payload.mime_type, INPUT_MIME_TYPE);
    }

    #[test]
    fn test_odd_length_is_malformed() {
        let err = decode_pcm(&[0x00, 0x40, 0x01], 24_000, 1).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload(_)));
    }

    #[test]
    fn test_partial_stereo_frame_is_malformed() {
        // 6 bytes = 3 samples, not a whole number of stereo frames
        let err = decode_pcm(&[0u8; 6], 24_000, 2).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload(_)));
        assert!(decode_pcm(&[0u8; 8], 24_000, 2).is_ok());
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        assert!(decode_pcm(&[], 24_000, 1).is_err());
    }

    #[test]
    fn test_zero_rate_is_malformed() {
        let err = decode_pcm(&[0u8; 4], 0, 1).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload(_)));
    }

    #[test]
    fn test_base64_round_trip_is_exact() {
        let payload = encode_pcm(&[0.25, -0.75, 0.0, 0.1], 16_000);
        let text = payload.to_base64();
        let restored = WireAudioPayload::from_base64(payload.mime_type.clone(), &text).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let err = WireAudioPayload::from_base64("audio/pcm;rate=24000", "@@not base64@@").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload(_)));
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(parse_rate("audio/pcm"), None);
        assert_eq!(parse_rate("audio/pcm;rate=abc"), None);
    }
}
