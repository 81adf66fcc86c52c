//! # Audio Pipeline
//!
//! Local audio plumbing for a live call:
//!
//! - **frame**: PCM containers (`AudioFrame`, `PcmBuffer`)
//! - **codec**: float PCM to 16-bit LE wire payloads and back
//! - **capture**: microphone stream producing fixed 256-sample frames at 16 kHz
//! - **output**: speaker mixer with a sample-accurate clock
//! - **scheduler**: gapless playback of inbound chunks and barge-in flush
//! - **level**: input/output RMS taps

pub mod capture;
pub mod codec;
pub mod frame;
pub mod level;
pub mod output;
pub mod scheduler;

pub use level::LevelTaps;
