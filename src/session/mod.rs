//! # Live Session
//!
//! Call lifecycle and the remote streaming session.
//!
//! - **controller**: the single-consumer event loop owning all call state
//! - **state**: call states, the status/error board and published snapshots
//! - **transport**: traits the controller uses to talk to a remote engine
//! - **protocol**: JSON messages of the live streaming API
//! - **gemini**: WebSocket implementation of the transport

pub mod controller;
pub mod gemini;
pub mod protocol;
pub mod state;
pub mod transport;

pub use controller::CallHandle;
pub use state::CallSnapshot;
