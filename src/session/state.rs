//! # Call State
//!
//! The lifecycle of one call and the user-visible status line.
//!
//! ## Lifecycle:
//! 1. **Idle**: nothing has happened yet
//! 2. **Connecting**: the remote session is being opened
//! 3. **Open**: the session object exists; the microphone is being acquired
//! 4. **Streaming**: the remote side acknowledged setup; frames flow upstream
//! 5. **Closing**: teardown in progress
//! 6. **Closed**: torn down locally or by the remote side
//! 7. **Error**: a failure was surfaced; a new call may be started

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub enum CallState {
    Idle,
    Connecting,
    Open,
    Streaming,
    Closing,
    Closed,
    Error(String),
}

impl CallState {
    /// Stable identifier for API responses.
    pub fn as_str(&self) -> &str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Open => "open",
            CallState::Streaming => "streaming",
            CallState::Closing => "closing",
            CallState::Closed => "closed",
            CallState::Error(_) => "error",
        }
    }

    /// States from which a new call may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, CallState::Idle | CallState::Closed | CallState::Error(_))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, CallState::Streaming)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status/error pair shown to the user. Setting one clears the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusBoard {
    status: String,
    error: String,
}

impl StatusBoard {
    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
        self.error.clear();
    }

    pub fn set_error(&mut self, message: impl AsRef<str>) {
        self.error = format!("Error: {}", message.as_ref());
        self.status.clear();
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn error(&self) -> &str {
        &self.error
    }
}

/// Counters for one process lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct CallStats {
    pub calls_started: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_malformed: u64,
    pub interruptions: u64,
}

/// Published after every controller event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallSnapshot {
    pub call_id: Option<String>,
    pub state: String,
    pub is_call_active: bool,
    pub status: String,
    pub error: String,
    pub active_buffers: usize,
    pub next_start_time: f64,
    pub stats: CallStats,
    pub updated_at: DateTime<Utc>,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            call_id: None,
            state: CallState::Idle.as_str().to_string(),
            is_call_active: false,
            status: String::new(),
            error: String::new(),
            active_buffers: 0,
            next_start_time: 0.0,
            stats: CallStats::default(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_error_are_exclusive() {
        let mut board = StatusBoard::default();
        board.set_status("Call connected.");
        assert_eq!(board.status(), "Call connected.");
        assert_eq!(board.error(), "");

        board.set_error("Permission denied");
        assert_eq!(board.error(), "Error: Permission denied");
        assert_eq!(board.status(), "");

        board.set_status("Starting call...");
        assert_eq!(board.error(), "");
    }

    #[test]
    fn test_start_allowed_only_when_quiescent() {
        assert!(CallState::Idle.can_start());
        assert!(CallState::Closed.can_start());
        assert!(CallState::Error("x".into()).can_start());
        assert!(!CallState::Connecting.can_start());
        assert!(!CallState::Streaming.can_start());
        assert!(!CallState::Closing.can_start());
    }
}
