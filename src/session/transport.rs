//! Seams between the call controller and a remote live session.

use crate::audio::codec::WireAudioPayload;
use crate::error::PipelineError;
use crate::session::protocol::{ConnectRequest, ServerMessage};
use futures_util::future::LocalBoxFuture;
use std::sync::Arc;

/// Callbacks of an open session, delivered in arrival order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The remote side accepted the session setup.
    Opened,
    Message(ServerMessage),
    Error(String),
    /// The connection ended; carries the close reason when one was given.
    Closed(Option<String>),
}

/// Where a session delivers its callbacks. Safe to call from any thread.
pub type SessionEventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Opens sessions with a remote engine.
pub trait LiveConnector {
    /// Open a session. `events` must be wired before any traffic flows.
    fn connect(
        &self,
        url: String,
        request: ConnectRequest,
        events: SessionEventSink,
    ) -> LocalBoxFuture<'static, Result<Box<dyn LiveSession>, PipelineError>>;
}

/// One open duplex session. Sessions travel through the controller's event
/// queue, hence `Send`.
pub trait LiveSession: Send {
    /// Queue a realtime audio chunk. Never blocks.
    fn send_realtime_input(&mut self, payload: &WireAudioPayload) -> Result<(), PipelineError>;

    /// Close the session. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), PipelineError>;
}
