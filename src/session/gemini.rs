//! # Gemini Live Transport
//!
//! Opens the bidirectional streaming endpoint over TLS WebSocket, sends the
//! setup message, and splits the socket into two tasks:
//!
//! - **writer**: drains an unbounded channel of outgoing frames, so
//!   `send_realtime_input` never waits on the network
//! - **reader**: parses server frames (text or UTF-8 binary JSON) and reports
//!   them through the [`SessionEventSink`]
//!
//! `Opened` is reported on `setupComplete`, not on socket open; the server
//! rejects realtime input sent before setup has been acknowledged.

use crate::audio::codec::WireAudioPayload;
use crate::error::PipelineError;
use crate::session::protocol::{ConnectRequest, RealtimeInputMessage, ServerMessage, SetupMessage};
use crate::session::transport::{LiveConnector, LiveSession, SessionEvent, SessionEventSink};
use futures_util::future::LocalBoxFuture;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiConnector;

impl LiveConnector for GeminiConnector {
    fn connect(
        &self,
        url: String,
        request: ConnectRequest,
        events: SessionEventSink,
    ) -> LocalBoxFuture<'static, Result<Box<dyn LiveSession>, PipelineError>> {
        Box::pin(async move {
            info!(model = %request.model, voice = %request.voice_name, "Opening live session");

            let (socket, response) = connect_async(url.as_str())
                .await
                .map_err(|e| PipelineError::Connection(e.to_string()))?;
            debug!(status = %response.status(), "WebSocket handshake complete");

            let (mut sink, stream) = socket.split();

            let setup = serde_json::to_string(&SetupMessage::from_request(&request))
                .map_err(|e| PipelineError::Connection(format!("failed to encode setup: {}", e)))?;
            sink.send(Message::Text(setup))
                .await
                .map_err(|e| PipelineError::Connection(format!("failed to send setup: {}", e)))?;

            let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();

            tokio::spawn(async move {
                while let Some(message) = queue.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        warn!("Live session write failed: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                if let Err(e) = sink.close().await {
                    debug!("Live session sink close: {}", e);
                }
            });

            tokio::spawn(read_loop(stream, events));

            Ok(Box::new(GeminiSession {
                outgoing,
                closed: false,
            }) as Box<dyn LiveSession>)
        })
    }
}

async fn read_loop<S>(mut stream: S, events: SessionEventSink)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&text, &events),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(text, &events),
                Err(_) => warn!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                events(SessionEvent::Closed(reason));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                events(SessionEvent::Error(e.to_string()));
                return;
            }
        }
    }
    events(SessionEvent::Closed(None));
}

fn dispatch(text: &str, events: &SessionEventSink) {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unparseable server message: {}", e);
            return;
        }
    };

    if let Some(error) = message.error_message() {
        events(SessionEvent::Error(error.to_string()));
    } else if message.is_setup_complete() {
        events(SessionEvent::Opened);
    } else {
        if message.go_away.is_some() {
            warn!("Server announced it will close the session soon");
        }
        events(SessionEvent::Message(message));
    }
}

struct GeminiSession {
    outgoing: mpsc::UnboundedSender<Message>,
    closed: bool,
}

impl LiveSession for GeminiSession {
    fn send_realtime_input(&mut self, payload: &WireAudioPayload) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::Connection("session is closed".to_string()));
        }
        let text = serde_json::to_string(&RealtimeInputMessage::audio(payload))
            .map_err(|e| PipelineError::Connection(format!("failed to encode audio: {}", e)))?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| PipelineError::Connection("connection lost".to_string()))
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.outgoing.send(Message::Close(None)).is_err() {
            debug!("Live session writer already stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_sink() -> (SessionEventSink, Arc<Mutex<Vec<SessionEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = seen.clone();
        let sink: SessionEventSink = Arc::new(move |event| store.lock().unwrap().push(event));
        (sink, seen)
    }

    #[tokio::test]
    async fn test_read_loop_maps_frames_to_events() {
        let (sink, seen) = recording_sink();
        let frames = futures_util::stream::iter(vec![
            Ok(Message::Text(r#"{"setupComplete": {}}"#.to_string())),
            Ok(Message::Binary(br#"{"serverContent": {"interrupted": true}}"#.to_vec())),
            Ok(Message::Text("not json".to_string())),
            Ok(Message::Text(r#"{"error": {"message": "quota exceeded"}}"#.to_string())),
        ]);

        read_loop(frames, sink).await;

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], SessionEvent::Opened));
        assert!(matches!(&events[1], SessionEvent::Message(m) if m.interrupted()));
        assert!(matches!(&events[2], SessionEvent::Error(msg) if msg == "quota exceeded"));
        assert!(matches!(events[3], SessionEvent::Closed(None)));
    }

    #[test]
    fn test_closed_session_rejects_input_and_closes_once() {
        let (outgoing, mut queue) = mpsc::unbounded_channel();
        let mut session = GeminiSession {
            outgoing,
            closed: false,
        };
        let payload = crate::audio::codec::encode_pcm(&[0.0; 4], 16_000);

        assert!(session.send_realtime_input(&payload).is_ok());
        assert!(session.close().is_ok());
        assert!(session.close().is_ok());
        assert!(session.send_realtime_input(&payload).is_err());

        assert!(matches!(queue.try_recv(), Ok(Message::Text(_))));
        assert!(matches!(queue.try_recv(), Ok(Message::Close(None))));
        assert!(queue.try_recv().is_err());
    }
}
