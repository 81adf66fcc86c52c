//! # Call Status WebSocket
//!
//! `GET /ws/call` upgrades to a WebSocket that pushes the call snapshot every
//! time the visible call state changes, and accepts call commands.
//!
//! ## Message Format:
//! - **Server → Client**: `{"type": "call_status", "snapshot": {...}}`,
//!   `{"type": "error", "message": "..."}`, `{"type": "ping", "timestamp": ...}`
//! - **Client → Server**: `{"type": "start_call"}`, `{"type": "end_call"}`,
//!   `{"type": "pong", "timestamp": ...}`

use crate::session::{CallHandle, CallSnapshot};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "call_status")]
    CallStatus { snapshot: CallSnapshot },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "start_call")]
    StartCall,

    #[serde(rename = "end_call")]
    EndCall,

    #[serde(rename = "pong")]
    Pong {
        #[allow(dead_code)]
        timestamp: Option<i64>,
    },
}

/// One connected observer of the call.
pub struct CallStatusSocket {
    call: CallHandle,
    last_heartbeat: Instant,
}

impl CallStatusSocket {
    pub fn new(call: CallHandle) -> Self {
        Self {
            call,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &OutboundMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!("Failed to encode WebSocket message: {}", e),
        }
    }

    fn run_command(&mut self, command: InboundMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let call = self.call.clone();
        let work = async move {
            match command {
                InboundMessage::StartCall => call.start_call().await.map(|_| ()),
                InboundMessage::EndCall => call.end_call().await.map(|_| ()),
                InboundMessage::Pong { .. } => Ok(()),
            }
        };

        ctx.spawn(work.into_actor(self).map(|result, _act, ctx| {
            if let Err(e) = result {
                Self::send(ctx, &OutboundMessage::Error { message: e.to_string() });
            }
        }));
    }
}

impl Actor for CallStatusSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Call status WebSocket connected");

        // Emits the current snapshot first, then every visible change
        ctx.add_stream(WatchStream::new(self.call.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            Self::send(
                ctx,
                &OutboundMessage::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            );
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Call status WebSocket disconnected");
    }
}

impl StreamHandler<CallSnapshot> for CallStatusSocket {
    fn handle(&mut self, snapshot: CallSnapshot, ctx: &mut Self::Context) {
        Self::send(ctx, &OutboundMessage::CallStatus { snapshot });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallStatusSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(InboundMessage::Pong { .. }) => {}
                    Ok(command) => {
                        debug!(?command, "WebSocket call command");
                        self.run_command(command, ctx);
                    }
                    Err(e) => Self::send(
                        ctx,
                        &OutboundMessage::Error {
                            message: format!("invalid message: {}", e),
                        },
                    ),
                }
            }
            Ok(ws::Message::Ping(bytes)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&bytes);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Binary(_)) => {
                Self::send(
                    ctx,
                    &OutboundMessage::Error {
                        message: "binary messages are not supported".to_string(),
                    },
                );
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket protocol error: {}", e);
                ctx.stop();
            }
        }
    }
}

pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(CallStatusSocket::new(state.call.clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_commands_parse() {
        assert!(matches!(
            serde_json::from_str::<InboundMessage>(r#"{"type": "start_call"}"#).unwrap(),
            InboundMessage::StartCall
        ));
        assert!(matches!(
            serde_json::from_str::<InboundMessage>(r#"{"type": "pong", "timestamp": 5}"#).unwrap(),
            InboundMessage::Pong { .. }
        ));
        assert!(serde_json::from_str::<InboundMessage>(r#"{"type": "dance"}"#).is_err());
    }

    #[test]
    fn test_status_message_is_tagged() {
        let value = serde_json::to_value(OutboundMessage::CallStatus {
            snapshot: CallSnapshot::idle(),
        })
        .unwrap();
        assert_eq!(value["type"], "call_status");
        assert_eq!(value["snapshot"]["state"], "idle");
    }
}
