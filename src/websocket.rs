//! # Session Events WebSocket
//!
//! Pushes the live volume level and session lifecycle to UI observers, and
//! lets them drive the session without going through the REST endpoints.
//! Clients connect to `/ws/events`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: The server immediately sends the current `state` and `volume`
//! 2. **Updates**: `volume`, `state` and `session_closed` messages follow as they happen
//! 3. **Commands**: The client may send `connect`, `disconnect` or `interrupt`
//! 4. **Heartbeat**: The server pings every 30 seconds and drops clients silent for 60
//!
//! ## Message Format:
//! - **Server → Client**: `{"type": "volume", "value": 42.0}`, `{"type": "state", "state": "streaming"}`
//! - **Client → Server**: `{"type": "connect"}`, `{"type": "pong", "timestamp": 1700000000000}`
//!
//! Audio never travels over this socket; it goes straight between the local
//! devices and the remote service.

use crate::audio::session::SessionState;
use crate::audio::volume::SessionEvent;
use crate::error::VoiceError;
use crate::state::AppState;

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Message, StreamHandler, WrapFuture};
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages pushed from the server to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Message)]
#[rtype(result = "()")]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// Merged input/output level in [0, 100]
    Volume { value: f32 },

    /// The session moved to a new state
    State { state: SessionState },

    /// A session was torn down
    SessionClosed,

    /// A command from this client failed
    Error { code: String, message: String },

    /// Heartbeat from the server; answer with `pong`
    Ping { timestamp: u64 },

    /// Answer to a client `ping`
    Pong { timestamp: u64 },
}

impl From<SessionEvent> for UiEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::StateChanged { state } => UiEvent::State { state },
            SessionEvent::Closed => UiEvent::SessionClosed,
        }
    }
}

/// Commands accepted from observers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Connect,
    Disconnect,
    Interrupt,
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

/// Code and message sent to observers for a failed connect. Failures the
/// user cannot act on are reported generically.
fn connect_error_payload(err: &VoiceError) -> (&'static str, String) {
    if err.is_user_visible() {
        (err.code(), err.to_string())
    } else {
        ("internal_error", "The session could not be started".to_string())
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// One observer connection.
///
/// ## Actor Model:
/// Each connection is its own actor. The session's volume `watch` channel and
/// event `broadcast` channel are turned into streams and attached to the
/// actor's context, so updates arrive as ordinary `UiEvent` messages.
pub struct SessionEventsSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl SessionEventsSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, event: &UiEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize UI event: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &UiEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        match command {
            ClientCommand::Connect => {
                let session = self.state.session.clone();
                ctx.spawn(async move { session.connect().await }.into_actor(self).map(
                    |result, act: &mut Self, ctx: &mut ws::WebsocketContext<Self>| match result {
                        Ok(outcome) => {
                            if outcome.started {
                                act.state.record_session_start(true);
                            }
                        }
                        Err(err) => {
                            act.state.record_session_start(false);
                            let (code, message) = connect_error_payload(&err);
                            if err.is_user_visible() {
                                warn!(code, "Connect from event socket failed: {}", err);
                            } else {
                                error!(code, "Connect from event socket failed unexpectedly: {}", err);
                            }
                            act.send_error(ctx, code, &message);
                        }
                    },
                ));
            }
            ClientCommand::Disconnect => self.state.session.disconnect(),
            ClientCommand::Interrupt => self.state.session.interrupt(),
            ClientCommand::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send(ctx, &UiEvent::Pong { timestamp });
            }
            ClientCommand::Pong { timestamp } => {
                self.last_heartbeat = Instant::now();
                debug!(latency_ms = now_millis().saturating_sub(timestamp), "Observer pong");
            }
        }
    }
}

impl Actor for SessionEventsSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Event WebSocket connection started");
        self.state.increment_event_subscribers();

        let session = &self.state.session;
        self.send(ctx, &UiEvent::State { state: session.state() });

        // WatchStream yields the current value first, so the client starts in sync
        let volume = WatchStream::new(session.subscribe_volume()).map(|value| UiEvent::Volume { value });
        let events = BroadcastStream::new(session.subscribe_events()).filter_map(|event| match event {
            Ok(event) => Some(UiEvent::from(event)),
            Err(e) => {
                // Lagged: the next event carries the current state anyway
                debug!("Event observer fell behind: {}", e);
                None
            }
        });
        ctx.add_message_stream(volume.merge(events));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Event WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                act.send(ctx, &UiEvent::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Event WebSocket connection stopped");
        self.state.decrement_event_subscribers();
    }
}

/// Forward session updates to the client.
impl Handler<UiEvent> for SessionEventsSocket {
    type Result = ();

    fn handle(&mut self, event: UiEvent, ctx: &mut Self::Context) {
        self.send(ctx, &event);
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionEventsSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => self.handle_command(command, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid command: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary messages are not accepted on this socket");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Event WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// This function handles the initial HTTP request and upgrades it to a WebSocket connection.
/// The actual communication is handled by the [`SessionEventsSocket`] actor.
pub async fn session_events(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New event WebSocket connection from: {:?}", req.connection_info().peer_addr());
    ws::start(SessionEventsSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_event_serialization() {
        let json = serde_json::to_value(UiEvent::Volume { value: 42.5 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "volume", "value": 42.5}));

        let json = serde_json::to_value(UiEvent::State { state: SessionState::RequestingPermission }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "state", "state": "requesting_permission"}));

        let json = serde_json::to_value(UiEvent::SessionClosed).unwrap();
        assert_eq!(json, serde_json::json!({"type": "session_closed"}));
    }

    #[test]
    fn test_session_events_map_to_ui_events() {
        assert_eq!(
            UiEvent::from(SessionEvent::StateChanged { state: SessionState::Streaming }),
            UiEvent::State { state: SessionState::Streaming }
        );
        assert_eq!(UiEvent::from(SessionEvent::Closed), UiEvent::SessionClosed);
    }

    #[test]
    fn test_client_command_parsing() {
        assert_eq!(
            serde_json::from_str::<ClientCommand>(r#"{"type":"connect"}"#).unwrap(),
            ClientCommand::Connect
        );
        assert_eq!(
            serde_json::from_str::<ClientCommand>(r#"{"type":"ping","timestamp":7}"#).unwrap(),
            ClientCommand::Ping { timestamp: 7 }
        );
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"start_session"}"#).is_err());
    }

    #[test]
    fn test_connect_errors_hide_internal_detail() {
        let (code, message) = connect_error_payload(&VoiceError::PermissionDenied("denied by user".to_string()));
        assert_eq!(code, "permission_denied");
        assert!(message.contains("denied by user"));

        let (code, message) = connect_error_payload(&VoiceError::Transcode("odd byte count".to_string()));
        assert_eq!(code, "internal_error");
        assert!(!message.contains("odd byte count"));
    }

    #[test]
    fn test_error_event_carries_code() {
        let json = serde_json::to_string(&UiEvent::Error {
            code: "permission_denied".to_string(),
            message: "denied".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("permission_denied"));
    }
}
