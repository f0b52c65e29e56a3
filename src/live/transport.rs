//! # Live Transport
//!
//! The duplex connection to the remote voice service.
//!
//! ## Shape of a connection:
//! - **LiveSink**: the outbound half, owned by the session's sender task
//! - **events**: an unbounded receiver fed by a reader task, ending with
//!   exactly one `Closed` or `Error` event
//!
//! `open` only resolves once the server has acknowledged the setup frame, so
//! a returned [`LiveConnection`] is the "transport is open" signal.

use crate::config::LiveConfig;
use crate::error::VoiceError;
use crate::live::protocol::{parse_server_message, LiveEvent, OutboundChunk, SessionSetup};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of an open live connection.
#[async_trait]
pub trait LiveSink: Send {
    async fn send_realtime_input(&mut self, chunk: &OutboundChunk) -> Result<(), VoiceError>;

    /// Close the connection. Errors are ignored; the socket may already be gone.
    async fn close(&mut self);
}

/// An open connection: where to send audio, and where server events arrive.
pub struct LiveConnection {
    pub sink: Box<dyn LiveSink>,
    pub events: mpsc::UnboundedReceiver<LiveEvent>,
}

/// Something that can open live connections.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Connect, send the setup and wait for it to be acknowledged.
    ///
    /// Every failure is reported as [`VoiceError::ConnectionFailed`].
    async fn open(&self, setup: &SessionSetup) -> Result<LiveConnection, VoiceError>;
}

/// WebSocket transport for the Gemini Live `BidiGenerateContent` endpoint.
pub struct GeminiLiveTransport {
    endpoint: String,
    setup_timeout: Duration,
    api_key: Option<String>,
}

impl GeminiLiveTransport {
    /// Build from configuration. The API key is read from the environment on
    /// every `open`, so a key added after startup is picked up.
    pub fn from_config(live: &LiveConfig) -> Self {
        Self {
            endpoint: live.endpoint.clone(),
            setup_timeout: Duration::from_secs(live.setup_timeout_secs),
            api_key: None,
        }
    }

    /// Use a fixed API key instead of the environment.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    fn url(&self) -> Result<String, VoiceError> {
        let key = self
            .api_key
            .clone()
            .or_else(LiveConfig::api_key)
            .ok_or_else(|| {
                VoiceError::ConnectionFailed(
                    "no API key configured (set GEMINI_API_KEY or API_KEY)".to_string(),
                )
            })?;

        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", self.endpoint, separator, key))
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn open(&self, setup: &SessionSetup) -> Result<LiveConnection, VoiceError> {
        let url = self.url()?;
        info!(endpoint = %self.endpoint, model = %setup.qualified_model(), "Connecting to live endpoint");

        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::ConnectionFailed(format!("websocket connect failed: {}", e)))?;
        let (mut write, mut read) = socket.split();

        let frame = setup.to_frame().map_err(VoiceError::into_connection)?;
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| VoiceError::ConnectionFailed(format!("failed to send setup: {}", e)))?;

        tokio::time::timeout(self.setup_timeout, wait_for_setup(&mut read))
            .await
            .map_err(|_| {
                VoiceError::ConnectionFailed(format!(
                    "no setup acknowledgement within {}s",
                    self.setup_timeout.as_secs_f32()
                ))
            })??;

        info!("Live session setup complete");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(read, events_tx));

        Ok(LiveConnection {
            sink: Box::new(WebSocketSink { write }),
            events: events_rx,
        })
    }
}

/// Text of a data frame. Binary frames carry UTF-8 JSON as well.
fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(_) => {
                warn!("Ignoring non UTF-8 binary frame");
                None
            }
        },
        _ => None,
    }
}

async fn wait_for_setup(read: &mut SplitStream<WsStream>) -> Result<(), VoiceError> {
    while let Some(message) = read.next().await {
        let message = message
            .map_err(|e| VoiceError::ConnectionFailed(format!("websocket error during setup: {}", e)))?;

        if let Message::Close(frame) = &message {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(VoiceError::ConnectionFailed(format!("server closed during setup: {}", reason)));
        }

        let Some(text) = frame_text(message) else { continue };
        match parse_server_message(&text) {
            Ok(events) if events.contains(&LiveEvent::SetupComplete) => return Ok(()),
            Ok(_) => debug!("Frame before setup acknowledgement ignored"),
            Err(e) => warn!("Malformed frame during setup: {}", e),
        }
    }

    Err(VoiceError::ConnectionFailed("connection ended before setup completed".to_string()))
}

async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::UnboundedSender<LiveEvent>) {
    let terminal = loop {
        let message = match read.next().await {
            None => break LiveEvent::Closed(None),
            Some(Err(e)) => break LiveEvent::Error(e.to_string()),
            Some(Ok(Message::Close(frame))) => {
                break LiveEvent::Closed(
                    frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty()),
                )
            }
            Some(Ok(message)) => message,
        };

        let Some(text) = frame_text(message) else { continue };
        match parse_server_message(&text) {
            Ok(parsed) => {
                for event in parsed {
                    if events.send(event).is_err() {
                        debug!("Session dropped its event receiver, stopping reader");
                        return;
                    }
                }
            }
            Err(e) => warn!("Skipping server frame: {}", e),
        }
    };

    debug!(event = ?terminal, "Live connection ended");
    let _ = events.send(terminal);
}

struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl LiveSink for WebSocketSink {
    async fn send_realtime_input(&mut self, chunk: &OutboundChunk) -> Result<(), VoiceError> {
        let frame = chunk.to_frame()?;
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| VoiceError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            debug!("Closing live connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::net::TcpListener;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "test-model".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "Hola".to_string(),
        }
    }

    async fn transport_for(listener: &TcpListener) -> GeminiLiveTransport {
        let mut config = AppConfig::default().live;
        config.endpoint = format!("ws://{}/live", listener.local_addr().unwrap());
        GeminiLiveTransport::from_config(&config).with_api_key("test-key")
    }

    #[tokio::test]
    async fn test_open_exchange_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = transport_for(&listener).await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(setup.contains("models/test-model"));
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.to_string())).await.unwrap();

            let input = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(input.contains("realtimeInput"));

            ws.send(Message::Binary(
                br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]}}}"#.to_vec(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let mut connection = transport.open(&setup()).await.unwrap();
        connection
            .sink
            .send_realtime_input(&OutboundChunk::pcm("AAAA".to_string()))
            .await
            .unwrap();

        assert_eq!(connection.events.recv().await, Some(LiveEvent::Audio("AAA=".to_string())));
        assert!(matches!(connection.events.recv().await, Some(LiveEvent::Closed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_timeout_is_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = transport_for(&listener)
            .await
            .with_setup_timeout(Duration::from_millis(100));

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Read the setup but never acknowledge it
            let _ = ws.next().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let err = transport.open(&setup()).await.err().unwrap();
        assert!(matches!(err, VoiceError::ConnectionFailed(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = transport_for(&listener).await;
        drop(listener);

        let err = transport.open(&setup()).await.err().unwrap();
        assert!(matches!(err, VoiceError::ConnectionFailed(_)));
    }
}
