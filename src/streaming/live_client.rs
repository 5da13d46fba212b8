//! Gemini Live API WebSocket client
//!
//! Manages the WebSocket connection lifecycle for a live voice session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. `send_audio()` - Queue audio chunks for the writer task (non-blocking)
//! 3. `take_events()` - Receive server messages and the terminal close/error
//! 4. `close()` - Cancel the writer (sends a close frame) and stop the reader
//!
//! There is no retry: a failed connect fails the session, and a mid-session
//! disconnect ends it.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};
use tokio_util::sync::CancellationToken;

use super::protocol::{Blob, ClientMessage, ServerMessage, SessionConfig, LIVE_API_URL};
use super::{Transport, TransportConnection, TransportError, TransportEvent};

/// Connection timeout for the initial WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for `setupComplete`
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound event channel
const EVENT_CHANNEL_SIZE: usize = 100;

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    // Err means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Get the Gemini API key from environment (`GEMINI_API_KEY`, then `API_KEY`)
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|key| !key.trim().is_empty())
}

/// Opens live sessions against the Gemini Live endpoint
#[derive(Clone)]
pub struct LiveClient {
    api_key: String,
    endpoint: String,
    connect_timeout: Duration,
    setup_timeout: Duration,
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("setup_timeout", &self.setup_timeout)
            .finish_non_exhaustive()
    }
}

impl LiveClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: LIVE_API_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
        }
    }

    /// Build a client from the environment API key
    pub fn from_env() -> Result<Self, TransportError> {
        get_api_key()
            .map(Self::new)
            .ok_or(TransportError::MissingApiKey)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, setup: Duration) -> Self {
        self.connect_timeout = connect;
        self.setup_timeout = setup;
        self
    }

    fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

#[async_trait]
impl Transport for LiveClient {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let connection = LiveConnection::connect(self, config).await?;
        Ok(Box::new(connection))
    }
}

/// Handle to an open Live API session
///
/// Outbound messages go through an unbounded channel to a writer task, so
/// `send_audio` never waits on the socket. Inbound messages are forwarded by a
/// reader task as [`TransportEvent`]s.
pub struct LiveConnection {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Wrapped in Option so it can be taken for concurrent processing
    events: Option<mpsc::Receiver<TransportEvent>>,
    cancel: CancellationToken,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
    closed: bool,
}

impl LiveConnection {
    async fn connect(client: &LiveClient, config: &SessionConfig) -> Result<Self, TransportError> {
        install_crypto_provider();

        let request = client
            .url()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to Gemini Live API (model {})...", config.model);

        let (ws_stream, _response) = timeout(
            client.connect_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, waiting for setupComplete...");

        timeout(client.setup_timeout, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if parse_server_message(text.as_bytes())
                            .is_some_and(|msg| msg.is_setup_complete())
                        {
                            return Ok(());
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if parse_server_message(&bytes).is_some_and(|msg| msg.is_setup_complete())
                        {
                            return Ok(());
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed before setup completed".to_string());
                        return Err(TransportError::SetupRejected(reason));
                    }
                    Err(e) => return Err(TransportError::ProtocolError(e.to_string())),
                    _ => {} // Ignore ping/pong
                }
            }
            Err(TransportError::Closed)
        })
        .await
        .map_err(|_| TransportError::ConnectionFailed("Session setup timeout".to_string()))??;

        log::info!("Live session setup complete");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer_events = events_tx.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = outbound_rx.recv() => {
                        let Some(msg) = next else { break };
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Failed to serialize client message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            log::warn!("WebSocket send failed: {}", e);
                            let _ = writer_events.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("Error closing WebSocket: {}", e);
            }
            log::debug!("Writer task exiting");
        });

        let reader_task = tokio::spawn(async move {
            let terminal = loop {
                let Some(msg_result) = read.next().await else {
                    break TransportEvent::Closed { reason: None };
                };
                let parsed = match msg_result {
                    Ok(Message::Text(text)) => parse_server_message(text.as_bytes()),
                    Ok(Message::Binary(bytes)) => parse_server_message(&bytes),
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        log::info!("WebSocket closed by server: {:?}", reason);
                        break TransportEvent::Closed { reason };
                    }
                    Err(e) => {
                        log::warn!("WebSocket error: {}", e);
                        break TransportEvent::Error(e.to_string());
                    }
                    _ => None, // Ignore ping/pong
                };

                if let Some(msg) = parsed {
                    if events_tx.send(TransportEvent::Message(msg)).await.is_err() {
                        log::debug!("Event receiver dropped");
                        return;
                    }
                }
            };
            let _ = events_tx.send(terminal).await;
            log::debug!("Reader task exiting");
        });

        Ok(Self {
            outbound: outbound_tx,
            events: Some(events_rx),
            cancel,
            writer_task,
            reader_task,
            closed: false,
        })
    }
}

impl TransportConnection for LiveConnection {
    fn send_audio(&mut self, chunk: Blob) -> Result<(), TransportError> {
        if self.closed || self.writer_task.is_finished() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(ClientMessage::media(chunk))
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::info!("Closing Live API session");

        // The writer sends the close frame on its way out
        self.cancel.cancel();
        self.reader_task.abort();
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse a server frame, logging and skipping anything that is not valid JSON
fn parse_server_message(bytes: &[u8]) -> Option<ServerMessage> {
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(msg) => {
            if let Some(go_away) = &msg.go_away {
                log::warn!("Server requested disconnect (time left: {:?})", go_away.time_left);
            }
            Some(msg)
        }
        Err(e) => {
            log::warn!("Failed to parse server message: {}", e);
            None
        }
    }
}
