//! Bidirectional streaming transport to the Gemini Live API
//!
//! The session controller only sees the [`Transport`] and
//! [`TransportConnection`] traits. The WebSocket implementation lives in
//! [`live_client`].
//!
//! # Architecture
//!
//! ```text
//!  Session loop ──send_audio()──▶ outbound channel ──▶ writer task ──▶ WebSocket
//!                                                                        │
//!  Session loop ◀── TransportEvent ◀── reader task ◀─────────────────────┘
//! ```
//!
//! Sends never wait on the socket. There is no automatic reconnect: a closed
//! or failed connection ends the session.

mod live_client;
mod protocol;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use live_client::{get_api_key, install_crypto_provider, LiveClient, LiveConnection};
pub use protocol::{
    Blob, ClientMessage, Content, Modality, Part, ServerContent, ServerMessage, SessionConfig,
    LIVE_API_URL,
};

/// Errors that can occur on the transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// API key not configured
    #[error("Gemini API key not configured. Set GEMINI_API_KEY or API_KEY environment variable.")]
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    #[error("Failed to connect to Gemini Live API: {0}")]
    ConnectionFailed(String),
    /// The server refused the session setup
    #[error("Session setup rejected: {0}")]
    SetupRejected(String),
    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    /// Connection was closed
    #[error("Connection closed")]
    Closed,
}

/// Inbound events for one connection. The sequence ends with `Closed` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed { reason: Option<String> },
    Error(String),
}

/// An open transport session.
pub trait TransportConnection: Send {
    /// Queue an encoded chunk for sending. Never waits on the network.
    fn send_audio(&mut self, chunk: Blob) -> Result<(), TransportError>;

    /// Take the inbound event receiver. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Close the session. Errors are swallowed; safe to call more than once.
    fn close(&mut self);
}

/// Opens transport sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect and complete session setup. Returning `Ok` is the "open" event.
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<Box<dyn TransportConnection>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = TransportError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = TransportError::SetupRejected("invalid model".to_string());
        assert!(err.to_string().contains("invalid model"));
    }
}
