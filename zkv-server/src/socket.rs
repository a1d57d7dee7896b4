//! The outbound socket seam.
//!
//! The websocket framing layer is an external collaborator; the core only
//! needs to write framed messages and close with a code. [`MockSocket`]
//! records everything for tests.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use zkv_types::ServerMessage;

/// Application close codes surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Another live socket already carries this clientId.
    ClientAlreadyConnected,
    /// Too many connection attempts.
    RateLimited,
}

impl CloseCode {
    /// The numeric websocket close code (application range).
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::ClientAlreadyConnected => 4001,
            CloseCode::RateLimited => 4002,
        }
    }

    /// The human-readable close reason.
    pub fn reason(&self) -> &'static str {
        match self {
            CloseCode::ClientAlreadyConnected => "Client Already Connected",
            CloseCode::RateLimited => "Rate Limited",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}

/// Socket layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The socket is no longer open.
    #[error("socket closed")]
    Closed,

    /// The underlying transport failed to write.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outbound half of a client connection.
///
/// Implementations serialize [`ServerMessage`] values into whatever framing
/// the transport uses. Sends to a dead socket fail with an error the caller
/// is expected to swallow.
#[async_trait]
pub trait ClientSocket: Send + Sync {
    /// Write one framed message.
    async fn send(&self, message: &ServerMessage) -> Result<(), SocketError>;

    /// Close the socket with an application code.
    async fn close(&self, code: CloseCode) -> Result<(), SocketError>;

    /// Whether the socket is still open.
    fn is_open(&self) -> bool;
}

/// Mock socket for testing.
///
/// Records sent messages and the close code, and supports forced send
/// failures. Clones share state.
#[derive(Debug, Default)]
pub struct MockSocket {
    inner: Arc<Mutex<MockSocketInner>>,
}

#[derive(Debug)]
struct MockSocketInner {
    open: bool,
    sent: Vec<ServerMessage>,
    closed_with: Option<CloseCode>,
    fail_next_send: Option<String>,
}

impl Default for MockSocketInner {
    fn default() -> Self {
        Self {
            open: true,
            sent: Vec::new(),
            closed_with: None,
            fail_next_send: None,
        }
    }
}

impl MockSocket {
    /// Create a new open mock socket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<ServerMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<ServerMessage> {
        self.inner.lock().unwrap().sent.last().cloned()
    }

    /// The code the socket was closed with, if any.
    pub fn closed_with(&self) -> Option<CloseCode> {
        self.inner.lock().unwrap().closed_with
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_send = Some(error.to_string());
    }
}

impl Clone for MockSocket {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl ClientSocket for MockSocket {
    async fn send(&self, message: &ServerMessage) -> Result<(), SocketError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.open {
            return Err(SocketError::Closed);
        }

        if let Some(error) = inner.fail_next_send.take() {
            return Err(SocketError::SendFailed(error));
        }

        inner.sent.push(message.clone());
        Ok(())
    }

    async fn close(&self, code: CloseCode) -> Result<(), SocketError> {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        inner.closed_with = Some(code);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }
}
