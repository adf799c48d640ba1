use sigrelay_common::types::close_reason;
use sigrelay_common::EnvelopeError;
use thiserror::Error;

/// Ways a connection can fail to open with a valid `register`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The first frame was not a JSON object.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),
    /// The first envelope was not a `register`.
    #[error("expected register, got {0:?}")]
    UnexpectedType(Option<String>),
    /// `register` without a non-empty string `id`.
    #[error("id required")]
    MissingId,
    /// A binary frame where a JSON text frame was expected.
    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl ProtocolError {
    /// Reason string sent to the peer before closing.
    #[must_use]
    pub fn close_reason(&self) -> &'static str {
        close_reason::MUST_REGISTER_FIRST
    }
}

/// Errors that can end a relay session.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No `register` arrived before the deadline.
    #[error("registration timeout")]
    RegistrationTimeout,
    /// The WebSocket upgrade did not complete before the deadline.
    #[error("websocket handshake timeout")]
    HandshakeTimeout,
    /// The peer's address already holds the maximum number of connections.
    #[error("per-IP connection limit reached")]
    IpLimitReached,
    /// Too many connections are waiting to register.
    #[error("pending registration limit reached")]
    PendingLimitReached,
    /// The connection opened with something other than a valid `register`.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection could not be written to or was refused.
    #[error("connection closed")]
    ConnectionClosed,
}
