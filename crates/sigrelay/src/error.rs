use thiserror::Error;

/// Errors that can occur while relaying for a single connection.
///
/// Every variant except [`RelayError::Io`] on the listener is contained
/// inside the connection task that produced it.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Registration was attempted after shutdown began.
    #[error("registry is shut down")]
    RegistrationFailed,
    /// Writing a frame to the peer socket failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] tungstenite::Error),
    /// Writing a frame to the peer socket did not finish in time.
    #[error("send timed out")]
    WriteTimeout,
    /// Reading from the peer socket failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] tungstenite::Error),
    /// The connection was closed by the peer or refused by a limit.
    #[error("connection closed")]
    ConnectionClosed,
    /// The WebSocket upgrade did not complete in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// WebSocket upgrade error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
