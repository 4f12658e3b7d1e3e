//! Error types for the socket bridge.

use portal_wire::WireError;
use thiserror::Error;

/// Errors from the frontend server and the outlet client.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Client socket error: {0}")]
    ClientSocket(#[from] axum::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("No destination to dial for channel")]
    NoDestination,
    #[error("Destination did not answer within {0:?}")]
    DialTimeout(std::time::Duration),
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
