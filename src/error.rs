//! Error types for calculation-member

use thiserror::Error;

use crate::stream::ObserverState;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("No active stream")]
    NotConnected,

    #[error("Stream not ready (observer state: {0})")]
    NotReady(ObserverState),

    #[error("Client has been shut down")]
    Shutdown,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether this error ends the stream it was observed on.
    ///
    /// A frame that fails to decode only costs that frame; everything else
    /// reported by the inbound half means the stream is gone.
    pub fn is_stream_fatal(&self) -> bool {
        !matches!(self, ClientError::Codec(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
