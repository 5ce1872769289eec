//! Error taxonomy shared by the client-side components.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced by the session channel and the components that send through it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The channel failed to open or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame could not be parsed. Inbound frames are dropped, not surfaced.
    #[error("malformed event: {0}")]
    Malformed(#[from] ProtocolError),

    /// A send was attempted on a channel that is closed.
    #[error("channel is closed")]
    ChannelClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::ChannelClosed,
            WsError::Http(response) => {
                Self::Connection(format!("handshake rejected with HTTP {}", response.status()))
            }
            other => Self::Connection(other.to_string()),
        }
    }
}
