use crate::registry::ConnectionId;
use relay_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    /// The listener could not acquire its address. Never retried.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("'{0}' message received before Connect")]
    NotConnected(char),

    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

pub type Result<T> = std::result::Result<T, RelayError>;
