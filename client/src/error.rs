use shared::ProtocolError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The server answered `Join` with `Rejected`.
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("timed out waiting for the server to accept the join")]
    HandshakeTimeout,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
