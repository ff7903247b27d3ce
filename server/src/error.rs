use crate::registry::RegistryError;
use shared::ProtocolError;
use std::io;
use thiserror::Error;

/// Errors that stop the server as a whole. Anything scoped to one session is
/// handled by tearing that session down instead.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
