//! Server runtime errors.

use mergeline_proto::ProtocolError;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur in the server runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, missing TLS certs, etc.).
    ///
    /// Fatal: prevents server startup. Fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (connection failure, I/O error, etc.).
    ///
    /// May be transient (network issues) or fatal (bind address in use).
    #[error("transport error: {0}")]
    Transport(String),

    /// A peer sent a frame that failed to decode.
    ///
    /// Fatal for that connection; the server keeps serving others.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Opening the persistent store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
