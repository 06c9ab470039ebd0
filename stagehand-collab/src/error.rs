use std::time::Duration;

use stagehand_core::GraphError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// The transport could not be established or went away.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection to {url} refused: {reason}")]
    Refused { url: String, reason: String },
    #[error("no connection after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
}

/// The join handshake failed after the transport was up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BootstrapError {
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("no join response within {0:?}")]
    Timeout(Duration),
    #[error("invalid join response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("document snapshot could not be loaded: {0}")]
    Document(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("session is not connected")]
    NotReady,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
