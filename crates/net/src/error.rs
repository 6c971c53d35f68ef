//! Network error types

use std::io;

use crate::content::ContentError;
use crate::inbox::SinkError;
use crate::protocol::DecodeError;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Not connected")]
    NotConnected,

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Own identifier must not be empty")]
    EmptyIdentifier,

    #[error("Sink error: {0}")]
    Sink(#[source] SinkError),
}

impl Error {
    /// Socket-level failure, recovered by the link's retry loop
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed)
    }

    /// A single malformed line; drop it and keep reading
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Decode(_))
    }
}
