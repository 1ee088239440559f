//! Error types for the protocol crate

use thiserror::Error;

/// Protocol error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),

    #[error("points value {0} is not in the card deck")]
    InvalidCard(u32),
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;
