//! Error types for the session core

use thiserror::Error;

/// Session error types
#[derive(Debug, Error)]
pub enum Error {
    /// Local discovery could not start; the session cannot bootstrap
    /// without the room code being exchanged some other way.
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// Send attempted before the link opened or after it closed.
    #[error("link is not open")]
    LinkNotOpen,

    /// Round start attempted while submissions are still pending.
    #[error("round not ready: waiting for estimates")]
    RoundNotReady,

    /// Estimate submission attempted in a state that does not allow it.
    #[error("cannot estimate: {0}")]
    NotEstimable(&'static str),

    /// Offer/answer exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The session actor has already shut down.
    #[error("session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] estimate_proto::Error),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;
