//! Error types for the worker bus.

use thiserror::Error;

/// Errors that can occur on the bus itself.
#[derive(Debug, Error)]
pub enum Error {
    /// No backend factory is registered for the given URL scheme.
    #[error("unknown backend scheme: {0}")]
    UnknownBackend(String),

    /// The worker's action channel is closed (the backend is gone).
    #[error("worker channel closed")]
    ChannelClosed,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
