//! Error types for the IMAP worker.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during IMAP worker operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The configured host is not a valid TLS server name.
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// The wire client reported a protocol error.
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Token refresh failed.
    #[error("OAuth error: {0}")]
    OAuth(#[from] maildeck_oauth::Error),

    /// Invalid account configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The server violated the protocol or the connection state is
    /// inconsistent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TCP dial exceeded its bound. The socket state is unknown; the
    /// connection must be rebuilt, not retried in place.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Stopping IDLE exceeded its bound. The connection is presumed stuck
    /// and must be rebuilt.
    #[error("idle stop timed out after {0:?}")]
    IdleTimeout(Duration),

    /// A command exceeded its deadline. The connection state is unknown;
    /// it is torn down and rebuilt.
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// An operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// Connect was requested while already connected and selected.
    #[error("already connected")]
    AlreadyConnected,

    /// The client is not ready for this action yet.
    #[error("client not ready")]
    ClientNotReady,

    /// Header cache failure. Always treated as a soft miss by callers.
    #[error("cache error: {0}")]
    Cache(#[from] sqlx::Error),

    /// Cached value could not be decoded.
    #[error("cache decode error: {0}")]
    CacheDecode(#[from] serde_json::Error),

    /// The action's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// The worker does not implement the requested action.
    #[error("unsupported operation")]
    Unsupported,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
