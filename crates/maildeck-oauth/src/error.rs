//! Error types for the oauth library.

use thiserror::Error;

/// Errors that can occur during authentication setup.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request to the token endpoint failed.
    #[error("token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned {status}: {body}")]
    TokenRejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The token response could not be decoded.
    #[error("invalid token response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// No token endpoint is configured for this account.
    #[error("no token endpoint configured")]
    NoEndpoint,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
