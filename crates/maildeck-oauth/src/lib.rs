//! # maildeck-oauth
//!
//! Authentication helpers for maildeck store workers:
//!
//! - [`sasl`] builds the raw SASL initial responses for PLAIN (RFC 4616),
//!   OAUTHBEARER (RFC 7628) and XOAUTH2 (Google/Microsoft proprietary).
//!   The responses are *not* base64 encoded; the wire client performs the
//!   base64 framing when it sends AUTHENTICATE.
//! - [`token`] exchanges a refresh token for an access token against a
//!   configured OAuth2 token endpoint.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![forbid(unsafe_code)]

mod error;
pub mod sasl;
pub mod token;

pub use error::{Error, Result};
pub use token::{AccessToken, TokenConfig, TokenClient};
