//! SASL initial responses.
//!
//! Implements:
//! - PLAIN (RFC 4616) - username/password
//! - OAUTHBEARER (RFC 7628) - standard `OAuth2` bearer token
//! - XOAUTH2 (Google/Microsoft proprietary) - legacy `OAuth2` bearer token
//!
//! All three return the raw (unencoded) initial response. The IMAP client
//! base64-frames whatever the authenticator hands it, so encoding here
//! would double-encode on the wire.

/// Builds the PLAIN initial response: `\0<username>\0<password>`.
///
/// The leading NUL is the empty authorization identity (same as the
/// authentication identity).
#[must_use]
pub fn plain_response(username: &str, password: &str) -> String {
    format!("\0{username}\0{password}")
}

/// Builds the OAUTHBEARER initial response (RFC 7628):
/// `n,a=<user>,\x01auth=Bearer <token>\x01\x01`.
#[must_use]
pub fn oauthbearer_response(user: &str, token: &str) -> String {
    format!("n,a={user},\x01auth=Bearer {token}\x01\x01")
}

/// Builds the XOAUTH2 initial response:
/// `user=<user>\x01auth=Bearer <token>\x01\x01`.
#[must_use]
pub fn xoauth2_response(user: &str, token: &str) -> String {
    format!("user={user}\x01auth=Bearer {token}\x01\x01")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use super::*;

    #[test]
    fn plain_format() {
        assert_eq!(plain_response("test", "pass"), "\0test\0pass");
    }

    #[test]
    fn plain_keeps_special_chars() {
        assert_eq!(plain_response("user", "pass@word!"), "\0user\0pass@word!");
    }

    #[test]
    fn oauthbearer_format() {
        assert_eq!(
            oauthbearer_response("test@test.com", "abc"),
            "n,a=test@test.com,\x01auth=Bearer abc\x01\x01"
        );
    }

    #[test]
    fn xoauth2_format() {
        assert_eq!(
            xoauth2_response("test@test.com", "abc"),
            "user=test@test.com\x01auth=Bearer abc\x01\x01"
        );
    }

    // The wire client is the one doing the base64 framing; these helpers
    // must produce data that survives one round of encoding, no more.
    #[test]
    fn responses_are_not_pre_encoded() {
        let raw = xoauth2_response("user@example.com", "token");
        assert!(raw.contains("user@example.com"));
        let framed = STANDARD.encode(raw.as_bytes());
        let decoded = STANDARD.decode(framed).unwrap();
        assert_eq!(decoded, raw.as_bytes());
    }
}
