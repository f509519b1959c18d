//! Refresh-token to access-token exchange.
//!
//! When an account's source URL configures a `token_endpoint`, the secret
//! in the URL is a refresh token. Before authenticating, the worker trades
//! it for a short-lived access token with a `grant_type=refresh_token`
//! form POST, then hands the access token to the SASL layer.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Token endpoint configuration, extracted from the account source URL's
/// query parameters.
#[derive(Debug, Clone, Default)]
pub struct TokenConfig {
    /// OAuth2 token endpoint URL. `None` means the configured secret is
    /// used as the bearer token directly.
    pub token_endpoint: Option<String>,
    /// OAuth2 client id.
    pub client_id: String,
    /// OAuth2 client secret, if the provider requires one.
    pub client_secret: Option<String>,
    /// Requested scope, if any.
    pub scope: Option<String>,
}

impl TokenConfig {
    /// Whether an endpoint is configured, i.e. whether
    /// [`TokenClient::refresh`] can run.
    #[must_use]
    pub fn has_endpoint(&self) -> bool {
        self.token_endpoint.is_some()
    }
}

/// A bearer access token obtained from the endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    /// The token itself.
    pub access_token: String,
    /// Token type as reported by the endpoint, normally `Bearer`.
    #[serde(default)]
    pub token_type: String,
    /// Lifetime in seconds, when reported.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchanges refresh tokens against one token endpoint.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    config: TokenConfig,
}

impl TokenClient {
    /// Creates a client for the given endpoint configuration.
    #[must_use]
    pub fn new(config: TokenConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Exchanges `refresh_token` for an access token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoEndpoint`] when no endpoint is configured,
    /// [`Error::TokenRejected`] when the endpoint answers with an error
    /// status, and transport/decode errors otherwise.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AccessToken> {
        let endpoint = self
            .config
            .token_endpoint
            .as_deref()
            .ok_or(Error::NoEndpoint)?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        if let Some(scope) = self.config.scope.as_deref() {
            form.push(("scope", scope));
        }

        let response = self.http.post(endpoint).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::TokenRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token = parse_token_response(&body)?;
        tracing::debug!(
            token_type = %token.token_type,
            expires_in = ?token.expires_in,
            "access token refreshed"
        );
        Ok(token)
    }
}

fn parse_token_response(body: &str) -> Result<AccessToken> {
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decodes_token_response() {
        let body = r#"{"access_token":"ya29.a0","token_type":"Bearer","expires_in":3599}"#;
        let token = parse_token_response(body).unwrap();
        assert_eq!(token.access_token, "ya29.a0");
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_in, Some(3599));
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let token = parse_token_response(r#"{"access_token":"tok"}"#).unwrap();
        assert_eq!(token.access_token, "tok");
        assert!(token.expires_in.is_none());
    }

    #[test]
    fn rejects_error_payload() {
        assert!(parse_token_response(r#"{"error":"invalid_grant"}"#).is_err());
    }

    #[tokio::test]
    async fn refresh_without_endpoint_fails_fast() {
        let client = TokenClient::new(TokenConfig::default());
        let err = client.refresh("r").await.unwrap_err();
        assert!(matches!(err, Error::NoEndpoint));
    }
}
