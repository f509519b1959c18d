//! Connection establishment.
//!
//! A (re)connect is always the full sequence: fresh TCP dial bounded by
//! `connection-timeout`, TLS or STARTTLS, authentication, SELECT INBOX.
//! Half-open sockets are never resumed.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use maildeck_oauth::{TokenClient, sasl};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::client::{ImapClient, SelectedMailbox, Session};
use crate::config::{AuthMethod, Encryption, ImapConfig};
use crate::error::{Error, Result};

/// A stream that can be either plaintext or TLS.
#[derive(Debug)]
pub enum ImapStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Dials, secures, authenticates and selects INBOX, returning a ready
/// client handle.
pub(crate) async fn establish(config: &ImapConfig) -> Result<ImapClient> {
    let mut tcp = dial(config).await?;

    let stream = match config.encryption {
        Encryption::ImplicitTls => tls_wrap(&config.host, tcp).await?,
        Encryption::StartTls => {
            starttls_exchange(&mut tcp).await?;
            tls_wrap(&config.host, tcp).await?
        }
        Encryption::Insecure => ImapStream::Plain(tcp),
    };

    let client = async_imap::Client::new(stream);
    let mut session = authenticate(config, client).await?;

    let capabilities = session.capabilities().await?;

    let mailbox = session.select("INBOX").await?;
    let selected = SelectedMailbox::from_mailbox("INBOX", &mailbox);
    tracing::debug!(
        exists = mailbox.exists,
        uid_validity = ?mailbox.uid_validity,
        "connected and selected INBOX"
    );

    Ok(ImapClient::new(session, capabilities, selected))
}

/// Establishes the TCP connection. The timeout ensures the dial does not
/// hang; keepalive tuning is applied when a period is configured.
async fn dial(config: &ImapConfig) -> Result<TcpStream> {
    let addr = format!("{}:{}", config.host, config.port);
    let connect = TcpStream::connect(&addr);
    let tcp = if config.connection_timeout.is_zero() {
        connect.await?
    } else {
        tokio::time::timeout(config.connection_timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(config.connection_timeout))??
    };
    if !config.keepalive_period.is_zero() {
        set_keepalive(&tcp, config)?;
    }
    Ok(tcp)
}

#[cfg(target_os = "linux")]
fn set_keepalive(stream: &TcpStream, config: &ImapConfig) -> Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true).map_err(io::Error::from)?;
    // Idle time before the first probe.
    let period = u32::try_from(config.keepalive_period.as_secs()).unwrap_or(u32::MAX);
    setsockopt(stream, sockopt::TcpKeepIdle, &period).map_err(io::Error::from)?;
    // Max number of probes before the connection is declared dead.
    setsockopt(stream, sockopt::TcpKeepCount, &config.keepalive_probes)
        .map_err(io::Error::from)?;
    // Wait time after an unsuccessful probe.
    setsockopt(stream, sockopt::TcpKeepInterval, &config.keepalive_interval)
        .map_err(io::Error::from)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_keepalive(_stream: &TcpStream, _config: &ImapConfig) -> Result<()> {
    tracing::warn!("keepalive tuning is not supported on this platform");
    Ok(())
}

fn tls_connector() -> TlsConnector {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(tls_config))
}

async fn tls_wrap(host: &str, tcp: TcpStream) -> Result<ImapStream> {
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = tls_connector().connect(server_name, tcp).await?;
    Ok(ImapStream::Tls(Box::new(tls)))
}

/// Negotiates STARTTLS on the raw socket: consume the greeting, issue the
/// command, wait for its OK. The wire client takes over only once the
/// stream is encrypted.
async fn starttls_exchange(tcp: &mut TcpStream) -> Result<()> {
    let greeting = read_line(tcp).await?;
    if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
        return Err(Error::Protocol(format!("unexpected greeting: {greeting}")));
    }
    tcp.write_all(b"m0 STARTTLS\r\n").await?;
    loop {
        let line = read_line(tcp).await?;
        if line.starts_with("m0 OK") {
            return Ok(());
        }
        if line.starts_with("m0 ") {
            return Err(Error::Protocol(format!("STARTTLS refused: {line}")));
        }
        // Untagged noise before the tagged reply is permitted.
    }
}

/// Reads one CRLF-terminated line, byte by byte. Only used for the two
/// lines of the STARTTLS exchange, where read-ahead buffering would
/// swallow TLS handshake bytes.
async fn read_line(tcp: &mut TcpStream) -> Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        tcp.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
        if line.len() > 8192 {
            return Err(Error::Protocol("greeting line too long".into()));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

struct SaslAuthenticator {
    response: String,
}

impl async_imap::Authenticator for SaslAuthenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

async fn authenticate(
    config: &ImapConfig,
    client: async_imap::Client<ImapStream>,
) -> Result<Session> {
    let Some(user) = config.user.as_deref() else {
        // No userinfo in the URL: try to proceed pre-authenticated.
        return client
            .login("", "")
            .await
            .map_err(|(err, _)| Error::Auth(err.to_string()));
    };
    let secret = config.password.clone().unwrap_or_default();

    match config.auth {
        AuthMethod::Plain => client
            .login(user, &secret)
            .await
            .map_err(|(err, _)| Error::Auth(err.to_string())),
        AuthMethod::OAuthBearer => {
            let token = access_token(config, &secret).await?;
            let auth = SaslAuthenticator {
                response: sasl::oauthbearer_response(user, &token),
            };
            client
                .authenticate("OAUTHBEARER", auth)
                .await
                .map_err(|(err, _)| Error::Auth(err.to_string()))
        }
        AuthMethod::XOAuth2 => {
            let token = access_token(config, &secret).await?;
            let auth = SaslAuthenticator {
                response: sasl::xoauth2_response(user, &token),
            };
            client
                .authenticate("XOAUTH2", auth)
                .await
                .map_err(|(err, _)| Error::Auth(err.to_string()))
        }
    }
}

/// With a token endpoint configured the URL secret is a refresh token to
/// exchange; without one it is the bearer token itself.
async fn access_token(config: &ImapConfig, secret: &str) -> Result<String> {
    if config.token.has_endpoint() {
        let token = TokenClient::new(config.token.clone())
            .refresh(secret)
            .await?;
        Ok(token.access_token)
    } else {
        Ok(secret.to_string())
    }
}
