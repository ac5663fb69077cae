//! WebSocket client connector.
//!
//! [`WsClient::builder`] configures the upgrade request and the TLS policy,
//! and [`WsClientBuilder::connect`] performs TCP connect, optional TLS, and
//! the opening handshake, returning a client-role [`Session`]. Register
//! handlers on the session and call [`Session::serve`] to start receiving.
//!
//! ```no_run
//! use sockframe::{Event, WsClient};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), sockframe::ClientError> {
//! let session = WsClient::builder()
//!     .path("/chat")
//!     .connect("127.0.0.1", 9000)
//!     .await?;
//! session.on(Event::Text, |conn, payload| async move {
//!     let _ = conn.send_text(payload).await;
//! });
//! session.serve();
//! # Ok(())
//! # }
//! ```

use std::{io, path::PathBuf, sync::Arc};

use log::{debug, error};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;

use crate::{
    codec::Role,
    handshake::{self, HandshakeError, RequestOptions},
    session::{HandlerTable, Session, SessionLimits},
    tls::{self, VerifyMode},
    transport::{MaybeTlsStream, RewindStream},
};

/// Errors surfaced by [`WsClientBuilder::connect`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connect, TLS setup, or request write failed.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// The SNI hostname is not a valid server name.
    #[error("invalid server name: {0}")]
    ServerName(String),

    /// The server's answer failed validation.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Entry point for outbound connections.
#[derive(Debug)]
pub struct WsClient;

impl WsClient {
    /// Start configuring a connection.
    #[must_use]
    pub fn builder() -> WsClientBuilder { WsClientBuilder::default() }
}

/// Options for an outbound connection.
#[derive(Debug, Default)]
pub struct WsClientBuilder {
    use_tls: bool,
    verify_mode: VerifyMode,
    sni: Option<String>,
    extra_roots: Vec<PathBuf>,
    options: RequestOptions,
    limits: SessionLimits,
}

impl WsClientBuilder {
    /// Wrap the connection in TLS.
    #[must_use]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.use_tls = enabled;
        self
    }

    /// Certificate verification policy. Defaults to [`VerifyMode::Full`].
    #[must_use]
    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    /// Override the SNI hostname. Defaults to the connect host.
    #[must_use]
    pub fn sni(mut self, hostname: impl Into<String>) -> Self {
        self.sni = Some(hostname.into());
        self
    }

    /// Trust additional PEM root certificates (for example a private CA).
    #[must_use]
    pub fn extra_root(mut self, pem_path: impl Into<PathBuf>) -> Self {
        self.extra_roots.push(pem_path.into());
        self
    }

    /// Request path, `/` by default.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.options.path = path.into();
        self
    }

    /// `Origin` header value.
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.options.origin = Some(origin.into());
        self
    }

    /// `User-Agent` header value.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.options.user_agent = user_agent.into();
        self
    }

    /// Append an extra request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .extra_headers
            .push((name.into(), value.into()));
        self
    }

    /// Cap a single inbound frame payload.
    ///
    /// Clamped to at least 125 bytes so control frames always fit.
    #[must_use]
    pub fn max_frame_payload(mut self, value: usize) -> Self {
        self.limits = self.limits.max_frame_payload(value);
        self
    }

    /// Cap a reassembled message.
    ///
    /// Clamped to at least 125 bytes.
    #[must_use]
    pub fn max_message(mut self, value: usize) -> Self {
        self.limits = self.limits.max_message(value);
        self
    }

    /// Connect, upgrade, and return a client-role session.
    ///
    /// The session is not serving yet; register handlers first, then call
    /// [`Session::serve`].
    ///
    /// # Errors
    ///
    /// Any transport, TLS, or handshake failure closes the socket and is
    /// returned to the caller.
    pub async fn connect(self, host: &str, port: u16) -> Result<Arc<Session>, ClientError> {
        let tcp = TcpStream::connect((host, port)).await?;
        let mut stream = if self.use_tls {
            let connector = tls::connector(self.verify_mode, &self.extra_roots)?;
            let sni = self.sni.clone().unwrap_or_else(|| host.to_owned());
            let server_name = ServerName::try_from(sni.clone())
                .map_err(|_| ClientError::ServerName(sni))?;
            let tls_stream = connector.connect(server_name, tcp).await?;
            MaybeTlsStream::ClientTls(Box::new(tls_stream))
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let key = handshake::generate_key();
        let request = handshake::client_request(host, port, &key, &self.options);
        stream.write_all(&request).await?;
        stream.flush().await?;

        match handshake::client_finish(&mut stream, &key).await {
            Ok(leftover) => {
                debug!("connected: host={host}, port={port}, tls={}", self.use_tls);
                Ok(Session::new(
                    RewindStream::new(leftover, stream),
                    Role::Client,
                    HandlerTable::new(),
                    self.limits,
                ))
            }
            Err(err) => {
                error!("handshake failed: error={err}, host={host}, port={port}");
                let _ = stream.shutdown().await;
                Err(err.into())
            }
        }
    }
}
