//! HTTP/1.1 opening handshake (RFC 6455 Section 4).
//!
//! Both directions of the upgrade exchange live here: building and
//! validating the client request, and validating and answering it on the
//! server. The handshake runs on the raw stream before the framed layer is
//! established; any bytes read past the terminating blank line are returned
//! to the caller and replayed through
//! [`RewindStream`](crate::transport::RewindStream).
//!
//! # Client request
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Connection: Upgrade
//! Upgrade: websocket
//! Sec-WebSocket-Version: 13
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! ```
//!
//! # Server response
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use std::fmt::Write as _;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::debug;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// RFC 6455 magic GUID appended to the client key before hashing.
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket protocol version this crate speaks.
const WS_VERSION: &str = "13";

/// Cap on the total handshake head (request or response line plus headers).
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Read granularity while scanning for the blank line.
const READ_CHUNK: usize = 1024;

/// Failures during the opening handshake.
///
/// Handshake errors close the transport and surface to the caller of
/// `connect` or the acceptor; no session is created.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Transport failure mid-handshake.
    #[error("handshake I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed before completing its side of the exchange.
    #[error("peer closed during handshake")]
    UnexpectedEof,

    /// Head grew past [`MAX_HEAD_LEN`] without a terminating blank line.
    #[error("handshake head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    /// Request or status line was not parseable.
    #[error("malformed {0} line: {1:?}")]
    MalformedLine(&'static str, String),

    /// Client sent something other than an HTTP/1.1 GET upgrade.
    #[error("unsupported method: {0:?}")]
    UnsupportedMethod(String),

    /// Response used a protocol other than HTTP/1.1.
    #[error("unsupported HTTP version: {0:?}")]
    UnsupportedHttpVersion(String),

    /// Response status was not 101 Switching Protocols.
    #[error("expected 101 Switching Protocols, got {0}")]
    UnexpectedStatus(u16),

    /// A required header was absent.
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// A required header carried the wrong value.
    #[error("invalid {name} header: {value:?}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// Client asked for a WebSocket version other than 13.
    #[error("unsupported WebSocket version: {0:?}")]
    UnsupportedVersion(String),

    /// Server's Sec-WebSocket-Accept did not match the expected hash.
    #[error("Sec-WebSocket-Accept mismatch: expected {expected:?}, got {actual:?}")]
    AcceptMismatch {
        /// Hash derived from the key this client sent.
        expected: String,
        /// Value the server returned.
        actual: String,
    },
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// base64(SHA1(key + magic GUID)) per RFC 6455 Section 4.2.2. The server
/// emits this value and the client checks it for strict equality.
///
/// ```
/// assert_eq!(
///     sockframe::handshake::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
/// );
/// ```
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
#[must_use]
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Options shaping the client's upgrade request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Request path, `/` by default.
    pub path: String,
    /// Optional `Origin` header value.
    pub origin: Option<String>,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Additional header lines appended verbatim as `name: value`.
    pub extra_headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            origin: None,
            user_agent: concat!("sockframe/", env!("CARGO_PKG_VERSION")).to_owned(),
            extra_headers: Vec::new(),
        }
    }
}

/// Render the client upgrade request for `key`.
///
/// The `Host` header carries a port suffix unless the port is 80.
#[must_use]
pub fn client_request(host: &str, port: u16, key: &str, options: &RequestOptions) -> Vec<u8> {
    let host_header = if port == 80 {
        host.to_owned()
    } else {
        format!("{host}:{port}")
    };

    let mut request = String::with_capacity(256);
    let _ = write!(
        request,
        "GET {path} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: {WS_VERSION}\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Pragma: no-cache\r\n\
         Cache-Control: no-cache\r\n\
         User-Agent: {user_agent}\r\n",
        path = options.path,
        user_agent = options.user_agent,
    );
    if let Some(origin) = options.origin.as_deref().filter(|o| !o.is_empty()) {
        let _ = write!(request, "Origin: {origin}\r\n");
    }
    for (name, value) in &options.extra_headers {
        let _ = write!(request, "{name}: {value}\r\n");
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Parsed head of an HTTP message: the first line plus its headers.
#[derive(Debug)]
struct Head {
    first_line: String,
    headers: Vec<(String, String)>,
}

impl Head {
    /// Case-insensitive header lookup.
    fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read from `stream` until the blank line terminating an HTTP head.
///
/// Returns the parsed head and any bytes read past the blank line. The
/// leftover must be replayed before frame decoding starts: a peer may
/// legally pipeline its first frames behind the handshake bytes.
async fn read_head<S>(stream: &mut S) -> Result<(Head, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(end) = find_blank_line(&buf) {
            let leftover = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((parse_head(&buf)?, leftover));
        }
        if buf.len() >= MAX_HEAD_LEN {
            return Err(HandshakeError::HeadTooLarge);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Result<Head, HandshakeError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let first_line = lines
        .next()
        .ok_or_else(|| HandshakeError::MalformedLine("head", String::new()))?
        .to_owned();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Header lines without a colon are ignored rather than fatal.
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
    Ok(Head {
        first_line,
        headers,
    })
}

/// Validate the server's response to our upgrade request.
///
/// Returns leftover bytes to be replayed into the framed layer.
///
/// # Errors
///
/// Any deviation from a strict `HTTP/1.1 101` upgrade answer, including a
/// wrong accept hash, fails the handshake.
pub async fn client_finish<S>(stream: &mut S, key: &str) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let (head, leftover) = read_head(stream).await?;

    let mut parts = head.first_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();

    if version != "HTTP/1.1" {
        return Err(HandshakeError::UnsupportedHttpVersion(version.to_owned()));
    }
    let code: u16 = code.parse().map_err(|_| {
        HandshakeError::MalformedLine("status", head.first_line.clone())
    })?;
    if code != 101 || reason.is_empty() {
        return Err(HandshakeError::UnexpectedStatus(code));
    }

    let upgrade = head
        .get("Upgrade")
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidHeader {
            name: "Upgrade",
            value: upgrade.to_owned(),
        });
    }

    let connection = head
        .get("Connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(HandshakeError::InvalidHeader {
            name: "Connection",
            value: connection.to_owned(),
        });
    }

    let actual = head
        .get("Sec-WebSocket-Accept")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
    let expected = accept_key(key);
    if actual != expected {
        return Err(HandshakeError::AcceptMismatch {
            expected,
            actual: actual.to_owned(),
        });
    }

    debug!("client handshake complete: leftover={}", leftover.len());
    Ok(leftover)
}

/// Validate a client's upgrade request and answer it.
///
/// On success writes the `101 Switching Protocols` response and returns any
/// bytes the client pipelined behind its request. On validation failure a
/// `400 Bad Request` is written best-effort and the error is returned; the
/// caller closes the connection.
pub async fn accept<S>(stream: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_head(stream).await?;

    match validate_request(&head) {
        Ok(client_key) => {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 \r\n",
                accept_key(&client_key),
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            debug!("server handshake complete: leftover={}", leftover.len());
            Ok(leftover)
        }
        Err(err) => {
            let body = format!("Bad Request: {err}");
            let response = format!(
                "HTTP/1.1 400 Bad Request\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {body}",
                body.len(),
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;
            Err(err)
        }
    }
}

/// Check the request line and required upgrade headers, returning the
/// client's `Sec-WebSocket-Key`.
fn validate_request(head: &Head) -> Result<String, HandshakeError> {
    let mut parts = head.first_line.splitn(3, ' ');
    let method = parts.next().unwrap_or_default();
    let _path = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();

    if version.is_empty() {
        return Err(HandshakeError::MalformedLine(
            "request",
            head.first_line.clone(),
        ));
    }
    if !method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::UnsupportedMethod(method.to_owned()));
    }

    match head.get("Upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        Some(v) => {
            return Err(HandshakeError::InvalidHeader {
                name: "Upgrade",
                value: v.to_owned(),
            });
        }
        None => return Err(HandshakeError::MissingHeader("Upgrade")),
    }

    // The Connection header may carry several tokens (for example
    // "keep-alive, Upgrade"); an upgrade token anywhere satisfies it.
    match head.get("Connection") {
        Some(v) if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")) => {}
        Some(v) => {
            return Err(HandshakeError::InvalidHeader {
                name: "Connection",
                value: v.to_owned(),
            });
        }
        None => return Err(HandshakeError::MissingHeader("Connection")),
    }

    match head.get("Sec-WebSocket-Version") {
        Some(v) if v == WS_VERSION => {}
        Some(v) => return Err(HandshakeError::UnsupportedVersion(v.to_owned())),
        None => return Err(HandshakeError::MissingHeader("Sec-WebSocket-Version")),
    }

    head.get("Sec-WebSocket-Key")
        .map(str::to_owned)
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
        );
    }

    #[test]
    fn generated_keys_are_distinct_16_byte_nonces() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).expect("valid base64").len(), 16);
    }

    #[test]
    fn request_includes_required_lines() {
        let options = RequestOptions::default();
        let request = client_request("example.com", 9000, "KEY==", &options);
        let text = String::from_utf8(request).expect("ascii request");
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:9000\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: KEY==\r\n"));
        assert!(text.contains("Pragma: no-cache\r\n"));
        assert!(text.contains("Cache-Control: no-cache\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("Origin:"));
    }

    #[test]
    fn request_host_omits_default_port() {
        let request = client_request("example.com", 80, "KEY==", &RequestOptions::default());
        let text = String::from_utf8(request).expect("ascii request");
        assert!(text.contains("Host: example.com\r\n"));
        assert!(!text.contains("Host: example.com:80"));
    }

    #[test]
    fn request_carries_origin_and_extra_headers() {
        let options = RequestOptions {
            path: "/chat".to_owned(),
            origin: Some("http://example.com".to_owned()),
            extra_headers: vec![("X-Trace".to_owned(), "abc".to_owned())],
            ..RequestOptions::default()
        };
        let request = client_request("example.com", 9000, "KEY==", &options);
        let text = String::from_utf8(request).expect("ascii request");
        assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(text.contains("Origin: http://example.com\r\n"));
        assert!(text.contains("X-Trace: abc\r\n"));
    }

    fn response(head: &str) -> Cursor<Vec<u8>> {
        Cursor::new(format!("{head}\r\n\r\n").into_bytes())
    }

    #[tokio::test]
    async fn client_accepts_valid_response() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let mut stream = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
        );
        let leftover = client_finish(&mut stream, key).await.expect("valid upgrade");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn client_preserves_pipelined_bytes() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let mut bytes = b"HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
            .to_vec();
        bytes.extend_from_slice(&[0x81, 0x02, b'h', b'i']);
        let mut stream = Cursor::new(bytes);
        let leftover = client_finish(&mut stream, key).await.expect("valid upgrade");
        assert_eq!(leftover, [0x81, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn client_rejects_http_10() {
        let mut stream = response(
            "HTTP/1.0 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
        );
        let err = client_finish(&mut stream, "dGhlIHNhbXBsZSBub25jZQ==")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedHttpVersion(_)));
    }

    #[tokio::test]
    async fn client_rejects_non_101() {
        let mut stream = response("HTTP/1.1 403 Forbidden");
        let err = client_finish(&mut stream, "dGhlIHNhbXBsZSBub25jZQ==")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedStatus(403)));
    }

    #[tokio::test]
    async fn client_rejects_empty_reason_phrase() {
        let mut stream = response(
            "HTTP/1.1 101\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
        );
        let err = client_finish(&mut stream, "dGhlIHNhbXBsZSBub25jZQ==")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedStatus(101)));
    }

    #[tokio::test]
    async fn client_rejects_bad_accept_hash() {
        let mut stream = response(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: bm90LXRoZS1yaWdodC1oYXNo",
        );
        let err = client_finish(&mut stream, "dGhlIHNhbXBsZSBub25jZQ==")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::AcceptMismatch { .. }));
    }

    fn upgrade_request(extra: &str) -> Vec<u8> {
        format!(
            "GET /ws HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {extra}\r\n",
        )
        .into_bytes()
    }

    /// Read+Write test double: reads from one buffer, captures writes.
    struct Duplex {
        read: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl tokio::io::AsyncRead for Duplex {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.read).poll_read(cx, buf)
        }
    }

    impl tokio::io::AsyncWrite for Duplex {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.written.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn server_answers_valid_upgrade_with_101() {
        let mut stream = Duplex {
            read: Cursor::new(upgrade_request("")),
            written: Vec::new(),
        };
        let leftover = accept(&mut stream).await.expect("valid upgrade");
        assert!(leftover.is_empty());

        let response = String::from_utf8_lossy(&stream.written);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[tokio::test]
    async fn server_rejects_missing_key_with_400() {
        let request = "GET / HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n";
        let mut stream = Duplex {
            read: Cursor::new(request.as_bytes().to_vec()),
            written: Vec::new(),
        };
        let err = accept(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::MissingHeader("Sec-WebSocket-Key")
        ));
        let response = String::from_utf8_lossy(&stream.written);
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn server_rejects_wrong_version() {
        let request = "GET / HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 8\r\n\r\n";
        let mut stream = Duplex {
            read: Cursor::new(request.as_bytes().to_vec()),
            written: Vec::new(),
        };
        let err = accept(&mut stream).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedVersion(v) if v == "8"));
    }

    #[tokio::test]
    async fn server_rejects_non_get_method() {
        let request = "POST / HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n";
        let mut stream = Duplex {
            read: Cursor::new(request.as_bytes().to_vec()),
            written: Vec::new(),
        };
        let err = accept(&mut stream).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedMethod(m) if m == "POST"));
    }

    #[tokio::test]
    async fn server_accepts_multi_token_connection_header() {
        let request = "GET / HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n";
        let mut stream = Duplex {
            read: Cursor::new(request.as_bytes().to_vec()),
            written: Vec::new(),
        };
        accept(&mut stream).await.expect("multi-token Connection");
    }

    #[tokio::test]
    async fn server_preserves_pipelined_bytes() {
        let mut request = upgrade_request("");
        request.extend_from_slice(&[0x89, 0x80, 1, 2, 3, 4]);
        let mut stream = Duplex {
            read: Cursor::new(request),
            written: Vec::new(),
        };
        let leftover = accept(&mut stream).await.expect("valid upgrade");
        assert_eq!(leftover, [0x89, 0x80, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut junk = vec![b'A'; MAX_HEAD_LEN + 1];
        junk.extend_from_slice(b"\r\n");
        let mut stream = Cursor::new(junk);
        let err = client_finish(&mut stream, "KEY==").await.unwrap_err();
        assert!(matches!(err, HandshakeError::HeadTooLarge));
    }
}
