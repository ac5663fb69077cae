//! Shared helpers for integration tests: an echo server on a free port, a
//! raw-socket peer that speaks the handshake and frame wire format without
//! going through [`Session`], and timeout guards.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use sockframe::{
    Event, Frame, FrameCodec, Role, WsServer, WsServerConfig,
    handshake::{self, RequestOptions},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::codec::{Decoder, Encoder};

/// Guard a future with the one-second deadline the round-trip tests allow.
pub async fn within_a_second<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .expect("timed out after 1s")
}

/// Bind an echo server on a free localhost port and start accepting.
///
/// Text and binary messages are echoed back on the same session.
pub async fn spawn_echo_server() -> (Arc<WsServer>, SocketAddr) {
    let server = Arc::new(
        WsServer::bind(WsServerConfig::new("127.0.0.1", 0))
            .await
            .expect("bind echo server"),
    );
    server.on(Event::Text, |conn, payload| async move {
        let _ = conn.send_text(payload).await;
    });
    server.on(Event::Binary, |conn, payload| async move {
        let _ = conn.send_binary(payload).await;
    });

    let addr = server.local_addr();
    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner
            .run_with_shutdown(std::future::pending::<()>())
            .await;
    });
    (server, addr)
}

/// Connect a raw TCP socket and drive the upgrade handshake manually,
/// returning the stream positioned at the start of the frame protocol.
pub async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let key = handshake::generate_key();
    let request =
        handshake::client_request("127.0.0.1", addr.port(), &key, &RequestOptions::default());
    stream.write_all(&request).await.expect("write request");
    let leftover = handshake::client_finish(&mut stream, &key)
        .await
        .expect("upgrade accepted");
    assert!(leftover.is_empty(), "no frames expected before we send any");
    stream
}

/// Frame-level access to a raw stream, bypassing the session layer.
///
/// `role` is the role of THIS peer: it controls both outbound masking and
/// the masking expected on inbound frames.
pub struct RawPeer<S> {
    stream: S,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RawPeer<S> {
    pub fn new(stream: S, role: Role) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(role),
            buf: BytesMut::new(),
        }
    }

    /// Encode and write one frame, masked per this peer's role.
    pub async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out).expect("encode frame");
        self.stream.write_all(&out).await.expect("write frame");
    }

    /// Write raw bytes, for deliberately malformed traffic.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write bytes");
    }

    /// Read the next frame, or `None` once the peer closes the transport.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf).expect("decode frame") {
                return Some(frame);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.expect("read");
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read until the transport closes, asserting no further data frame
    /// arrives (control frames such as the peer's close are allowed).
    pub async fn expect_close(&mut self) {
        while let Some(frame) = self.next().await {
            assert!(
                frame.opcode.is_control(),
                "unexpected data frame before close: {frame:?}"
            );
        }
    }
}
