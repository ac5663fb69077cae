//! Public API for the `sockframe` library.
//!
//! This crate is a self-contained WebSocket protocol engine (RFC 6455) for
//! Tokio: the HTTP/1.1 opening handshake in both directions, the base frame
//! codec with role-dependent masking, per-connection sessions with automatic
//! pong and close handling, and a listening acceptor that spawns one session
//! per accepted connection. Protocol extensions and subprotocol negotiation
//! are out of scope.

pub mod client;
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

pub use client::{ClientError, WsClient, WsClientBuilder};
pub use codec::{FrameCodec, ProtocolError, Role};
pub use frame::{Frame, Opcode};
pub use registry::{ConnectionId, SessionRegistry};
pub use server::{BackoffConfig, ServerError, WsServer, WsServerConfig};
pub use session::{Event, SendError, Session, SessionLimits};
pub use tls::{TlsIdentity, VerifyMode};
