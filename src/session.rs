//! Per-connection WebSocket session.
//!
//! A [`Session`] wraps a transport after a successful handshake. One reader
//! task (started by [`Session::serve`]) decodes frames, enforces the
//! fragmentation rules, reassembles messages, and dispatches them to
//! registered handlers. Writes may come from any task, including handlers
//! running inside the reader; a per-session mutex around the write half
//! keeps frame bytes from interleaving on the wire.
//!
//! The session answers pings and the peer's close automatically after user
//! handlers have run. Shutdown is cooperative: [`Session::stop`] cancels the
//! session token and closes the transport, and the reader observes the
//! cancellation rather than being killed.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use futures::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
};
use log::{debug, error, warn};
use thiserror::Error;
use tokio::{select, sync::Mutex, task::JoinHandle};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    codec::{DEFAULT_MAX_PAYLOAD, FrameCodec, ProtocolError, Role},
    frame::{Frame, MAX_CONTROL_PAYLOAD, Opcode, close_code, close_codes},
    transport::WsStream,
};

/// Cap on a reassembled message (16 MiB), bounding fragment buffering.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Allocation caps for one session.
///
/// `max_frame_payload` bounds a single frame on the wire and is enforced by
/// the codec before the payload is read; `max_message` bounds the
/// reassembled message delivered to handlers. Both are configured through
/// [`WsServerConfig`](crate::server::WsServerConfig) and
/// [`WsClientBuilder`](crate::client::WsClientBuilder).
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Largest single frame payload accepted.
    pub max_frame_payload: usize,
    /// Largest reassembled message delivered to handlers.
    pub max_message: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            max_message: DEFAULT_MAX_MESSAGE,
        }
    }
}

impl SessionLimits {
    /// Cap a single frame payload.
    ///
    /// Clamped to at least 125 bytes so control frames always fit.
    #[must_use]
    pub fn max_frame_payload(mut self, value: usize) -> Self {
        self.max_frame_payload = value.max(MAX_CONTROL_PAYLOAD);
        self
    }

    /// Cap a reassembled message.
    ///
    /// Clamped to at least 125 bytes.
    #[must_use]
    pub fn max_message(mut self, value: usize) -> Self {
        self.max_message = value.max(MAX_CONTROL_PAYLOAD);
        self
    }
}

/// Events a session dispatches to registered handlers.
///
/// Continuation frames never surface as events; they are folded into the
/// in-progress message and delivered under its original opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A complete text message. Delivered as raw bytes; UTF-8 decoding is
    /// the handler's concern.
    Text,
    /// A complete binary message.
    Binary,
    /// The peer sent a close frame. Payload is the raw close body.
    Close,
    /// A ping; the session pongs automatically after handlers run.
    Ping,
    /// A pong.
    Pong,
}

/// Boxed asynchronous event callback.
pub type EventHandler = Arc<dyn Fn(Arc<Session>, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler lists keyed by event, in registration order.
pub(crate) type HandlerTable = HashMap<Event, Vec<EventHandler>>;

/// Errors surfaced to callers of [`Session::send_frame`].
///
/// Argument errors leave the connection open; transport errors mean the
/// connection is gone.
#[derive(Debug, Error)]
pub enum SendError {
    /// Control frame payload exceeded 125 bytes.
    #[error("control frame payload too large: {0} bytes (max {MAX_CONTROL_PAYLOAD})")]
    ControlPayloadTooLarge(usize),

    /// Control frames must be sent as a single final frame.
    #[error("control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// The session already closed its transport.
    #[error("session is closed")]
    Closed,

    /// Writing the frame failed.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),
}

type Writer = SplitSink<Framed<WsStream, FrameCodec>, Frame>;
type Reader = SplitStream<Framed<WsStream, FrameCodec>>;

/// Reassembly progress for the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentState {
    /// No fragmented message in flight.
    Idle,
    /// Mid-message; the opcode the first fragment carried.
    InMessage(Opcode),
}

/// Whether the reader loop keeps going after a frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One WebSocket connection after the handshake.
pub struct Session {
    /// Self-reference handed to handlers so they can send and stop.
    weak: Weak<Session>,
    role: Role,
    peer_addr: Option<SocketAddr>,
    handlers: StdMutex<HandlerTable>,
    writer: Mutex<Option<Writer>>,
    reader: StdMutex<Option<Reader>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    /// Set once this side has sent a close frame.
    closing: AtomicBool,
    shutdown: CancellationToken,
    max_message: usize,
}

impl Session {
    /// Wrap a handshaken stream in a session for `role`.
    ///
    /// Handlers registered through [`Session::on`] (or seeded via
    /// `handlers`) see no traffic until [`Session::serve`] starts the
    /// reader; registration and serving are deliberately separate steps.
    pub(crate) fn new(
        stream: WsStream,
        role: Role,
        handlers: HandlerTable,
        limits: SessionLimits,
    ) -> Arc<Self> {
        let peer_addr = stream.get_ref().peer_addr().ok();
        let codec = FrameCodec::new(role).max_payload(limits.max_frame_payload);
        let framed = Framed::new(stream, codec);
        let (writer, reader) = framed.split();
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            role,
            peer_addr,
            handlers: StdMutex::new(handlers),
            writer: Mutex::new(Some(writer)),
            reader: StdMutex::new(Some(reader)),
            reader_task: StdMutex::new(None),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            max_message: limits.max_message,
        })
    }

    /// Role this session was established with.
    #[must_use]
    pub fn role(&self) -> Role { self.role }

    /// Remote peer address, if it could be determined.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer_addr }

    /// Register a handler for `event`, appended after existing handlers.
    ///
    /// Safe to call at any time, including from inside another handler;
    /// dispatch snapshots the handler list before invoking it.
    pub fn on<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |session, payload| {
            handler(session, payload).boxed()
        });
        lock_unpoisoned(&self.handlers)
            .entry(event)
            .or_default()
            .push(handler);
    }

    /// Encode and transmit one frame.
    ///
    /// The FIN bit is set when `last_frame` is true (control frames are
    /// always final); the wire opcode is `opcode` for the first frame of a
    /// message and `Continuation` afterwards. Sending a close frame marks
    /// the session as closing, which suppresses the automatic reply when
    /// the peer's close arrives.
    ///
    /// # Errors
    ///
    /// Argument violations ([`SendError::ControlPayloadTooLarge`],
    /// [`SendError::FragmentedControlFrame`]) are reported without touching
    /// the transport; the connection remains usable.
    pub async fn send_frame(
        &self,
        opcode: Opcode,
        payload: impl Into<Bytes>,
        first_frame: bool,
        last_frame: bool,
    ) -> Result<(), SendError> {
        let payload = payload.into();
        if opcode.is_control() {
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(SendError::ControlPayloadTooLarge(payload.len()));
            }
            if !(first_frame && last_frame) {
                return Err(SendError::FragmentedControlFrame);
            }
        }
        if opcode == Opcode::Close {
            self.closing.store(true, Ordering::SeqCst);
        }

        let frame = Frame {
            fin: last_frame || opcode.is_control(),
            opcode: if first_frame {
                opcode
            } else {
                Opcode::Continuation
            },
            payload,
        };
        self.write(frame).await
    }

    /// Send a single-frame text message.
    pub async fn send_text(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_frame(Opcode::Text, payload, true, true).await
    }

    /// Send a single-frame binary message.
    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_frame(Opcode::Binary, payload, true, true).await
    }

    /// Send a ping.
    pub async fn send_ping(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_frame(Opcode::Ping, payload, true, true).await
    }

    /// Send a close frame with an optional status code and reason.
    pub async fn send_close(
        &self,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> Result<(), SendError> {
        let frame = Frame::close(code, reason);
        self.send_frame(Opcode::Close, frame.payload, true, true)
            .await
    }

    /// Start the reader task. Idempotent; a second call does nothing.
    pub fn serve(&self) {
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let Some(reader) = lock_unpoisoned(&self.reader).take() else {
            return;
        };
        let task = tokio::spawn(reader_loop(session, reader));
        *lock_unpoisoned(&self.reader_task) = Some(task);
    }

    /// True while the reader task is live and the transport is open.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        !self.shutdown.is_cancelled()
            && lock_unpoisoned(&self.reader_task)
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Close the transport and let the reader task wind down.
    ///
    /// Idempotent. In-flight [`Session::send_frame`] calls on other tasks
    /// may observe [`SendError::Closed`] or a transport error.
    pub async fn stop(&self) { self.finish().await; }

    /// Wait until the session has terminated (either side closing, a
    /// protocol violation, a transport error, or [`Session::stop`]).
    pub async fn closed(&self) { self.shutdown.cancelled().await; }

    async fn write(&self, frame: Frame) -> Result<(), SendError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SendError::Closed);
        };
        writer.send(frame).await.map_err(|err| match err {
            ProtocolError::ControlFrameTooLarge(len) => SendError::ControlPayloadTooLarge(len),
            ProtocolError::FragmentedControlFrame => SendError::FragmentedControlFrame,
            other => SendError::Transport(other.into()),
        })
    }

    /// Invoke every handler registered for `event`, in registration order.
    ///
    /// The handler list is snapshotted first so handlers may register
    /// further handlers. A panicking handler is logged and skipped rather
    /// than tearing down the reader task.
    async fn dispatch(&self, event: Event, payload: Bytes) {
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let snapshot: Vec<EventHandler> = lock_unpoisoned(&self.handlers)
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for handler in snapshot {
            let invocation =
                std::panic::AssertUnwindSafe(handler(Arc::clone(&session), payload.clone()))
                    .catch_unwind();
            if invocation.await.is_err() {
                error!(
                    "handler panicked: event={event:?}, peer_addr={:?}",
                    self.peer_addr
                );
            }
        }
    }

    /// Log a violation and attempt a close with code 1002 before the
    /// transport goes away.
    async fn protocol_violation(&self, detail: &str) {
        error!(
            "protocol violation: detail={detail}, peer_addr={:?}",
            self.peer_addr
        );
        let close = Frame::close(Some(close_codes::PROTOCOL_ERROR), Some("protocol error"));
        self.closing.store(true, Ordering::SeqCst);
        if let Err(err) = self.write(close).await {
            debug!(
                "close after violation failed: error={err}, peer_addr={:?}",
                self.peer_addr
            );
        }
    }

    /// Cancel the session and close the transport. Terminal and idempotent.
    async fn finish(&self) {
        self.shutdown.cancel();
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(err) = writer.close().await {
                debug!(
                    "transport close failed: error={err}, peer_addr={:?}",
                    self.peer_addr
                );
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        fragment: &mut FragmentState,
        message: &mut BytesMut,
    ) -> Flow {
        match frame.opcode {
            Opcode::Ping => {
                self.dispatch(Event::Ping, frame.payload.clone()).await;
                if let Err(err) = self.send_frame(Opcode::Pong, frame.payload, true, true).await {
                    warn!(
                        "pong failed: error={err}, peer_addr={:?}",
                        self.peer_addr
                    );
                    return Flow::Stop;
                }
                Flow::Continue
            }

            Opcode::Pong => {
                self.dispatch(Event::Pong, frame.payload).await;
                Flow::Continue
            }

            Opcode::Close => {
                self.dispatch(Event::Close, frame.payload.clone()).await;
                // Reply exactly once, unless this side initiated the close
                // handshake. The peer may already be gone, so send errors
                // are swallowed.
                if !self.closing.swap(true, Ordering::SeqCst) {
                    let reply = Frame::close(close_code(&frame.payload), None);
                    if let Err(err) = self.write(reply).await {
                        debug!(
                            "close reply failed: error={err}, peer_addr={:?}",
                            self.peer_addr
                        );
                    }
                }
                Flow::Stop
            }

            Opcode::Text | Opcode::Binary => {
                if *fragment != FragmentState::Idle {
                    self.protocol_violation("data frame interleaved within a fragmented message")
                        .await;
                    return Flow::Stop;
                }
                self.accumulate(frame.opcode, frame, fragment, message).await
            }

            Opcode::Continuation => {
                let FragmentState::InMessage(opcode) = *fragment else {
                    self.protocol_violation("continuation frame without a message in progress")
                        .await;
                    return Flow::Stop;
                };
                self.accumulate(opcode, frame, fragment, message).await
            }
        }
    }

    /// Fold a data frame into the in-progress message, dispatching once the
    /// final fragment lands. `effective` is the opcode the message was
    /// opened with, preserved across continuations.
    async fn accumulate(
        &self,
        effective: Opcode,
        frame: Frame,
        fragment: &mut FragmentState,
        message: &mut BytesMut,
    ) -> Flow {
        if message.len() + frame.payload.len() > self.max_message {
            self.protocol_violation("reassembled message exceeds maximum size")
                .await;
            return Flow::Stop;
        }

        let event = match effective {
            Opcode::Text => Event::Text,
            _ => Event::Binary,
        };

        if frame.fin && message.is_empty() {
            // Unfragmented message: dispatch without copying.
            *fragment = FragmentState::Idle;
            self.dispatch(event, frame.payload).await;
            return Flow::Continue;
        }

        message.extend_from_slice(&frame.payload);
        if frame.fin {
            *fragment = FragmentState::Idle;
            let payload = message.split().freeze();
            self.dispatch(event, payload).await;
        } else {
            *fragment = FragmentState::InMessage(effective);
        }
        Flow::Continue
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("closing", &self.closing.load(Ordering::SeqCst))
            .field("serving", &self.is_serving())
            .finish_non_exhaustive()
    }
}

/// Frame pump for one connection.
///
/// Runs until the peer closes, a protocol or transport error occurs, or the
/// session token is cancelled; always closes the transport on the way out.
async fn reader_loop(session: Arc<Session>, mut reader: Reader) {
    let mut fragment = FragmentState::Idle;
    let mut message = BytesMut::new();

    loop {
        let next = select! {
            biased;

            () = session.shutdown.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            None => {
                debug!(
                    "peer closed connection: peer_addr={:?}",
                    session.peer_addr()
                );
                break;
            }
            Some(Err(ProtocolError::Io(err))) => {
                error!(
                    "transport error in reader: error={err}, peer_addr={:?}",
                    session.peer_addr()
                );
                break;
            }
            Some(Err(err)) => {
                session.protocol_violation(&err.to_string()).await;
                break;
            }
            Some(Ok(frame)) => {
                if session
                    .handle_frame(frame, &mut fragment, &mut message)
                    .await
                    == Flow::Stop
                {
                    break;
                }
            }
        }
    }

    session.finish().await;
}

/// Lock a std mutex, recovering the guard if a panicking holder poisoned it.
fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
