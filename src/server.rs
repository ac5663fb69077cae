//! Listening WebSocket acceptor.
//!
//! [`WsServer`] binds a TCP listener (optionally TLS-wrapped), accepts
//! connections in a loop with exponential backoff on accept failures, runs
//! the server-side handshake, and spawns one [`Session`] per connection.
//! Handlers registered on the server are the prototype table copied into
//! every accepted session, so applications can write
//! `server.on(Event::Text, |conn, payload| async move { .. })` once.
//!
//! Accept errors are logged and the loop continues; a handshake or TLS
//! failure closes that connection only. Shutdown is cooperative: `stop`
//! cancels the accept loop and stops every registered session, and the task
//! tracker drains before `run` returns.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, error, warn};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    select, signal,
    time::{Duration, sleep},
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::Role,
    handshake,
    registry::{ConnectionId, SessionRegistry},
    session::{Event, EventHandler, HandlerTable, Session, SessionLimits},
    tls::{self, TlsIdentity},
    transport::{MaybeTlsStream, RewindStream},
};

/// Errors raised while configuring or binding the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),

    /// Loading the TLS certificate or key failed.
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[source] io::Error),
}

/// Exponential backoff for the accept loop.
///
/// Starts at `initial_delay` after an `accept()` failure, doubles per
/// consecutive failure, and is capped at `max_delay`. A successful accept
/// resets the delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to at least 1 ms and ensure `initial_delay <= max_delay`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }
}

/// Configuration for [`WsServer::bind`].
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    /// Interface to bind, for example `127.0.0.1` or `0.0.0.0`.
    pub host: String,
    /// Port to listen on; `0` picks a free port.
    pub port: u16,
    /// Optional TLS identity; plain TCP when absent.
    pub tls: Option<TlsIdentity>,
    /// Accept-loop backoff tuning.
    pub backoff: BackoffConfig,
    /// Allocation caps installed into each accepted session.
    pub limits: SessionLimits,
}

impl WsServerConfig {
    /// Plain-TCP configuration for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            backoff: BackoffConfig::default(),
            limits: SessionLimits::default(),
        }
    }

    /// Enable TLS with a PEM certificate chain and private key.
    #[must_use]
    pub fn with_tls(mut self, identity: TlsIdentity) -> Self {
        self.tls = Some(identity);
        self
    }

    /// Cap a single inbound frame payload for accepted sessions.
    ///
    /// Clamped to at least 125 bytes so control frames always fit.
    #[must_use]
    pub fn max_frame_payload(mut self, value: usize) -> Self {
        self.limits = self.limits.max_frame_payload(value);
        self
    }

    /// Cap a reassembled message for accepted sessions.
    ///
    /// Clamped to at least 125 bytes.
    #[must_use]
    pub fn max_message(mut self, value: usize) -> Self {
        self.limits = self.limits.max_message(value);
        self
    }
}

/// A bound WebSocket server, not yet accepting.
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handlers: StdMutex<HandlerTable>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_id: AtomicU64,
    backoff: BackoffConfig,
    limits: SessionLimits,
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .field("next_id", &self.next_id)
            .field("backoff", &self.backoff)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl WsServer {
    /// Bind the listener and prepare the TLS acceptor.
    ///
    /// # Errors
    ///
    /// [`ServerError::TlsConfig`] if the PEM material cannot be loaded,
    /// [`ServerError::Bind`] if the listener cannot be bound.
    pub async fn bind(config: WsServerConfig) -> Result<Self, ServerError> {
        let tls = config
            .tls
            .as_ref()
            .map(tls::acceptor)
            .transpose()
            .map_err(ServerError::TlsConfig)?;

        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        Ok(Self {
            listener,
            local_addr,
            tls,
            handlers: StdMutex::new(HandlerTable::new()),
            registry: Arc::new(SessionRegistry::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_id: AtomicU64::new(1),
            backoff: config.backoff.normalized(),
            limits: config.limits,
        })
    }

    /// Address the listener is bound to. Useful with port `0`.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Register a prototype handler installed into each accepted session.
    ///
    /// Affects sessions accepted after the call; existing sessions keep the
    /// table they were created with.
    pub fn on<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(Arc<Session>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler =
            Arc::new(move |session, payload| handler(session, payload).boxed());
        lock_unpoisoned(&self.handlers)
            .entry(event)
            .or_default()
            .push(handler);
    }

    /// Snapshot of the live sessions accepted by this server.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> { self.registry.live() }

    /// Accept connections until Ctrl+C.
    pub async fn run(&self) {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await;
    }

    /// Accept connections until `shutdown` resolves or [`WsServer::stop`]
    /// is called, then stop every live session and drain spawned tasks.
    pub async fn run_with_shutdown<S>(&self, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut delay = self.backoff.initial_delay;

        loop {
            select! {
                biased;

                () = self.shutdown.cancelled() => break,
                () = &mut shutdown => {
                    self.shutdown.cancel();
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.spawn_connection(stream, peer_addr);
                        delay = self.backoff.initial_delay;
                    }
                    Err(err) => {
                        warn!(
                            "accept error: error={err}, local_addr={}",
                            self.local_addr
                        );
                        sleep(delay).await;
                        delay = (delay * 2).min(self.backoff.max_delay);
                    }
                },
            }
        }

        for session in self.registry.live() {
            session.stop().await;
        }
        self.registry.prune();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Stop accepting and terminate every live session.
    ///
    /// Idempotent; a concurrent `run` observes the cancellation, finishes
    /// its teardown, and returns.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        for session in self.registry.live() {
            session.stop().await;
        }
        self.registry.prune();
    }

    /// Spawn a tracked task handling one accepted connection, logging and
    /// discarding any panic so the accept loop survives.
    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let tls = self.tls.clone();
        let handlers = lock_unpoisoned(&self.handlers).clone();
        let id = ConnectionId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registry = Arc::clone(&self.registry);
        let server_shutdown = self.shutdown.clone();
        let limits = self.limits;

        self.tracker.spawn(async move {
            let connection = process_connection(
                stream,
                peer_addr,
                tls,
                handlers,
                limits,
                Arc::clone(&registry),
                id,
                server_shutdown,
            );
            if std::panic::AssertUnwindSafe(connection)
                .catch_unwind()
                .await
                .is_err()
            {
                error!("connection task panicked: peer_addr={peer_addr}");
            }
            registry.remove(id);
        });
    }
}

/// Handle one accepted connection: TLS accept, handshake, session lifetime.
#[expect(clippy::too_many_arguments, reason = "per-connection context is flat")]
async fn process_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handlers: HandlerTable,
    limits: SessionLimits,
    registry: Arc<SessionRegistry>,
    id: ConnectionId,
    server_shutdown: CancellationToken,
) {
    let mut stream = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => MaybeTlsStream::ServerTls(Box::new(stream)),
            Err(err) => {
                warn!("TLS accept failed: error={err}, peer_addr={peer_addr}");
                return;
            }
        },
        None => MaybeTlsStream::Plain(stream),
    };

    let leftover = match handshake::accept(&mut stream).await {
        Ok(leftover) => leftover,
        Err(err) => {
            warn!("handshake failed: error={err}, peer_addr={peer_addr}");
            return;
        }
    };

    let session = Session::new(
        RewindStream::new(leftover, stream),
        Role::Server,
        handlers,
        limits,
    );
    registry.insert(id, &session);
    debug!("session established: peer_addr={peer_addr}");
    session.serve();

    select! {
        () = session.closed() => {}
        () = server_shutdown.cancelled() => session.stop().await,
    }
    debug!("session ended: peer_addr={peer_addr}");
}

/// Lock a std mutex, recovering the guard if a panicking holder poisoned it.
fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
