//! Server engine: an accept loop that survives transient failures and caps
//! concurrent connections, spawning one session per accepted stream.

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::Codec;
use crate::config::ServerConfig;
use crate::conn::ByteStream;
use crate::error::Error;
use crate::handler::Handler;
use crate::session::Session;

/// Backoff applied to consecutive transient accept failures.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Transport-side acceptor contract.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> io::Result<Box<dyn ByteStream>>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Accept failures worth retrying: the listener itself is still healthy, the
/// attempt just collided with a dying peer or resource pressure.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

struct ServerInner {
    config: ServerConfig,
    codec: Mutex<Option<Arc<dyn Codec>>>,
    handler: Mutex<Option<Arc<dyn Handler>>>,
    next_session_id: AtomicU64,
    cancel: CancellationToken,
    /// One token per live session, released after its `on_disconnected`.
    sessions: TaskTracker,
}

/// A connection-oriented server engine. Cheap to clone; clones share the
/// accept lifecycle and session accounting.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                codec: Mutex::new(None),
                handler: Mutex::new(None),
                next_session_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                sessions: TaskTracker::new(),
            }),
        }
    }

    /// Install the wire codec. Must happen before [`Server::serve`].
    pub fn set_codec(&self, codec: Arc<dyn Codec>) {
        *self.inner.codec.lock() = Some(codec);
    }

    /// Install the event handler. Must happen before [`Server::serve`].
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.inner.handler.lock() = Some(handler);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Live sessions (accepted, not yet disconnected).
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Run the accept loop until the engine is closed (returns
    /// [`Error::ServerClosed`]) or the listener fails permanently.
    ///
    /// Transient accept errors are retried with exponential backoff starting
    /// at 5 ms, doubling per consecutive failure, capped at 1 s and reset on
    /// the first success.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<(), Error> {
        let codec = self
            .inner
            .codec
            .lock()
            .clone()
            .expect("codec must be set before serving");
        let handler = self
            .inner
            .handler
            .lock()
            .clone()
            .expect("handler must be set before serving");

        let mut listener: Box<dyn Listener> = if self.inner.config.max_connections > 0 {
            Box::new(LimitListener::new(listener, self.inner.config.max_connections))
        } else {
            Box::new(listener)
        };

        let mut backoff = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(Error::ServerClosed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(stream) => {
                    backoff = Duration::ZERO;
                    self.spawn_session(stream, codec.clone(), handler.clone());
                }
                Err(err) if is_transient_accept_error(&err) => {
                    backoff = if backoff.is_zero() {
                        ACCEPT_BACKOFF_MIN
                    } else {
                        (backoff * 2).min(ACCEPT_BACKOFF_MAX)
                    };
                    tracing::warn!(err = %err, retry_in = ?backoff, "accept failed; backing off");
                    tokio::select! {
                        _ = self.inner.cancel.cancelled() => return Err(Error::ServerClosed),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(err) => {
                    tracing::error!(err = %err, "accept failed permanently");
                    return Err(err.into());
                }
            }
        }
    }

    fn spawn_session(
        &self,
        stream: Box<dyn ByteStream>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn Handler>,
    ) {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session::new(
            id,
            stream,
            codec,
            handler,
            self.inner.config.io.clone(),
            &self.inner.cancel,
            Some(self.inner.sessions.token()),
        );
        tracing::debug!(session_id = id, peer = ?session.peer_addr(), "connection accepted");

        tokio::spawn(async move {
            match AssertUnwindSafe(session.open()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(session_id = id, err = %err, "session rejected during open");
                }
                Err(payload) => {
                    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "non-string panic payload".to_string()
                    };
                    tracing::error!(session_id = id, panic = %msg, "panic while opening session");
                    session.close();
                }
            }
        });
    }

    /// Shut the engine down: stop accepting, cancel every session, and wait
    /// until all of them have fired `on_disconnected`. Idempotent.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.sessions.close();
        self.inner.sessions.wait().await;
    }
}

/// Listener decorator enforcing a concurrent-connection ceiling. Each
/// accepted stream carries a semaphore permit that is released when the
/// stream drops, unblocking the next accept.
pub struct LimitListener<L> {
    inner: L,
    permits: Arc<Semaphore>,
}

impl<L: Listener> LimitListener<L> {
    pub fn new(inner: L, max_connections: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_connections)),
        }
    }
}

#[async_trait]
impl<L: Listener> Listener for LimitListener<L> {
    async fn accept(&mut self) -> io::Result<Box<dyn ByteStream>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("connection semaphore is never closed");
        let stream = self.inner.accept().await?;
        Ok(Box::new(PermitStream {
            stream,
            _permit: permit,
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}

/// An accepted stream holding its connection permit.
struct PermitStream {
    stream: Box<dyn ByteStream>,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for PermitStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PermitStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl ByteStream for PermitStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr()
    }
}
