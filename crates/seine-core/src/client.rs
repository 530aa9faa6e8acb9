//! Client engine: one session at a time, lazy reconnect, and an RPC-style
//! request/response overlay on the message stream.
//!
//! The engine is its own session handler. Inbound messages that report a
//! `response_id` matching an outstanding call settle that call; everything
//! else is forwarded to the user handler. When the session dies, every
//! outstanding call is settled with the captured session error so callers
//! never wait on a dead connection.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::conn::ByteStream;
use crate::error::Error;
use crate::handler::Handler;
use crate::message::{Message, Request};
use crate::session::Session;

/// Future returned by a [`DialFn`].
pub type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<Box<dyn ByteStream>>> + Send>>;

/// Transport-side connector: resolves an address to a live byte stream.
pub type DialFn = Arc<dyn Fn(String) -> DialFuture + Send + Sync>;

type CallReply = Result<Box<dyn Message>, Error>;

struct ClientState {
    remote_addr: String,
    session: Option<Arc<Session>>,
    session_error: Option<Error>,
    closed: bool,
}

struct ClientInner {
    config: ClientConfig,
    dial: DialFn,
    codec: Mutex<Option<Arc<dyn Codec>>>,
    user_handler: Mutex<Option<Arc<dyn Handler>>>,
    state: Mutex<ClientState>,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallReply>>>,
    /// Serializes dial attempts so at most one session is ever current.
    connect_lock: tokio::sync::Mutex<()>,
    next_session_id: AtomicU64,
    cancel: CancellationToken,
}

/// A connection-oriented client engine. Cheap to clone; all clones share the
/// same session, correlation table and lifecycle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(dial: DialFn, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                dial,
                codec: Mutex::new(None),
                user_handler: Mutex::new(None),
                state: Mutex::new(ClientState {
                    remote_addr: String::new(),
                    session: None,
                    session_error: None,
                    closed: false,
                }),
                pending: Mutex::new(HashMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                next_session_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Install the wire codec. Must happen before [`Client::dial`].
    pub fn set_codec(&self, codec: Arc<dyn Codec>) {
        *self.inner.codec.lock() = Some(codec);
    }

    /// Install the user event handler. Optional; without one, non-response
    /// messages are dropped.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.inner.user_handler.lock() = Some(handler);
    }

    /// Record the remote address and connect synchronously.
    pub async fn dial(&self, addr: impl Into<String>) -> Result<(), Error> {
        self.inner.state.lock().remote_addr = addr.into();
        self.ensure_connected(true).await
    }

    /// Close the engine: the current session (if any) is closed, pending
    /// calls settle, and every later operation fails with
    /// [`Error::ClientClosed`]. Idempotent.
    pub fn close(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.session.take()
        };
        if let Some(session) = session {
            session.close();
        }
        self.inner.cancel.cancel();
    }

    /// Force the current session closed, surfacing [`Error::Disconnected`]
    /// to handlers and pending calls. The engine stays open and may
    /// reconnect on the next `send`/`call`.
    pub async fn disconnect(&self) {
        let session = self.inner.state.lock().session.clone();
        if let Some(session) = session {
            self.inner.on_error(&session, &Error::Disconnected).await;
            session.close();
        }
    }

    /// The current session, if one is established.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.state.lock().session.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Outstanding calls in the correlation table (diagnostics).
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Fire-and-forget send, waiting for queue space as long as it takes.
    pub async fn send(&self, msg: Box<dyn Message>) -> Result<(), Error> {
        self.send_timeout(msg, Duration::ZERO).await
    }

    /// Fire-and-forget send with an enqueue deadline (zero waits forever).
    pub async fn send_timeout(&self, msg: Box<dyn Message>, timeout: Duration) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.ensure_connected(false).await?;
        let session = self.session().ok_or(Error::Disconnected)?;
        session.send_timeout(msg, timeout).await
    }

    /// Issue a request and wait for its response, with no deadline.
    pub async fn call(&self, req: Box<dyn Request>) -> Result<Box<dyn Message>, Error> {
        self.call_timeout(req, Duration::ZERO).await
    }

    /// Issue a request and wait for the first of {response, session error,
    /// engine close, timeout}. A zero `timeout` waits indefinitely. The
    /// correlation entry is registered before the request is sent, so a
    /// response racing the send still finds it; the entry is removed on
    /// every exit path.
    pub async fn call_timeout(
        &self,
        req: Box<dyn Request>,
        timeout: Duration,
    ) -> Result<Box<dyn Message>, Error> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.ensure_connected(false).await?;
        let session = self.session().ok_or(Error::Disconnected)?;

        let id = req.id();
        let (tx, mut rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let mut guard = PendingGuard {
            inner: &self.inner,
            id,
            armed: true,
        };

        let started = Instant::now();
        session.send_timeout(req, timeout).await?;

        let reply = if timeout.is_zero() {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => Err(Error::ClientClosed),
                reply = &mut rx => reply.unwrap_or(Err(Error::ClientClosed)),
            }
        } else {
            let remaining = timeout.saturating_sub(started.elapsed());
            tokio::select! {
                _ = self.inner.cancel.cancelled() => Err(Error::ClientClosed),
                reply = &mut rx => reply.unwrap_or(Err(Error::ClientClosed)),
                _ = tokio::time::sleep(remaining) => Err(Error::Timeout),
            }
        };

        // The oneshot resolved only if the demux (or settlement) already
        // removed the entry; disarming then keeps the guard from touching a
        // reused id. Timeout and engine-close paths leave the guard armed.
        if !matches!(reply, Err(Error::Timeout) | Err(Error::ClientClosed)) {
            guard.disarm();
        }
        reply
    }

    /// Connect if needed. `force` is the dial path; the lazy path refuses
    /// unless auto-reconnect is configured.
    async fn ensure_connected(&self, force: bool) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        let _connecting = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        if !force && !self.inner.config.auto_reconnect {
            return Err(Error::Disconnected);
        }

        let addr = self.inner.state.lock().remote_addr.clone();
        let codec = self
            .inner
            .codec
            .lock()
            .clone()
            .expect("codec must be set before dialing");

        let stream = (self.inner.dial)(addr.clone()).await?;
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handler: Arc<dyn Handler> = self.inner.clone();
        let session = Session::new(
            id,
            stream,
            codec,
            handler,
            self.inner.config.io.clone(),
            &self.inner.cancel,
            None,
        );
        tracing::debug!(session_id = id, addr = %addr, "client session dialing");
        session.open().await
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Swap the correlation table for an empty one and deliver the captured
    /// session error (or a generic close) to every waiter.
    fn settle_pending(&self) {
        let drained: HashMap<_, _> = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return;
        }
        let err = self
            .state
            .lock()
            .session_error
            .clone()
            .unwrap_or(Error::ClientClosed);
        tracing::debug!(count = drained.len(), err = %err, "settling pending calls");
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn user_handler(&self) -> Option<Arc<dyn Handler>> {
        self.user_handler.lock().clone()
    }
}

#[async_trait]
impl Handler for ClientInner {
    async fn on_connected(&self, session: &Arc<Session>) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            state.session = Some(session.clone());
            state.session_error = None;
        }
        match self.user_handler() {
            Some(h) => h.on_connected(session).await,
            None => Ok(()),
        }
    }

    async fn on_disconnected(&self, session: &Arc<Session>) {
        if self.is_closed() {
            return;
        }
        self.settle_pending();
        {
            // Drop the engine's reference to the dead session; this also
            // breaks the handler/session reference cycle.
            let mut state = self.state.lock();
            if state
                .session
                .as_ref()
                .is_some_and(|current| current.id() == session.id())
            {
                state.session = None;
            }
        }
        if let Some(h) = self.user_handler() {
            h.on_disconnected(session).await;
        }
    }

    async fn on_idle(&self, session: &Arc<Session>) -> Result<(), Error> {
        match self.user_handler() {
            Some(h) => h.on_idle(session).await,
            None => Ok(()),
        }
    }

    async fn on_error(&self, session: &Arc<Session>, err: &Error) {
        self.state.lock().session_error = Some(err.clone());
        if let Some(h) = self.user_handler() {
            h.on_error(session, err).await;
        }
    }

    async fn on_message(&self, session: &Arc<Session>, msg: Box<dyn Message>) -> Result<(), Error> {
        if let Some(id) = msg.response_id() {
            let waiter = self.pending.lock().remove(&id);
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(msg));
                return Ok(());
            }
            // Late response (or server push reusing the shape): fall through
            // to the user handler.
        }
        match self.user_handler() {
            Some(h) => h.on_message(session, msg).await,
            None => Ok(()),
        }
    }
}

/// Removes the correlation entry when a call unwinds without a delivered
/// reply (timeout, engine close, send failure, caller drop).
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.pending.lock().remove(&self.id).is_some() {
            tracing::debug!(call_id = self.id, "removed unsettled pending call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_dialer() -> DialFn {
        Arc::new(|_addr: String| -> DialFuture {
            Box::pin(async { Err(std::io::Error::other("no network")) })
        })
    }

    #[test]
    fn pending_guard_removes_only_when_armed() {
        let client = Client::new(failing_dialer(), ClientConfig::default());

        let (tx, _rx) = oneshot::channel();
        client.inner.pending.lock().insert(9, tx);
        {
            let _guard = PendingGuard {
                inner: &client.inner,
                id: 9,
                armed: true,
            };
        }
        assert_eq!(client.pending_calls(), 0);

        let (tx, _rx) = oneshot::channel();
        client.inner.pending.lock().insert(9, tx);
        {
            let mut guard = PendingGuard {
                inner: &client.inner,
                id: 9,
                armed: true,
            };
            guard.disarm();
        }
        assert_eq!(client.pending_calls(), 1);
    }

    #[tokio::test]
    async fn operations_after_close_fail_fast() {
        let client = Client::new(failing_dialer(), ClientConfig::default());
        client.close();
        client.close();

        assert!(client.is_closed());
        assert!(matches!(
            client.dial("127.0.0.1:1").await,
            Err(Error::ClientClosed)
        ));
    }

    #[tokio::test]
    async fn send_without_auto_reconnect_is_disconnected() {
        let client = Client::new(failing_dialer(), ClientConfig::default());
        // Never dialed; lazy path must refuse rather than dial.
        struct Noop;
        impl Message for Noop {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        let err = client.send(Box::new(Noop)).await.unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn settle_uses_captured_session_error() {
        let client = Client::new(failing_dialer(), ClientConfig::default());
        client.inner.state.lock().session_error = Some(Error::Disconnected);

        let (tx, rx) = oneshot::channel();
        client.inner.pending.lock().insert(1, tx);
        client.inner.settle_pending();

        assert_eq!(client.pending_calls(), 0);
        assert!(matches!(rx.await.unwrap(), Err(Error::Disconnected)));
    }
}
