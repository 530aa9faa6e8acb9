//! One connection's worth of state and concurrent machinery.
//!
//! A session runs three cooperating tasks over its connection:
//!
//! ```text
//!   socket ──> reader ──decode──> recv queue ──> handler ──> on_message
//!   socket <── writer <─encode── send queue <── Session::send
//! ```
//!
//! Decode and delivery are separate tasks so a slow handler never stalls the
//! reader's deadline-based idle detection, and the decoder can emit bursts
//! bounded only by the receive queue capacity.
//!
//! Every task runs the same epilogue: panics become [`Error::Internal`],
//! terminal errors surface through [`Handler::on_error`] at most once, and
//! the task triggers [`Session::close`]. The first closer owns teardown: it
//! cancels the session token, waits for all three tasks, closes both queues
//! and fires [`Handler::on_disconnected`] exactly once.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;

use crate::attrs::{AttrKey, AttrMap};
use crate::codec::Codec;
use crate::config::IoConfig;
use crate::conn::{ByteStream, Conn, ConnReader, ConnWriter};
use crate::error::Error;
use crate::handler::Handler;
use crate::message::Message;

#[derive(Clone, Copy)]
enum LoopKind {
    Reader,
    Handler,
    Writer,
}

impl LoopKind {
    fn name(self) -> &'static str {
        match self {
            Self::Reader => "read",
            Self::Handler => "handle",
            Self::Writer => "write",
        }
    }

    /// Whether a terminal error from this loop is reported via `on_error`.
    /// A clean peer EOF is not an error, and the reader/writer stay quiet
    /// when the session was already closing under them.
    fn reports(self, session: &Session, err: &Error) -> bool {
        match self {
            Self::Reader => !session.is_closed() && !err.is_peer_closed(),
            Self::Writer => !session.is_closed(),
            Self::Handler => true,
        }
    }
}

/// A live connection plus its three-task pipeline.
///
/// Sessions are constructed by an engine (client or server) and shared as
/// `Arc<Session>`; handlers receive that same `Arc` in every hook.
pub struct Session {
    id: u64,
    conn: Conn,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    config: IoConfig,

    attrs: RwLock<AttrMap>,

    send_tx: Mutex<Option<mpsc::Sender<Box<dyn Message>>>>,
    send_rx: Mutex<Option<mpsc::Receiver<Box<dyn Message>>>>,
    recv_tx: Mutex<Option<mpsc::Sender<Box<dyn Message>>>>,
    recv_rx: Mutex<Option<mpsc::Receiver<Box<dyn Message>>>>,

    idle_count: AtomicU32,
    read_msg_count: AtomicU64,
    write_msg_count: AtomicU64,

    opened: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,

    cancel: CancellationToken,
    tasks: TaskTracker,
    /// Engine reference released after `on_disconnected` (server session
    /// accounting); clients pass `None`.
    guard: Mutex<Option<TaskTrackerToken>>,
}

impl Session {
    /// Wrap a freshly established stream. The session starts inert; nothing
    /// runs until [`Session::open`].
    pub fn new(
        id: u64,
        stream: Box<dyn ByteStream>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn Handler>,
        config: IoConfig,
        parent: &CancellationToken,
        guard: Option<TaskTrackerToken>,
    ) -> Arc<Self> {
        let conn = Conn::new(stream, config.read_timeout, config.write_timeout);
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_size.max(1));
        let (recv_tx, recv_rx) = mpsc::channel(config.recv_queue_size.max(1));

        Arc::new(Self {
            id,
            conn,
            codec,
            handler,
            config,
            attrs: RwLock::new(AttrMap::default()),
            send_tx: Mutex::new(Some(send_tx)),
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx: Mutex::new(Some(recv_tx)),
            recv_rx: Mutex::new(Some(recv_rx)),
            idle_count: AtomicU32::new(0),
            read_msg_count: AtomicU64::new(0),
            write_msg_count: AtomicU64::new(0),
            opened: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: parent.child_token(),
            tasks: TaskTracker::new(),
            guard: Mutex::new(guard),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Consecutive read-deadline expiries since the last decoded message.
    pub fn idle_count(&self) -> u32 {
        self.idle_count.load(Ordering::Relaxed)
    }

    pub fn read_msg_count(&self) -> u64 {
        self.read_msg_count.load(Ordering::Relaxed)
    }

    pub fn write_msg_count(&self) -> u64 {
        self.write_msg_count.load(Ordering::Relaxed)
    }

    /// A token cancelled when the session closes; handlers can tie the
    /// lifetime of their own tasks to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // Attribute bag.

    /// Cloned read of an attribute.
    pub fn attr<T>(&self, key: &AttrKey<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.attrs.read().get(key).cloned()
    }

    pub fn set_attr<T>(&self, key: &AttrKey<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.attrs.write().insert(key, value);
    }

    pub fn remove_attr<T>(&self, key: &AttrKey<T>) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.attrs.write().remove(key)
    }

    /// Mutate an attribute in place, inserting `init()` on first use. This
    /// is the codec-scratch workhorse: the value never leaves the bag.
    pub fn with_attr<T, R>(
        &self,
        key: &AttrKey<T>,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> R
    where
        T: Send + Sync + 'static,
    {
        f(self.attrs.write().get_or_insert_with(key, init))
    }

    /// Start the session: spawn the three tasks, mark connected, invoke the
    /// connect hook. Idempotent per instance; a second call is a no-op.
    ///
    /// If `on_connected` fails the session is closed and the hook error is
    /// returned.
    pub async fn open(self: &Arc<Self>) -> Result<(), Error> {
        if self
            .opened
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let Some((reader, writer)) = self.conn.split() else {
            return Err(Error::SessionClosed);
        };
        // A close racing this open may have emptied the slots already.
        let Some(send_rx) = self.send_rx.lock().take() else {
            return Err(Error::SessionClosed);
        };
        let Some(recv_rx) = self.recv_rx.lock().take() else {
            return Err(Error::SessionClosed);
        };
        let Some(recv_tx) = self.recv_tx.lock().take() else {
            return Err(Error::SessionClosed);
        };

        self.spawn_loop(LoopKind::Handler, Arc::clone(self).handle_loop(recv_rx));
        self.spawn_loop(LoopKind::Reader, Arc::clone(self).read_loop(reader, recv_tx));
        self.spawn_loop(LoopKind::Writer, Arc::clone(self).write_loop(writer, send_rx));
        self.connected.store(true, Ordering::Release);
        tracing::debug!(session_id = self.id, peer = ?self.peer_addr(), "session opened");

        if let Err(e) = self.handler.on_connected(self).await {
            tracing::debug!(session_id = self.id, err = %e, "connect hook rejected session");
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Close the session. Idempotent; the winning caller cancels the session
    /// token and a finalizer task waits for all three loops, closes both
    /// queues and the connection, fires `on_disconnected` exactly once, then
    /// releases the engine reference.
    pub fn close(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
        self.tasks.close();
        tracing::debug!(session_id = self.id, "session closing");

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.tasks.wait().await;

            *session.send_tx.lock() = None;
            *session.send_rx.lock() = None;
            *session.recv_tx.lock() = None;
            *session.recv_rx.lock() = None;
            session.conn.discard();

            session.handler.on_disconnected(&session).await;
            session.guard.lock().take();
        });
    }

    /// Enqueue an outbound message, waiting as long as it takes (subject to
    /// session close and caller cancellation).
    pub async fn send(&self, msg: Box<dyn Message>) -> Result<(), Error> {
        self.send_timeout(msg, Duration::ZERO).await
    }

    /// Enqueue an outbound message. The first of {enqueued, session closed,
    /// timeout} wins; a zero `timeout` waits indefinitely.
    pub async fn send_timeout(&self, msg: Box<dyn Message>, timeout: Duration) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let Some(tx) = self.send_tx.lock().clone() else {
            return Err(Error::SessionClosed);
        };

        if timeout.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::SessionClosed),
                res = tx.send(msg) => res.map_err(|_| Error::SessionClosed),
            }
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::SessionClosed),
                _ = tokio::time::sleep(timeout) => Err(Error::Timeout),
                res = tx.send(msg) => res.map_err(|_| Error::SessionClosed),
            }
        }
    }

    fn spawn_loop<F>(self: &Arc<Self>, kind: LoopKind, fut: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let session = Arc::clone(self);
        self.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            let err = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(Error::Internal(format!(
                    "panic in {} loop: {}",
                    kind.name(),
                    panic_message(payload.as_ref()),
                ))),
            };
            if let Some(err) = err {
                tracing::debug!(
                    session_id = session.id,
                    task = kind.name(),
                    err = %err,
                    "session task terminated with error"
                );
                if kind.reports(&session, &err) {
                    session.handler.on_error(&session, &err).await;
                }
            }
            session.close();
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: ConnReader,
        recv_tx: mpsc::Sender<Box<dyn Message>>,
    ) -> Result<(), Error> {
        loop {
            let decoded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = self.codec.decode(&self, &mut reader) => res,
            };

            match decoded {
                Ok(Some(msg)) => {
                    self.idle_count.store(0, Ordering::Relaxed);
                    self.read_msg_count.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        sent = recv_tx.send(msg) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                // Not enough bytes for a full frame yet.
                Ok(None) => {}
                Err(e) if e.is_timeout() => {
                    self.idle_count.fetch_add(1, Ordering::Relaxed);
                    self.handler.on_idle(&self).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_loop(
        self: Arc<Self>,
        mut recv_rx: mpsc::Receiver<Box<dyn Message>>,
    ) -> Result<(), Error> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                msg = recv_rx.recv() => match msg {
                    Some(m) => m,
                    None => return Ok(()),
                },
            };
            self.handler.on_message(&self, msg).await?;
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: ConnWriter,
        mut send_rx: mpsc::Receiver<Box<dyn Message>>,
    ) -> Result<(), Error> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                msg = send_rx.recv() => match msg {
                    Some(m) => m,
                    None => return Ok(()),
                },
            };
            // Cancellation must also unblock a write stalled on a peer that
            // stopped draining, or teardown would never finish.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = async {
                    let data = self.codec.encode(&self, msg).await?;
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                    Ok::<_, Error>(())
                } => res?,
            }
            self.write_msg_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {}: {} bytes / {} msgs in, {} bytes / {} msgs out",
            self.id,
            self.conn.bytes_read(),
            self.read_msg_count(),
            self.conn.bytes_written(),
            self.write_msg_count(),
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
