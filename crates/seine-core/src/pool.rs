//! Bounded client pool with idle reuse and fair blocking acquisition.
//!
//! Idle clients sit in a bounded free-list; `get` prefers reuse, then
//! construction up to the live ceiling, then blocks fairly until a handle is
//! returned. Acquisition failures are carried inside the returned handle (a
//! sentinel whose every operation reports the captured error), so call sites
//! have a single error path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::PoolConfig;
use crate::error::Error;
use crate::message::{Message, Request};

/// Produces connected [`Client`]s for the pool.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    async fn new_client(&self) -> Result<Client, Error>;
}

struct PoolState {
    live: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ClientFactory>,
    free_tx: mpsc::Sender<Client>,
    /// Single consumer behind a fair async mutex: blocked `get`s are served
    /// in arrival order.
    free_rx: tokio::sync::Mutex<mpsc::Receiver<Client>>,
    state: Mutex<PoolState>,
    cancel: CancellationToken,
}

/// A bounded collection of client engines. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(factory: Arc<dyn ClientFactory>, config: PoolConfig) -> Self {
        let config = config.normalized();
        let (free_tx, free_rx) = mpsc::channel(config.idle_max.max(1));
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                free_tx,
                free_rx: tokio::sync::Mutex::new(free_rx),
                state: Mutex::new(PoolState {
                    live: 0,
                    closed: false,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Live clients: idle in the free-list plus checked out.
    pub fn live(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Pre-warm `idle_min` clients serially. Any construction failure aborts
    /// with that error.
    pub async fn open(&self) -> Result<(), Error> {
        for _ in 0..self.inner.config.idle_min {
            let client = self.inner.factory.new_client().await?;
            self.inner.state.lock().live += 1;
            if self.inner.free_tx.try_send(client).is_err() {
                // Free-list capacity is at least idle_min by normalization.
                unreachable!("free-list cannot be full during open");
            }
        }
        Ok(())
    }

    /// Acquire a client handle. Never fails at the call site: acquisition
    /// errors ride inside the handle.
    pub async fn get(&self) -> PooledClient {
        let slot = self.acquire().await;
        if let Err(err) = &slot {
            tracing::debug!(err = %err, "pool acquisition failed; returning sentinel handle");
        }
        PooledClient {
            pool: self.clone(),
            slot: Mutex::new(slot),
        }
    }

    /// Close the pool: blocked `get`s return [`Error::PoolClosed`], the
    /// free-list drains and every idle client is closed. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.cancel.cancel();

        let mut rx = self.inner.free_rx.lock().await;
        rx.close();
        while let Ok(client) = rx.try_recv() {
            client.close();
            self.inner.state.lock().live -= 1;
        }
    }

    async fn acquire(&self) -> Result<Client, Error> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        // Fast path: an idle client is ready and nobody is waiting.
        if let Ok(mut rx) = self.inner.free_rx.try_lock() {
            if let Ok(client) = rx.try_recv() {
                return Ok(client);
            }
        }

        // Construction path: reserve a live slot before asking the factory,
        // so the ceiling holds even under concurrent acquisition.
        let reserved = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if state.live < self.inner.config.max {
                state.live += 1;
                true
            } else {
                false
            }
        };
        if reserved {
            match self.inner.factory.new_client().await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    self.inner.state.lock().live -= 1;
                    return Err(err);
                }
            }
        }

        // Saturated: wait for a returned handle or pool shutdown.
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::PoolClosed),
            client = async {
                self.inner.free_rx.lock().await.recv().await
            } => client.ok_or(Error::PoolClosed),
        }
    }

    /// Return path for handles. Offers the client back non-blockingly; a
    /// saturated (or closed) free-list closes the client for real.
    fn put(&self, client: Client) {
        if self.is_closed() {
            client.close();
            return;
        }
        if let Err(rejected) = self.inner.free_tx.try_send(client) {
            let client = match rejected {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            };
            self.inner.state.lock().live -= 1;
            client.close();
        }
    }
}

/// A checked-out client. Forwards the client surface; `close` (or drop)
/// returns the inner client to the pool instead of closing it.
pub struct PooledClient {
    pool: Pool,
    slot: Mutex<Result<Client, Error>>,
}

impl PooledClient {
    fn client(&self) -> Result<Client, Error> {
        self.slot.lock().clone()
    }

    /// The acquisition error, if this handle is a sentinel.
    pub fn error(&self) -> Option<Error> {
        self.slot.lock().as_ref().err().cloned()
    }

    /// Detach the inner client and offer it back to the pool. After this,
    /// every operation on the handle fails with [`Error::ClientClosed`].
    pub fn close(&self) {
        let prev = std::mem::replace(&mut *self.slot.lock(), Err(Error::ClientClosed));
        if let Ok(client) = prev {
            self.pool.put(client);
        }
    }

    pub async fn dial(&self, addr: impl Into<String>) -> Result<(), Error> {
        self.client()?.dial(addr).await
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.client()?.disconnect().await;
        Ok(())
    }

    pub async fn send(&self, msg: Box<dyn Message>) -> Result<(), Error> {
        self.client()?.send(msg).await
    }

    pub async fn send_timeout(&self, msg: Box<dyn Message>, timeout: Duration) -> Result<(), Error> {
        self.client()?.send_timeout(msg, timeout).await
    }

    pub async fn call(&self, req: Box<dyn Request>) -> Result<Box<dyn Message>, Error> {
        self.client()?.call(req).await
    }

    pub async fn call_timeout(
        &self,
        req: Box<dyn Request>,
        timeout: Duration,
    ) -> Result<Box<dyn Message>, Error> {
        self.client()?.call_timeout(req, timeout).await
    }

    pub fn is_connected(&self) -> bool {
        self.client().map(|c| c.is_connected()).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.client().map(|c| c.is_closed()).unwrap_or(true)
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DialFn, DialFuture};
    use crate::config::ClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inert_dialer() -> DialFn {
        Arc::new(|_addr: String| -> DialFuture {
            Box::pin(async { Err(std::io::Error::other("inert")) })
        })
    }

    /// Hands out disconnected clients; good enough for pool accounting.
    struct InertFactory {
        built: AtomicUsize,
        fail: bool,
    }

    impl InertFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                built: AtomicUsize::new(0),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl ClientFactory for InertFactory {
        async fn new_client(&self) -> Result<Client, Error> {
            if self.fail {
                return Err(Error::app(std::io::Error::other("factory down")));
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Client::new(inert_dialer(), ClientConfig::default()))
        }
    }

    #[tokio::test]
    async fn open_prewarms_idle_min() {
        let factory = InertFactory::new();
        let pool = Pool::new(
            factory.clone(),
            PoolConfig {
                idle_min: 2,
                idle_max: 4,
                max: 4,
            },
        );
        pool.open().await.unwrap();
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        assert_eq!(pool.live(), 2);

        // Both pre-warmed clients are reused without construction.
        let h1 = pool.get().await;
        let h2 = pool.get().await;
        assert!(h1.error().is_none());
        assert!(h2.error().is_none());
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_open_aborts_with_factory_error() {
        let factory = Arc::new(InertFactory {
            built: AtomicUsize::new(0),
            fail: true,
        });
        let pool = Pool::new(
            factory,
            PoolConfig {
                idle_min: 1,
                idle_max: 1,
                max: 1,
            },
        );
        assert!(matches!(pool.open().await, Err(Error::App(_))));
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn saturated_get_blocks_until_handle_returns() {
        let factory = InertFactory::new();
        let pool = Pool::new(
            factory.clone(),
            PoolConfig {
                idle_min: 0,
                idle_max: 1,
                max: 2,
            },
        );
        pool.open().await.unwrap();

        let h1 = pool.get().await;
        let h2 = pool.get().await;
        assert!(h1.error().is_none() && h2.error().is_none());
        assert_eq!(pool.live(), 2);

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        h1.close();
        let h3 = blocked.await.unwrap();
        assert!(h3.error().is_none());
        assert_eq!(pool.live(), 2);

        // idle_max is 1: returning both remaining handles overflows the
        // free-list and closes one client for real.
        h2.close();
        h3.close();
        assert_eq!(pool.live(), 1);

        pool.close().await;
        assert_eq!(pool.live(), 0);
    }

    #[tokio::test]
    async fn closed_pool_hands_out_sentinels_and_unblocks_waiters() {
        let factory = InertFactory::new();
        let pool = Pool::new(
            factory,
            PoolConfig {
                idle_min: 0,
                idle_max: 1,
                max: 1,
            },
        );
        pool.open().await.unwrap();

        let h1 = pool.get().await;
        assert!(h1.error().is_none());

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await;
        pool.close().await;
        let sentinel = blocked.await.unwrap();
        assert!(matches!(sentinel.error(), Some(Error::PoolClosed)));
        assert!(matches!(
            sentinel.call(sentinel_request()).await,
            Err(Error::PoolClosed)
        ));

        // A handle returned after close closes its client immediately.
        h1.close();
        let late = pool.get().await;
        assert!(matches!(late.error(), Some(Error::PoolClosed)));
    }

    fn sentinel_request() -> Box<dyn Request> {
        struct Req;
        impl Message for Req {
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        impl Request for Req {
            fn id(&self) -> u64 {
                1
            }
        }
        Box::new(Req)
    }
}
